use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine-level error taxonomy. Row- and field-level validation problems are
/// captured into result structures and never surface through this type; only
/// failures that stop an operation outright do.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{entity_type} '{key}' not found")]
    NotFound { entity_type: String, key: String },

    /// Version mismatch at commit time. Retried a bounded number of times by
    /// the patch engine before it reaches a caller.
    #[error("version conflict on {entity_type} '{key}'")]
    Conflict { entity_type: String, key: String },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("validation failed: {0}")]
    Validation(String),

    /// Structural failure before any row of a bulk run could be evaluated.
    #[error("import aborted: {0}")]
    PipelineAbort(String),

    #[error("internal failure: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn not_found(entity_type: &str, key: &str) -> Self {
        EngineError::NotFound {
            entity_type: entity_type.to_string(),
            key: key.to_string(),
        }
    }

    pub fn conflict(entity_type: &str, key: &str) -> Self {
        EngineError::Conflict {
            entity_type: entity_type.to_string(),
            key: key.to_string(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        EngineError::Internal(anyhow::anyhow!(message.into()))
    }
}
