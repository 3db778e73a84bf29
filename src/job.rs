use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::change::record::now_millis;
use crate::csv::ImportReport;
use crate::error::{EngineError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// What a finished bulk job produced.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPayload {
    Import(ImportReport),
    Export(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BulkJob {
    pub job_id: String,
    pub state: JobState,
    pub result: Option<JobPayload>,
    pub error: Option<String>,
    pub created_at: i64,
}

/// Cooperative cancellation flag, checked by the pipeline at row
/// boundaries, never mid-row.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Process-scoped registry of bulk jobs. Each submission runs on its own
/// thread; `submit` never blocks on the work. Jobs stay retrievable after
/// reaching a terminal state until explicitly removed.
#[derive(Clone, Default)]
pub struct JobRunner {
    jobs: Arc<RwLock<HashMap<String, BulkJob>>>,
    tokens: Arc<RwLock<HashMap<String, CancelToken>>>,
}

impl JobRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new job and starts it on a detached thread, returning the
    /// fresh job id immediately. Two identical submissions produce two
    /// independent jobs.
    pub fn submit<F>(&self, work: F) -> Result<String>
    where
        F: FnOnce(&CancelToken) -> Result<JobPayload> + Send + 'static,
    {
        let job_id = Uuid::now_v7().to_string();
        let job = BulkJob {
            job_id: job_id.clone(),
            state: JobState::Pending,
            result: None,
            error: None,
            created_at: now_millis(),
        };
        let token = CancelToken::new();
        {
            let mut jobs = self
                .jobs
                .write()
                .map_err(|_| EngineError::internal("failed to acquire write lock"))?;
            jobs.insert(job_id.clone(), job);
        }
        {
            let mut tokens = self
                .tokens
                .write()
                .map_err(|_| EngineError::internal("failed to acquire write lock"))?;
            tokens.insert(job_id.clone(), token.clone());
        }

        let jobs = self.jobs.clone();
        let id = job_id.clone();
        thread::spawn(move || {
            set_state(&jobs, &id, JobState::Running);
            log::debug!("job {} running", id);
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| work(&token)));

            let Ok(mut registry) = jobs.write() else {
                log::error!("job {} registry lock poisoned, result lost", id);
                return;
            };
            let Some(job) = registry.get_mut(&id) else {
                return;
            };
            match outcome {
                Ok(Ok(payload)) => {
                    job.state = JobState::Completed;
                    job.result = Some(payload);
                    log::debug!("job {} completed", id);
                }
                Ok(Err(error)) => {
                    log::warn!("job {} failed: {}", id, error);
                    job.state = JobState::Failed;
                    job.error = Some(error.to_string());
                }
                Err(_) => {
                    log::warn!("job {} panicked", id);
                    job.state = JobState::Failed;
                    job.error = Some("job panicked".to_string());
                }
            }
        });

        Ok(job_id)
    }

    /// Idempotent read of a job's current state.
    pub fn status(&self, job_id: &str) -> Result<Option<BulkJob>> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| EngineError::internal("failed to acquire read lock"))?;
        Ok(jobs.get(job_id).cloned())
    }

    /// Requests cooperative cancellation. Returns whether a live job was
    /// asked to stop.
    pub fn cancel(&self, job_id: &str) -> Result<bool> {
        let tokens = self
            .tokens
            .read()
            .map_err(|_| EngineError::internal("failed to acquire read lock"))?;
        let Some(token) = tokens.get(job_id) else {
            return Ok(false);
        };
        let live = match self.status(job_id)? {
            Some(job) => !job.state.is_terminal(),
            None => false,
        };
        if live {
            log::info!("cancelling job {}", job_id);
            token.cancel();
        }
        Ok(live)
    }

    /// Removes a terminal job from the registry and returns it. A job that
    /// is still pending or running is left alone.
    pub fn remove(&self, job_id: &str) -> Result<Option<BulkJob>> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| EngineError::internal("failed to acquire write lock"))?;
        let terminal = jobs
            .get(job_id)
            .map(|job| job.state.is_terminal())
            .unwrap_or(false);
        if !terminal {
            return Ok(None);
        }
        let removed = jobs.remove(job_id);
        drop(jobs);
        if let Ok(mut tokens) = self.tokens.write() {
            tokens.remove(job_id);
        }
        Ok(removed)
    }
}

fn set_state(jobs: &Arc<RwLock<HashMap<String, BulkJob>>>, job_id: &str, state: JobState) {
    if let Ok(mut registry) = jobs.write() {
        if let Some(job) = registry.get_mut(job_id) {
            job.state = state;
        }
    }
}
