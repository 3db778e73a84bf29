use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowStatus {
    Success,
    Failure,
}

/// Outcome of one data row, in input order. `row_number` is 1-based and
/// counts data rows, not the header.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RowResult {
    pub row_number: usize,
    pub status: RowStatus,
    pub errors: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportStatus {
    Success,
    PartialSuccess,
    Failure,
    /// The run was cancelled between rows; counts cover what was processed.
    Aborted,
}

/// Aggregate result of one pipeline run, detailed enough to correct and
/// resubmit only the failed rows.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImportReport {
    pub total_rows: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub status: ImportStatus,
    pub dry_run: bool,
    pub row_results: Vec<RowResult>,
    /// Result header plus every input row echoed with its status and
    /// details inline.
    pub result_rows: Vec<String>,
}

impl ImportReport {
    /// The echoed result payload as one CSV document.
    pub fn results_csv(&self) -> String {
        self.result_rows.join("\n")
    }
}
