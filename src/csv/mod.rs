pub mod contract;
pub mod export;
pub mod pipeline;
pub mod types;
pub mod wire;

pub use contract::{ColumnKind, CsvColumn, CsvContract};
pub use pipeline::CsvPipeline;
pub use types::{ImportReport, ImportStatus, RowResult, RowStatus};
