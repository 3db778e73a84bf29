pub mod consolidate;
pub mod record;
pub mod recorder;

pub use consolidate::consolidate;
pub use record::{ChangeKind, ChangeRecord, FieldChange, UpdateKind};
pub use recorder::diff;
