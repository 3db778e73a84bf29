pub mod change;
pub mod csv;
pub mod engine;
pub mod error;
pub mod job;
pub mod patch;
pub mod schema;
pub mod snapshot;
pub mod store;

pub use engine::{CatalogEngine, CatalogEngineBuilder};
pub use error::{EngineError, Result};
