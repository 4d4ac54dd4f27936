#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
pub mod pipeline;
pub mod progress;
pub mod reconcile;
pub mod schema;
pub mod split;
pub mod table;

pub use pipeline::{PipelineError, RunConfig, RunSummary, run};
pub use schema::{RunMode, Selection, TableKind};
