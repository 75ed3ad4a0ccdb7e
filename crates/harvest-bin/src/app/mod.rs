//! Command implementations.

mod backlog;
mod run;

pub use backlog::{drain, purge, show_status};
pub use run::run_pipeline;
