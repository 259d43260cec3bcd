//! Schema module - Configuration and report types for model selection problems.

mod config;
mod report;
mod search;

pub use config::*;
pub use report::*;
pub use search::*;
