//! Select module - Model spaces and the search engine.

mod calibrator;
mod candidate;
mod criterion;
mod model;
mod problem;
mod space;
mod subspace;

pub use calibrator::*;
pub use candidate::*;
pub use criterion::*;
pub use model::*;
pub use problem::*;
pub use space::*;
pub use subspace::*;
