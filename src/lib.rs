//! Model selection over combinatorial model spaces.
//!
//! A model subspace is a base model plus parameter axes, each axis a finite
//! domain of fixed values and/or "estimated". The engine enumerates the union
//! of subspaces, proposes batches of candidate models under a search
//! strategy, hands them to an external calibrator and ranks the results by
//! an information criterion until the search converges.
//!
//! # Architecture
//!
//! - `schema`: Configuration, ledger and result types (serde)
//! - `select`: Criteria, models, subspaces, the candidate space state
//!   machine and the `Problem` orchestrator
//! - `checkpoint`: Persisted search state for resumable runs
//!
//! # Example
//!
//! ```rust,no_run
//! use model_select::{
//!     schema::{AxisSpec, CriterionKind, ProblemConfig, SearchMethod, SubspaceSpec},
//!     select::{Problem, SyntheticCalibrator},
//! };
//!
//! let subspace = SubspaceSpec {
//!     id: "M".to_string(),
//!     base: "model.xml".to_string(),
//!     dataset: None,
//!     axes: vec![AxisSpec::toggle("k1", 0.0), AxisSpec::toggle("k2", 0.0)],
//! };
//! let config = ProblemConfig::new(CriterionKind::Aic, SearchMethod::default(), vec![subspace]);
//!
//! let calibrator = SyntheticCalibrator::new(100.0, 50).with_effect("k1", -8.0);
//! let mut problem = Problem::new(config)?;
//! let result = problem.run_to_completion(&calibrator)?;
//!
//! if let Some(best) = &result.incumbent {
//!     println!("Selected {} ({:?})", best.label(), result.stats.stop_reason);
//! }
//! # Ok::<(), model_select::select::SearchError>(())
//! ```

pub mod checkpoint;
pub mod schema;
pub mod select;

// Re-export commonly used types
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use schema::{CriterionKind, ProblemConfig, SearchMethod, SearchResult};
pub use select::{Calibrator, Model, ModelId, Problem, SearchError};
