//! Pipeline engine
//!
//! - `traits`: the [`Evaluator`] seam the strategy crate plugs into
//! - `pipeline`: [`Pipeline`], which wires validation, the State Builder,
//!   evaluation, persistence and the degraded-mode controller together

pub mod pipeline;
pub mod traits;

pub use pipeline::{IngestOutcome, Pipeline, PipelineStats, TickReport};
pub use traits::{Evaluation, Evaluator};
