//! Kestrel Strategies - Edge and Opportunity Engines
//!
//! The pure maths of the decision pipeline. Nothing in this crate touches
//! storage or the clock; every function takes the evaluation time it needs.
//!
//! ## Modules
//!
//! - [`probability`]: zero-drift lognormal `P(YES)` for `less`, `greater`
//!   and `between` contracts
//! - [`volatility`]: EWMA sigma from resampled spot history, with
//!   last-good / default fallback ([`SigmaMemory`])
//! - [`fees`]: taker fee schedule, exact decimal ceiling
//! - [`edge`]: [`EdgeEngine`], one [`EdgeSnapshot`] per market per tick
//!   with an explicit skip-reason taxonomy
//! - [`opportunity`]: [`OpportunityEngine`], one [`OpportunityDecision`]
//!   per market per tick
//! - [`evaluator`]: [`EdgeEvaluator`], the [`Evaluator`] the pipeline runs
//!
//! ## Usage
//!
//! ```ignore
//! use kestrel_core::{config::KestrelConfig, Pipeline, StateBuilder};
//! use kestrel_strategies::EdgeEvaluator;
//!
//! let config = KestrelConfig::default();
//! let evaluator = EdgeEvaluator::new(config.edge.clone(), config.opportunity.clone());
//! let builder = StateBuilder::new(config.ingest.clone());
//! let mut pipeline = Pipeline::new(&config, builder, evaluator, sink);
//! ```
//!
//! [`EdgeSnapshot`]: kestrel_core::records::EdgeSnapshot
//! [`OpportunityDecision`]: kestrel_core::records::OpportunityDecision
//! [`Evaluator`]: kestrel_core::engine::Evaluator

pub mod edge;
pub mod evaluator;
pub mod fees;
pub mod opportunity;
pub mod probability;
pub mod volatility;

pub use edge::EdgeEngine;
pub use evaluator::EdgeEvaluator;
pub use fees::{fee_per_contract, taker_fee};
pub use opportunity::{IneligibleReason, OpportunityEngine};
pub use probability::{prob_yes, year_fraction, SECONDS_PER_YEAR};
pub use volatility::{SigmaChoice, SigmaMemory, SigmaRejection, VolatilityEstimator};
