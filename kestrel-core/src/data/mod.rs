//! Inbound data handling
//!
//! - [`EnvelopeValidator`]: strict envelope and payload validation
//! - [`DeadLetterRecord`]: what is kept when validation fails
//! - [`TwoSidedQuote`]: bid-only quotes with derived asks

pub mod dead_letter;
pub mod quote;
pub mod validator;

pub use dead_letter::{DeadLetterRecord, DeadLetterStore};
pub use quote::{cents_to_probability, probability_to_cents, TwoSidedQuote};
pub use validator::{EnvelopeValidator, ValidationError};
