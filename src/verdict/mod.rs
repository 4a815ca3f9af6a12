//! Outcome classification
//!
//! Maps the single termination cause of a run to its reported status.

pub mod classifier;

pub use classifier::{OutcomeClassifier, Termination, Verdict};
