//! Run configuration
//!
//! Configuration and report types, the error taxonomy, and validation.

pub mod types;
pub mod validator;
