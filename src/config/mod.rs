//! Configuration & Policy
//!
//! Execution policy, the shared request/result data model, and the
//! supervisor's environment-driven settings.

pub mod policy;
pub mod settings;
pub mod types;
