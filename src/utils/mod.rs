//! Utilities
//!
//! Bounded output capture shared by both roles.

pub mod output;
