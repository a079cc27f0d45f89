//! Supervisor side of the sandbox.
//!
//! The supervisor owns the worker process lifecycle and the wall-clock
//! deadline; the protocol module defines the one-shot JSON exchange both
//! roles speak.

pub mod protocol;
pub mod supervisor;
