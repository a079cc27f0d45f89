//! scriptbox: policy-bounded execution of untrusted scripts
//!
//! Each execution runs in a throwaway worker process. The supervisor owns
//! the wall-clock deadline and the worker's lifecycle; the worker builds a
//! restricted runtime from the execution policy, runs the script once and
//! answers with a single JSON document.
//!
//! # Architecture
//!
//! ## Configuration & Policy ([`config`])
//! - [`config::policy`]: Ceilings plus import and primitive permission lists
//! - [`config::types`]: Request/result data model and the error taxonomy
//! - [`config::settings`]: Supervisor settings from the environment
//!
//! ## Supervisor ([`core`])
//! - [`core::supervisor`]: Spawn, deadline, kill and result assembly
//! - [`core::protocol`]: One-shot JSON exchange over stdin/stdout
//!
//! ## Worker ([`worker`])
//! - [`worker::limits`]: OS ceilings and the CPU-time budget
//! - [`worker::namespace`]: Restricted engine and initial scope
//! - [`worker::primitives`]: Callable names a policy can grant
//! - [`worker::imports`]: Import guard over the module catalog
//! - [`worker::modules`]: Importable modules
//! - [`worker::classify`]: Engine failures to error kinds
//! - [`worker::convert`]: JSON <-> script values
//!
//! ## Utilities ([`utils`])
//! - [`utils::output`]: Bounded output capture
//!
//! # Embedding
//!
//! The supervisor launches `SCRIPTBOX_WORKER` (or, when unset, the current
//! executable) with `--internal-role worker`. A host program that is not
//! the `scriptbox` binary must either point `SCRIPTBOX_WORKER` at it or
//! route that argument to [`worker::run_worker_main`].

// Configuration & Policy
pub mod config;

// Supervisor side
pub mod core;

// Worker side
pub mod worker;

// Utilities
pub mod utils;

// CLI
pub mod cli;

pub use config::policy::{PermissionList, Policy};
pub use config::settings::SupervisorConfig;
pub use config::types::{ErrorKind, ExecutionRequest, ExecutionResult, SandboxError};
pub use core::supervisor::Supervisor;

use serde_json::{Map, Value};

/// Execute `code` once with a supervisor configured from the environment.
///
/// Missing input means an empty mapping; a missing policy means
/// [`Policy::default`]. Every failure is reported in the result.
pub fn execute(
    code: &str,
    input_data: Option<Map<String, Value>>,
    policy: Option<Policy>,
) -> ExecutionResult {
    let supervisor = Supervisor::from_env().unwrap_or_else(|e| {
        log::warn!("supervisor settings rejected, using defaults: {e}");
        Supervisor::default()
    });
    let request = ExecutionRequest::new(code)
        .with_input(input_data.unwrap_or_default())
        .with_policy(policy.unwrap_or_default());
    supervisor.execute(&request)
}
