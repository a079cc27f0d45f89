//! Worker role: runs exactly one script and reports one response.
//!
//! The pipeline is a type-state chain so a script can never be compiled
//! before the OS ceilings are in place or run before the namespace exists:
//!
//! `Init -> LimitsApplied -> NamespaceBuilt -> Compiled -> WorkerResponse`

pub mod classify;
pub mod convert;
pub mod imports;
pub mod limits;
pub mod modules;
pub mod namespace;
pub mod primitives;

use crate::config::types::{ErrorKind, ExecutionRequest};
use crate::core::protocol::{encoded_len, read_request, write_response, WorkerResponse};
use classify::{classify_parse_error, classify_runtime_error, Outcome};
use convert::dynamic_to_json;
use limits::{platform_limiter, NoopLimiter, ResourceLimiter};
use namespace::Namespace;
use primitives::PRIMITIVE_NAMES;
use rhai::{Dynamic, AST};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Exit code when the request on stdin could not be decoded.
pub const BAD_REQUEST_EXIT_CODE: i32 = 2;

/// Exit code when the response could not be written.
pub const WRITE_FAILURE_EXIT_CODE: i32 = 1;

/// Type-state marker: request decoded, nothing applied yet
pub struct Init;

/// Type-state marker: OS ceilings applied to this process
pub struct LimitsApplied;

/// Type-state marker: restricted runtime ready
pub struct NamespaceBuilt {
    namespace: Namespace,
}

/// Type-state marker: code parsed, ready to run
pub struct Compiled {
    namespace: Namespace,
    ast: AST,
}

/// One execution moving through the worker pipeline.
pub struct Worker<S> {
    request: ExecutionRequest,
    stage: S,
}

impl Worker<Init> {
    pub fn new(request: ExecutionRequest) -> Self {
        Self {
            request,
            stage: Init,
        }
    }

    pub fn apply_limits(self, limiter: &dyn ResourceLimiter) -> Worker<LimitsApplied> {
        log::debug!(
            "[{}] applying limits via {}",
            self.request.execution_id,
            limiter.name()
        );
        limiter.apply(&self.request.policy);
        Worker {
            request: self.request,
            stage: LimitsApplied,
        }
    }
}

impl Worker<LimitsApplied> {
    pub fn build_namespace(self) -> Worker<NamespaceBuilt> {
        let namespace = Namespace::build(&self.request.policy, &self.request.input_data);
        Worker {
            request: self.request,
            stage: NamespaceBuilt { namespace },
        }
    }
}

impl Worker<NamespaceBuilt> {
    /// Parse the code. A parse failure ends the execution before any of the
    /// script runs.
    pub fn compile(self) -> Result<Worker<Compiled>, WorkerResponse> {
        let NamespaceBuilt { namespace } = self.stage;
        match namespace.engine.compile(&self.request.code) {
            Ok(ast) => Ok(Worker {
                request: self.request,
                stage: Compiled { namespace, ast },
            }),
            Err(err) => {
                let (kind, message) = classify_parse_error(&err, namespace.primitives.disabled());
                log::info!("[{}] compile failed: {message}", self.request.execution_id);
                Err(WorkerResponse::failure(kind, message))
            }
        }
    }
}

impl Worker<Compiled> {
    pub fn run(self) -> WorkerResponse {
        let Compiled {
            mut namespace,
            ast,
        } = self.stage;
        let id = &self.request.execution_id;

        let outcome = match namespace.engine.run_ast_with_scope(&mut namespace.scope, &ast) {
            Ok(()) => Outcome::Finished,
            Err(err) => {
                log::debug!("[{id}] script stopped: {err}");
                classify_runtime_error(&err, PRIMITIVE_NAMES, namespace.primitives.disabled())
            }
        };

        let (stdout, stderr) = namespace.output.snapshot();
        match outcome {
            Outcome::Finished => {
                let value = namespace
                    .scope
                    .get_value::<Dynamic>("result")
                    .unwrap_or(Dynamic::UNIT);
                match dynamic_to_json(&value) {
                    Ok(result) => {
                        let response = WorkerResponse::success(result, stdout, stderr);
                        fit_response(response, self.request.max_response_bytes, id)
                    }
                    Err(message) => {
                        log::info!("[{id}] result not serializable: {message}");
                        WorkerResponse::failure(
                            ErrorKind::SerializationError,
                            format!("TypeError: {message}"),
                        )
                        .with_output(stdout, stderr)
                    }
                }
            }
            Outcome::Failed(kind, message) => {
                log::info!("[{id}] {kind}: {message}");
                WorkerResponse::failure(kind, message).with_output(stdout, stderr)
            }
        }
    }
}

/// Replace a response the supervisor could not read back in full with a
/// serialization failure that keeps the captured output.
fn fit_response(response: WorkerResponse, limit: usize, id: &str) -> WorkerResponse {
    let size = match encoded_len(&response) {
        Ok(size) => size,
        Err(e) => {
            return WorkerResponse::failure(ErrorKind::SerializationError, format!("TypeError: {e}"))
                .with_output(response.stdout, response.stderr)
        }
    };
    if size <= limit {
        return response;
    }
    log::info!("[{id}] response of {size} bytes exceeds the {limit} byte limit");
    WorkerResponse::failure(
        ErrorKind::SerializationError,
        format!("OverflowError: result too large to return ({size} bytes, limit {limit})"),
    )
    .with_output(response.stdout, response.stderr)
}

/// Run one request in this process without OS ceilings.
///
/// Wall-clock enforcement needs a separate process; use the supervisor for
/// anything untrusted.
pub fn execute(request: ExecutionRequest) -> WorkerResponse {
    execute_with(request, &NoopLimiter)
}

pub fn execute_with(request: ExecutionRequest, limiter: &dyn ResourceLimiter) -> WorkerResponse {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let worker = Worker::new(request)
            .apply_limits(limiter)
            .build_namespace();
        match worker.compile() {
            Ok(compiled) => compiled.run(),
            Err(response) => response,
        }
    }));
    outcome.unwrap_or_else(|panic| {
        let detail = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        log::error!("worker panicked: {detail}");
        WorkerResponse::failure(
            ErrorKind::RuntimeFailure,
            format!("RuntimeError: internal error: {detail}"),
        )
    })
}

/// Entry point of the worker role: one request from stdin, one response
/// to stdout. Returns the process exit code.
pub fn run_worker_main() -> i32 {
    let stdin = std::io::stdin();
    let response = match read_request(stdin.lock()) {
        Ok(request) => {
            log::debug!("[{}] worker started", request.execution_id);
            let limiter = platform_limiter();
            execute_with(request, limiter.as_ref())
        }
        Err(e) => {
            log::error!("worker could not read request: {e}");
            let response = WorkerResponse::failure(ErrorKind::ProtocolError, e.to_string());
            return match write_response(std::io::stdout().lock(), &response) {
                Ok(()) => BAD_REQUEST_EXIT_CODE,
                Err(_) => WRITE_FAILURE_EXIT_CODE,
            };
        }
    };

    match write_response(std::io::stdout().lock(), &response) {
        Ok(()) => 0,
        Err(e) => {
            log::error!("worker could not write response: {e}");
            WRITE_FAILURE_EXIT_CODE
        }
    }
}
