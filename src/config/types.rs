/// Core types shared by the supervisor and the worker
use crate::config::policy::Policy;
use crate::config::settings::DEFAULT_MAX_RESPONSE_BYTES;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Exit code reserved for wall-clock timeouts.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported when the worker process could not be started.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Failure taxonomy - closed set, serialized in snake_case.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Code failed to parse; nothing ran.
    CompileError,
    /// Code tried to load a module outside the policy.
    ImportBlocked,
    /// Code referenced a primitive the namespace does not provide.
    PrimitiveUnavailable,
    /// Any other error raised while running.
    RuntimeFailure,
    /// Memory or CPU-time ceiling breached.
    ResourceExceeded,
    /// The result value cannot be carried over the IPC channel.
    SerializationError,
    /// Wall-clock ceiling breached (supervisor only).
    Timeout,
    /// The worker produced no valid response.
    ProtocolError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::CompileError => "compile_error",
            ErrorKind::ImportBlocked => "import_blocked",
            ErrorKind::PrimitiveUnavailable => "primitive_unavailable",
            ErrorKind::RuntimeFailure => "runtime_failure",
            ErrorKind::ResourceExceeded => "resource_exceeded",
            ErrorKind::SerializationError => "serialization_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ProtocolError => "protocol_error",
        };
        f.write_str(name)
    }
}

/// One execution request: code, input values and the policy bounding it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Correlates supervisor and worker log lines.
    #[serde(default = "new_execution_id")]
    pub execution_id: String,
    pub code: String,
    #[serde(default)]
    pub input_data: Map<String, Value>,
    #[serde(default)]
    pub policy: Policy,
    /// Largest response document the supervisor will read back.
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
}

fn default_max_response_bytes() -> usize {
    DEFAULT_MAX_RESPONSE_BYTES
}

fn new_execution_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            execution_id: new_execution_id(),
            code: code.into(),
            input_data: Map::new(),
            policy: Policy::default(),
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }

    pub fn with_input(mut self, input_data: Map<String, Value>) -> Self {
        self.input_data = input_data;
        self
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_response_bytes(mut self, bytes: usize) -> Self {
        self.max_response_bytes = bytes;
        self
    }
}

/// Outcome of one execution, owned by the caller.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub ok: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub resource_exceeded: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    pub exit_code: i32,
    /// Wall-clock time from spawn to reap, in milliseconds.
    #[serde(default)]
    pub wall_time_ms: u64,
}

impl ExecutionResult {
    /// Result for a worker killed at the wall-clock deadline.
    pub fn timed_out(timeout_seconds: u64) -> Self {
        Self {
            ok: false,
            timed_out: true,
            error: Some(format!("Execution timed out after {timeout_seconds}s")),
            error_kind: Some(ErrorKind::Timeout),
            exit_code: TIMEOUT_EXIT_CODE,
            ..Self::default()
        }
    }

    /// Result for a worker that produced no usable response.
    pub fn protocol_error(error: impl Into<String>, stderr: String, exit_code: i32) -> Self {
        Self {
            ok: false,
            stderr,
            error: Some(error.into()),
            error_kind: Some(ErrorKind::ProtocolError),
            exit_code,
            ..Self::default()
        }
    }
}

/// Custom error types for scriptbox
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Policy error: {0}")]
    Policy(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("Process error: {0}")]
    Process(String),
}

impl From<nix::errno::Errno> for SandboxError {
    fn from(err: nix::errno::Errno) -> Self {
        SandboxError::Process(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
