//! Supervisor/worker wire protocol: exactly one JSON document in each
//! direction, request on the worker's stdin, response on its stdout.
use crate::config::types::{ErrorKind, ExecutionRequest, ExecutionResult, Result, SandboxError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{Read, Write};

/// What the worker reports back. The supervisor adds `exit_code` and
/// `wall_time_ms` to make an [`ExecutionResult`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
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
}

impl WorkerResponse {
    pub fn success(result: Value, stdout: String, stderr: String) -> Self {
        Self {
            ok: true,
            result,
            stdout,
            stderr,
            ..Self::default()
        }
    }

    pub fn failure(kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            resource_exceeded: kind == ErrorKind::ResourceExceeded,
            error: Some(error.into()),
            error_kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, stdout: String, stderr: String) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    pub fn into_result(self, exit_code: i32, wall_time_ms: u64) -> ExecutionResult {
        ExecutionResult {
            ok: self.ok,
            result: self.result,
            stdout: self.stdout,
            stderr: self.stderr,
            timed_out: self.timed_out,
            resource_exceeded: self.resource_exceeded,
            error: self.error,
            error_kind: self.error_kind,
            exit_code,
            wall_time_ms,
        }
    }
}

fn read_json<R: Read, T: DeserializeOwned>(mut reader: R, what: &str) -> Result<T> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    serde_json::from_slice(&data)
        .map_err(|e| SandboxError::Protocol(format!("failed to decode {what}: {e}")))
}

fn write_json<W: Write, T: Serialize>(mut writer: W, value: &T, what: &str) -> Result<()> {
    let payload = serde_json::to_vec(value)
        .map_err(|e| SandboxError::Protocol(format!("failed to encode {what}: {e}")))?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Size of `response` on the wire.
pub fn encoded_len(response: &WorkerResponse) -> Result<usize> {
    serde_json::to_vec(response)
        .map(|bytes| bytes.len())
        .map_err(|e| SandboxError::Protocol(format!("failed to encode response: {e}")))
}

pub fn encode_request(request: &ExecutionRequest) -> Result<Vec<u8>> {
    serde_json::to_vec(request)
        .map_err(|e| SandboxError::Protocol(format!("failed to encode request: {e}")))
}

pub fn read_request<R: Read>(reader: R) -> Result<ExecutionRequest> {
    read_json(reader, "request")
}

pub fn write_response<W: Write>(writer: W, response: &WorkerResponse) -> Result<()> {
    write_json(writer, response, "response")
}

/// Decode the worker's stdout. Anything other than a single response
/// object, including empty output, is an error.
pub fn decode_response(bytes: &[u8]) -> Result<WorkerResponse> {
    read_json(bytes, "response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_survives_the_pipe() {
        let response = WorkerResponse::success(json!({"x": 1}), "hi\n".into(), String::new());
        let mut wire = Vec::new();
        write_response(&mut wire, &response).unwrap();
        assert_eq!(decode_response(&wire).unwrap(), response);
    }

    #[test]
    fn empty_or_garbage_output_is_rejected() {
        assert!(decode_response(b"").is_err());
        assert!(decode_response(b"Traceback: boom").is_err());
        assert!(decode_response(b"[1, 2]").is_err());
    }

    #[test]
    fn failure_marks_resource_exceeded() {
        let response = WorkerResponse::failure(ErrorKind::ResourceExceeded, "Memory limit exceeded");
        assert!(response.resource_exceeded);
        let other = WorkerResponse::failure(ErrorKind::RuntimeFailure, "TypeError: x");
        assert!(!other.resource_exceeded);
    }

    #[test]
    fn into_result_carries_process_fields() {
        let result = WorkerResponse::failure(ErrorKind::CompileError, "SyntaxError: bad")
            .into_result(0, 12);
        assert!(!result.ok);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.wall_time_ms, 12);
        assert_eq!(result.error_kind, Some(ErrorKind::CompileError));
    }

    #[test]
    fn encoded_len_matches_the_wire() {
        let response = WorkerResponse::success(json!("abc"), "out".into(), String::new());
        let mut wire = Vec::new();
        write_response(&mut wire, &response).unwrap();
        assert_eq!(encoded_len(&response).unwrap(), wire.len());
    }

    #[test]
    fn request_reads_back() {
        let request = ExecutionRequest::new("result = 1;");
        let bytes = encode_request(&request).unwrap();
        let back = read_request(bytes.as_slice()).unwrap();
        assert_eq!(back.code, "result = 1;");
        assert_eq!(back.execution_id, request.execution_id);
    }
}
