use crate::config::settings::SupervisorConfig;
use crate::config::types::{
    ExecutionRequest, ExecutionResult, Result, SandboxError, SPAWN_FAILURE_EXIT_CODE,
};
use crate::core::protocol::{decode_response, encode_request};
use crate::utils::output::{collect_streams, spawn_reader, truncate_utf8, StreamIntegrity};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io::Write;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Instant;

/// Message used when the worker's stdout is not a response document.
pub const INVALID_RESPONSE_MESSAGE: &str = "Runner returned invalid JSON";

/// What happened when a worker had to be killed.
#[derive(Debug, Clone, Default)]
pub struct KillReport {
    pub group_kill_sent: bool,
    pub direct_kill_used: bool,
    pub reaped: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

fn to_process_error(prefix: &str, err: impl std::fmt::Display) -> SandboxError {
    SandboxError::Process(format!("{prefix}: {err}"))
}

/// SIGKILL the worker's whole process group, falling back to the direct
/// child, then reap it.
fn terminate_worker_group(child: &mut Child) -> KillReport {
    let mut report = KillReport::default();
    let start = Instant::now();
    let pid = Pid::from_raw(child.id() as i32);

    match killpg(pid, Signal::SIGKILL) {
        Ok(()) => report.group_kill_sent = true,
        Err(e) => {
            report.notes.push(format!("group SIGKILL failed: {e}"));
            if let Err(e) = child.kill() {
                report.notes.push(format!("direct kill failed: {e}"));
            }
            report.direct_kill_used = true;
        }
    }

    match child.wait() {
        Ok(_) => report.reaped = true,
        Err(e) => report.notes.push(format!("reap failed: {e}")),
    }

    report.waited_ms = start.elapsed().as_millis() as u64;
    report
}

/// Exit code as a shell would report it: the code, or 128 + signal.
fn exit_code_of(status: &ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

/// Whether a worker that died without responding most likely hit an OS
/// resource ceiling.
fn infer_resource_exceeded(status: &ExitStatus, stderr: &str) -> bool {
    match status.signal().and_then(|raw| Signal::try_from(raw).ok()) {
        Some(Signal::SIGKILL) | Some(Signal::SIGXCPU) => true,
        Some(Signal::SIGABRT) => stderr.contains("memory allocation of"),
        _ => false,
    }
}

/// Launches one throwaway worker per execution and bounds it.
#[derive(Debug, Clone)]
pub struct Supervisor {
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::new(SupervisorConfig::from_env()?))
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Run one request to completion. Every failure, including a worker
    /// that could not be started, is reported in the returned result.
    pub fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        let mut result = match self.run(request, started) {
            Ok(result) => result,
            Err(err) => {
                log::error!("[{}] execution failed: {err}", request.execution_id);
                let exit_code = match err {
                    SandboxError::Spawn(_) => SPAWN_FAILURE_EXIT_CODE,
                    _ => 1,
                };
                ExecutionResult::protocol_error(err.to_string(), String::new(), exit_code)
            }
        };
        result.wall_time_ms = started.elapsed().as_millis() as u64;
        result
    }

    fn spawn_worker(&self) -> Result<Child> {
        let mut command = Command::new(&self.config.worker_program);
        command
            .args(&self.config.worker_args)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Ok(filter) = std::env::var("RUST_LOG") {
            command.env("RUST_LOG", filter);
        }

        command.spawn().map_err(|e| {
            SandboxError::Spawn(format!(
                "failed to start worker {}: {e}",
                self.config.worker_program.display()
            ))
        })
    }

    fn run(&self, request: &ExecutionRequest, started: Instant) -> Result<ExecutionResult> {
        let id = &request.execution_id;
        let policy = &request.policy;
        policy.validate()?;
        // The worker sizes its response against the cap this side reads with.
        let payload = encode_request(
            &request
                .clone()
                .with_max_response_bytes(self.config.max_response_bytes),
        )?;

        let mut child = self.spawn_worker()?;
        log::debug!("[{id}] worker pid {} started", child.id());

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Process("worker stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Process("worker stdout not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Process("worker stderr not piped".to_string()))?;

        let writer = thread::spawn(move || {
            let mut stdin = stdin;
            // A worker that dies early closes its end; nothing to recover.
            let _ = stdin.write_all(&payload);
        });
        let stdout_rx = spawn_reader(stdout, self.config.max_response_bytes);
        let stderr_rx = spawn_reader(stderr, policy.max_output_bytes());

        let wall_limit = policy.deadline() + self.config.startup_grace;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if started.elapsed() >= wall_limit {
                        let report = terminate_worker_group(&mut child);
                        let _ = writer.join();
                        log::warn!(
                            "[{id}] worker exceeded {}s, killed (group={}, direct={}, {}ms)",
                            policy.timeout_seconds,
                            report.group_kill_sent,
                            report.direct_kill_used,
                            report.waited_ms
                        );
                        for note in &report.notes {
                            log::warn!("[{id}] {note}");
                        }
                        return Ok(ExecutionResult::timed_out(policy.timeout_seconds));
                    }
                    thread::sleep(self.config.poll_interval);
                }
                Err(e) => {
                    let _ = terminate_worker_group(&mut child);
                    return Err(to_process_error("wait(worker)", e));
                }
            }
        };
        let _ = writer.join();

        let exit_code = exit_code_of(&status);
        let (stdout, stderr) =
            collect_streams(stdout_rx, stderr_rx, self.config.collection_timeout);
        if stdout.integrity == StreamIntegrity::Truncated {
            log::warn!(
                "[{id}] worker response exceeded {} bytes",
                self.config.max_response_bytes
            );
        }
        let limit = policy.max_output_bytes();
        let process_stderr = truncate_utf8(stderr.into_lossy_string(), limit);
        log::debug!("[{id}] worker exited with {exit_code}");

        let response = match decode_response(&stdout.data) {
            Ok(response) => response,
            Err(err) => {
                log::warn!("[{id}] {err}");
                let resource_exceeded = infer_resource_exceeded(&status, &process_stderr);
                let mut result =
                    ExecutionResult::protocol_error(INVALID_RESPONSE_MESSAGE, process_stderr, exit_code);
                result.resource_exceeded = resource_exceeded;
                return Ok(result);
            }
        };

        let mut result = response.into_result(exit_code, 0);
        result.stdout = truncate_utf8(result.stdout, limit);
        result.stderr = if result.stderr.is_empty() {
            process_stderr
        } else {
            truncate_utf8(result.stderr, limit)
        };
        Ok(result)
    }
}

impl Default for Supervisor {
    /// Supervisor that re-launches the current executable as its worker.
    fn default() -> Self {
        let program = std::env::current_exe().unwrap_or_else(|_| "scriptbox".into());
        Self::new(SupervisorConfig::new(program))
    }
}
