/// Supervisor settings resolved from the environment.
use crate::config::types::{Result, SandboxError};
use std::path::PathBuf;
use std::time::Duration;

/// Overrides the program launched as the worker.
pub const WORKER_ENV: &str = "SCRIPTBOX_WORKER";
/// Overrides the startup grace added to every deadline, in milliseconds.
pub const STARTUP_GRACE_ENV: &str = "SCRIPTBOX_STARTUP_GRACE_MS";

pub const DEFAULT_STARTUP_GRACE_MS: u64 = 500;
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;
pub const DEFAULT_COLLECTION_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Program started for each execution.
    pub worker_program: PathBuf,
    /// Arguments selecting the worker role.
    pub worker_args: Vec<String>,
    /// Extra wall time granted for process startup on top of the policy timeout.
    pub startup_grace: Duration,
    /// Cap on the worker's response document.
    pub max_response_bytes: usize,
    pub poll_interval: Duration,
    /// How long to wait for pipe readers once the worker has exited.
    pub collection_timeout: Duration,
}

impl SupervisorConfig {
    pub fn new(worker_program: impl Into<PathBuf>) -> Self {
        Self {
            worker_program: worker_program.into(),
            worker_args: vec!["--internal-role".to_string(), "worker".to_string()],
            startup_grace: Duration::from_millis(DEFAULT_STARTUP_GRACE_MS),
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            collection_timeout: Duration::from_millis(DEFAULT_COLLECTION_TIMEOUT_MS),
        }
    }

    /// Resolve the worker program and grace period from the environment.
    ///
    /// Without `SCRIPTBOX_WORKER` the current executable is re-launched.
    pub fn from_env() -> Result<Self> {
        let worker_program = match std::env::var_os(WORKER_ENV) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => std::env::current_exe()?,
        };
        let mut config = Self::new(worker_program);

        if let Ok(raw) = std::env::var(STARTUP_GRACE_ENV) {
            let millis = raw.trim().parse::<u64>().map_err(|e| {
                SandboxError::Config(format!("{STARTUP_GRACE_ENV}={raw:?} is not a number: {e}"))
            })?;
            config.startup_grace = Duration::from_millis(millis);
        }

        Ok(config)
    }

    pub fn with_worker_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.worker_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    pub fn with_max_response_bytes(mut self, bytes: usize) -> Self {
        self.max_response_bytes = bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_uses_documented_defaults() {
        let config = SupervisorConfig::new("/bin/true");
        assert_eq!(config.worker_program, PathBuf::from("/bin/true"));
        assert_eq!(config.worker_args, ["--internal-role", "worker"]);
        assert_eq!(config.startup_grace, Duration::from_millis(500));
        assert_eq!(config.max_response_bytes, 16 * 1024 * 1024);
        assert_eq!(config.poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn builders_override_fields() {
        let config = SupervisorConfig::new("worker")
            .with_startup_grace(Duration::ZERO)
            .with_max_response_bytes(64);
        assert_eq!(config.startup_grace, Duration::ZERO);
        assert_eq!(config.max_response_bytes, 64);
    }
}
