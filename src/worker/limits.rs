/// OS resource ceilings for the worker process.
///
/// Ceilings are best effort: a limiter that cannot apply one logs a warning
/// and the execution continues under the wall-clock deadline alone.
use crate::config::policy::Policy;
use crate::config::types::Result;
use std::time::Duration;

/// Seconds of slack between the in-engine CPU check and the kernel's
/// RLIMIT_CPU signal, so the former normally reports first.
pub const CPU_RLIMIT_SLACK_SECONDS: u64 = 1;

/// Applies process-wide ceilings derived from a policy.
pub trait ResourceLimiter {
    fn name(&self) -> &'static str;

    /// Cap the address space, in bytes.
    fn limit_memory(&self, bytes: u64) -> Result<()>;

    /// Cap CPU time, in whole seconds.
    fn limit_cpu(&self, seconds: u64) -> Result<()>;

    /// Apply every ceiling in `policy`, logging the ones that fail.
    fn apply(&self, policy: &Policy) {
        if let Err(e) = self.limit_memory(policy.memory_limit_bytes()) {
            log::warn!("{}: memory limit of {}MB not applied: {e}", self.name(), policy.memory_limit_mb);
        }
        if let Err(e) = self.limit_cpu(policy.cpu_time_seconds) {
            log::warn!("{}: cpu limit of {}s not applied: {e}", self.name(), policy.cpu_time_seconds);
        }
    }
}

/// setrlimit(2) based limiter.
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct RlimitLimiter;

#[cfg(target_os = "linux")]
impl ResourceLimiter for RlimitLimiter {
    fn name(&self) -> &'static str {
        "rlimit"
    }

    fn limit_memory(&self, bytes: u64) -> Result<()> {
        use nix::sys::resource::{setrlimit, Resource};
        setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
        log::debug!("RLIMIT_AS set to {bytes} bytes");
        Ok(())
    }

    fn limit_cpu(&self, seconds: u64) -> Result<()> {
        use nix::sys::resource::{setrlimit, Resource};
        // SIGXCPU at the soft limit, SIGKILL at the hard limit.
        let soft = seconds.saturating_add(CPU_RLIMIT_SLACK_SECONDS);
        setrlimit(Resource::RLIMIT_CPU, soft, soft.saturating_add(1))?;
        log::debug!("RLIMIT_CPU set to {soft}s");
        Ok(())
    }
}

/// Limiter for platforms without rlimits, and for in-process execution.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLimiter;

impl ResourceLimiter for NoopLimiter {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn limit_memory(&self, _bytes: u64) -> Result<()> {
        Ok(())
    }

    fn limit_cpu(&self, _seconds: u64) -> Result<()> {
        Ok(())
    }
}

/// The strongest limiter available on this platform.
pub fn platform_limiter() -> Box<dyn ResourceLimiter> {
    #[cfg(target_os = "linux")]
    {
        Box::new(RlimitLimiter)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(NoopLimiter)
    }
}

/// CPU time (user + system) consumed by the calling thread so far.
///
/// Scripts run on the worker's main thread, so this is the script's CPU
/// time without the noise of other threads in the process.
pub fn thread_cpu_time() -> Option<Duration> {
    use nix::sys::resource::{getrusage, UsageWho};
    #[cfg(target_os = "linux")]
    let who = UsageWho::RUSAGE_THREAD;
    #[cfg(not(target_os = "linux"))]
    let who = UsageWho::RUSAGE_SELF;

    let usage = getrusage(who).ok()?;
    let to_duration = |tv: nix::sys::time::TimeVal| {
        Duration::from_secs(tv.tv_sec().max(0) as u64)
            + Duration::from_micros(tv.tv_usec().max(0) as u64)
    };
    Some(to_duration(usage.user_time()) + to_duration(usage.system_time()))
}

/// CPU-time allowance measured from the moment it is created.
#[derive(Debug, Clone, Copy)]
pub struct CpuBudget {
    baseline: Duration,
    limit: Duration,
}

impl CpuBudget {
    pub fn start(limit: Duration) -> Self {
        Self {
            baseline: thread_cpu_time().unwrap_or_default(),
            limit,
        }
    }

    pub fn used(&self) -> Duration {
        thread_cpu_time()
            .unwrap_or_default()
            .saturating_sub(self.baseline)
    }

    pub fn exhausted(&self) -> bool {
        self.used() > self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_limiter_accepts_everything() {
        let limiter = NoopLimiter;
        assert!(limiter.limit_memory(1).is_ok());
        assert!(limiter.limit_cpu(1).is_ok());
        limiter.apply(&Policy::default());
    }

    #[test]
    fn cpu_clock_is_monotone() {
        let first = thread_cpu_time().expect("getrusage");
        let mut spin = 0u64;
        for i in 0..2_000_000u64 {
            spin = spin.wrapping_add(i.wrapping_mul(i));
        }
        assert!(spin > 0);
        let second = thread_cpu_time().expect("getrusage");
        assert!(second >= first);
    }

    #[test]
    fn fresh_budget_is_not_exhausted() {
        let budget = CpuBudget::start(Duration::from_secs(5));
        assert!(!budget.exhausted());
        assert!(CpuBudget::start(Duration::ZERO).used() < Duration::from_secs(1));
    }
}
