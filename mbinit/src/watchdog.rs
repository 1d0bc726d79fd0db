//! Process-wide bootstrap deadline.
//!
//! There is exactly one deadline per run. Blocking waits are wrapped with
//! [`Deadline::run`], which enforces the deadline at that suspension point;
//! the synchronous stages call [`Deadline::check`] between steps.
//!
//! Blocking helpers (probe worker, `mke2fs`, block copies) can't be
//! interrupted from here, so [`arm_alarm`] also sets a kernel alarm whose
//! default action kills the process once the same timeout has passed.

use std::future::Future;
use std::time::Duration;

use mbinit_shared::errors::{MbError, MbResult};
use nix::unistd::alarm;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    pub fn at(&self) -> Instant {
        self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Fail with `Timeout` if the deadline has passed.
    pub fn check(&self, stage: &str) -> MbResult<()> {
        if self.is_expired() {
            return Err(MbError::Timeout(stage.to_string()));
        }
        Ok(())
    }

    /// Drive `fut` until it completes or the deadline passes.
    pub async fn run<F, T>(&self, stage: &str, fut: F) -> MbResult<T>
    where
        F: Future<Output = MbResult<T>>,
    {
        match tokio::time::timeout_at(self.at, fut).await {
            Ok(result) => result,
            Err(_) => Err(MbError::Timeout(stage.to_string())),
        }
    }
}

/// Deliver SIGALRM after `timeout` (rounded up to whole seconds).
pub fn arm_alarm(timeout: Duration) {
    let mut secs = timeout.as_secs();
    if timeout.subsec_nanos() > 0 || secs == 0 {
        secs += 1;
    }
    let secs = u32::try_from(secs).unwrap_or(u32::MAX);
    alarm::set(secs);
    tracing::debug!(secs, "Watchdog alarm armed");
}

/// Cancel the alarm; pending alarms survive `execv`.
pub fn disarm_alarm() {
    alarm::cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out() {
        let deadline = Deadline::after(Duration::from_secs(5));
        let result: MbResult<()> = deadline
            .run("waiting", async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(MbError::Timeout(stage)) if stage == "waiting"));
        assert!(deadline.check("after").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_completes_in_time() {
        let deadline = Deadline::after(Duration::from_secs(5));
        let value = deadline.run("quick", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        deadline.check("still fine").unwrap();
        assert!(deadline.remaining() <= Duration::from_secs(5));
    }
}
