//! Wait-for-terminal-state engine.
//!
//! The poller re-reads one resource until its classification reaches a
//! target, enters a failure classification, or the deadline passes. It runs
//! on the calling task and sleeps between attempts; nothing is spawned.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::drivers::ResourceKind;
use crate::error::{Result, WaitError};

/// Default interval between refreshes in seconds.
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Default delay before the first refresh in seconds.
const DEFAULT_INITIAL_DELAY_SECS: u64 = 10;

/// Default floor for the refresh interval in seconds.
const DEFAULT_MIN_POLL_INTERVAL_SECS: u64 = 3;

/// Default overall deadline in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Poller timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Interval between refreshes.
    pub poll_interval: Duration,
    /// Delay before the first refresh.
    pub initial_delay: Duration,
    /// Lower bound applied to `poll_interval`.
    pub min_poll_interval: Duration,
    /// Deadline measured from the start of the wait.
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            initial_delay: Duration::from_secs(DEFAULT_INITIAL_DELAY_SECS),
            min_poll_interval: Duration::from_secs(DEFAULT_MIN_POLL_INTERVAL_SECS),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl PollConfig {
    /// Returns a configuration that refreshes back-to-back until `timeout`.
    #[must_use]
    pub const fn immediate(timeout: Duration) -> Self {
        Self {
            poll_interval: Duration::ZERO,
            initial_delay: Duration::ZERO,
            min_poll_interval: Duration::ZERO,
            timeout,
        }
    }

    fn pause(&self) -> Duration {
        self.poll_interval.max(self.min_poll_interval)
    }
}

/// A resource-specific classification of an observed state.
pub trait Classification: fmt::Display + PartialEq + Clone + Send + Sync {
    /// Returns the diagnostic when this classification is a terminal failure.
    fn failure_message(&self) -> Option<String>;
}

/// Polls one resource at a time.
#[derive(Debug, Clone, Copy)]
pub struct StatePoller {
    config: PollConfig,
}

impl StatePoller {
    /// Creates a poller.
    #[must_use]
    pub const fn new(config: PollConfig) -> Self {
        Self { config }
    }

    /// Refreshes until `target` is observed and returns that snapshot.
    ///
    /// Classifications that are neither the target nor a failure are pending.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Failed`] on a failure classification,
    /// [`WaitError::Timeout`] when the deadline passes, or the refresh error
    /// unchanged (a read error is never treated as pending).
    pub async fn wait_for<T, C, F, Fut>(
        &self,
        kind: ResourceKind,
        id: i64,
        target: &C,
        mut refresh: F,
    ) -> Result<T>
    where
        C: Classification,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(T, C)>>,
    {
        let started = Instant::now();
        if !self.config.initial_delay.is_zero() {
            tokio::time::sleep(self.config.initial_delay).await;
        }

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let (snapshot, state) = refresh().await?;
            debug!("{kind} {id}: state '{state}' (attempt {attempts}, waiting for '{target}')");

            if state == *target {
                return Ok(snapshot);
            }

            if let Some(message) = state.failure_message() {
                return Err(WaitError::Failed { kind, id, message }.into());
            }

            let elapsed = started.elapsed();
            if elapsed >= self.config.timeout {
                return Err(WaitError::Timeout {
                    kind,
                    id,
                    target: target.to_string(),
                    last_state: state.to_string(),
                }
                .into());
            }

            let pause = self.config.pause().min(self.config.timeout - elapsed);
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NebulaError;
    use std::cell::Cell;

    #[derive(Debug, Clone, PartialEq)]
    enum Phase {
        Pending,
        Ready,
        Broken,
    }

    impl fmt::Display for Phase {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Classification for Phase {
        fn failure_message(&self) -> Option<String> {
            (*self == Self::Broken).then(|| String::from("broken"))
        }
    }

    #[tokio::test]
    async fn test_returns_after_exactly_three_refreshes() {
        let poller = StatePoller::new(PollConfig::immediate(Duration::from_secs(5)));
        let script = [Phase::Pending, Phase::Pending, Phase::Ready];
        let calls = Cell::new(0usize);

        let snapshot = poller
            .wait_for(ResourceKind::Image, 1, &Phase::Ready, || {
                let n = calls.get();
                calls.set(n + 1);
                let phase = script[n].clone();
                async move { Ok((n, phase)) }
            })
            .await
            .expect("wait failed");

        assert_eq!(calls.get(), 3);
        assert_eq!(snapshot, 2);
    }

    #[tokio::test]
    async fn test_times_out_with_last_state() {
        let config = PollConfig {
            poll_interval: Duration::from_millis(5),
            timeout: Duration::from_millis(30),
            ..PollConfig::immediate(Duration::ZERO)
        };

        let result = StatePoller::new(config)
            .wait_for(ResourceKind::Vm, 8, &Phase::Ready, || async {
                Ok(((), Phase::Pending))
            })
            .await;

        match result {
            Err(NebulaError::Wait(WaitError::Timeout { id, target, last_state, .. })) => {
                assert_eq!(id, 8);
                assert_eq!(target, "Ready");
                assert_eq!(last_state, "Pending");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failure_classification_stops_immediately() {
        let calls = Cell::new(0usize);
        let result = StatePoller::new(PollConfig::immediate(Duration::from_secs(5)))
            .wait_for(ResourceKind::Image, 3, &Phase::Ready, || {
                calls.set(calls.get() + 1);
                async { Ok(((), Phase::Broken)) }
            })
            .await;

        assert!(matches!(
            result,
            Err(NebulaError::Wait(WaitError::Failed { ref message, .. })) if message == "broken"
        ));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_refresh_errors_propagate() {
        let result: Result<()> = StatePoller::new(PollConfig::immediate(Duration::from_secs(5)))
            .wait_for(ResourceKind::Vm, 3, &Phase::Ready, || async {
                Err(NebulaError::internal("read failed"))
            })
            .await;

        assert!(matches!(result, Err(NebulaError::Internal(_))));
    }

    #[test]
    fn test_default_timing() {
        let config = PollConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(600));
        assert_eq!(config.pause(), Duration::from_secs(5));
    }
}
