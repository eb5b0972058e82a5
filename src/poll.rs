//! Bounded fixed-interval polling
//!
//! Every wait in the harness goes through [`poll_until`]: probe, sleep a fixed
//! interval, give up once the cumulative elapsed time reaches the policy's
//! timeout. None of the observed systems (Docker, the Swarm scheduler, the
//! secret store) push readiness notifications, so there is nothing to await
//! except the next probe.
//!
//! The last sleep is clamped to the remaining budget, so a poll returns within
//! `timeout + interval` of being called (plus the duration of one probe).

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

/// Interval/timeout pair for one poll site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollPolicy {
    /// Time between probes
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Maximum cumulative time spent polling
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl PollPolicy {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Policy allowing exactly `count` probes spaced `interval` apart
    pub fn attempts(count: u32, interval: Duration) -> Self {
        Self { interval, timeout: interval * count }
    }
}

/// Successful poll result
#[derive(Debug, Clone, PartialEq)]
pub struct Polled<T> {
    pub value: T,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Poll budget exhausted; carries the last pending observation
#[derive(Debug, Clone, PartialEq)]
pub struct PollExpired<O> {
    pub waited: Duration,
    pub attempts: u32,
    pub last: Option<O>,
}

/// Probe until it returns `Ok`, or until `policy.timeout` has elapsed.
///
/// `Err` values from the probe are not failures, they are the "not yet"
/// observation, and the most recent one is handed back on expiry.
pub async fn poll_until<F, Fut, T, O>(
    policy: PollPolicy,
    label: &str,
    mut probe: F,
) -> Result<Polled<T>, PollExpired<O>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, O>>,
    O: std::fmt::Debug,
{
    let start = Instant::now();
    let mut attempts = 0u32;
    let mut last = None;

    loop {
        let elapsed = start.elapsed();
        if elapsed >= policy.timeout {
            debug!(label, attempts, waited = ?elapsed, "Poll budget exhausted");
            return Err(PollExpired { waited: elapsed, attempts, last });
        }

        attempts += 1;
        match probe().await {
            Ok(value) => {
                let elapsed = start.elapsed();
                debug!(label, attempts, elapsed = ?elapsed, "Poll condition met");
                return Ok(Polled { value, attempts, elapsed });
            }
            Err(observation) => {
                debug!(label, attempts, observation = ?observation, "Poll condition not met");
                last = Some(observation);
                let remaining = policy.timeout.saturating_sub(start.elapsed());
                let sleep_time = policy.interval.min(remaining);
                if sleep_time > Duration::ZERO {
                    tokio::time::sleep(sleep_time).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_success_after_retries() {
        let counter = Arc::new(AtomicU32::new(0));
        let probe_counter = counter.clone();

        let result = poll_until(
            PollPolicy::new(Duration::from_secs(1), Duration::from_secs(10)),
            "retry test",
            move || {
                let c = probe_counter.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(format!("attempt {n}"))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(result.value, 42);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.elapsed, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_expiry_carries_last_observation() {
        let counter = Arc::new(AtomicU32::new(0));
        let probe_counter = counter.clone();

        let expired = poll_until(PollPolicy::attempts(20, Duration::from_secs(1)), "never", move || {
            let c = probe_counter.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                Err::<(), _>(n)
            }
        })
        .await
        .unwrap_err();

        assert_eq!(expired.attempts, 20);
        assert_eq!(expired.last, Some(20));
        assert_eq!(expired.waited, Duration::from_secs(20));
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_returns_within_timeout_plus_interval() {
        // Interval does not divide the timeout; the final sleep is clamped.
        let policy = PollPolicy::new(Duration::from_secs(3), Duration::from_secs(10));
        let start = Instant::now();

        let expired = poll_until(policy, "bound", || async { Err::<(), _>("down") }).await.unwrap_err();

        let elapsed = start.elapsed();
        assert!(elapsed >= policy.timeout);
        assert!(elapsed <= policy.timeout + policy.interval);
        assert_eq!(expired.attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_never_returns_before_first_success() {
        let start = Instant::now();
        let ready_at = start + Duration::from_secs(7);

        let result = poll_until(
            PollPolicy::new(Duration::from_secs(2), Duration::from_secs(30)),
            "ready later",
            move || async move {
                if Instant::now() >= ready_at {
                    Ok(())
                } else {
                    Err("starting")
                }
            },
        )
        .await
        .unwrap();

        assert!(start.elapsed() >= Duration::from_secs(7));
        assert_eq!(result.attempts, 5);
    }

    #[test]
    fn test_attempts_policy() {
        let policy = PollPolicy::attempts(20, Duration::from_secs(1));
        assert_eq!(policy.timeout, Duration::from_secs(20));
        assert_eq!(policy.interval, Duration::from_secs(1));
    }
}
