//! Distributed per-task rate limiting.
//!
//! Every call to [`TaskThrottle::get_task_wait`] either admits the caller now
//! or hands out the next free slot in a schedule shared by all processes.
//! A counter key counts admissions in the current window and expires with
//! it; a companion schedule key holds the epoch-millisecond time of the last
//! slot handed out to a deferred caller.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use super::backend::{ttl_millis, KeyValueBackend};
use super::keys;
use super::retry::RetryPolicy;
use crate::error::CoordinationError;

/// An allowance of `count` executions per `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate {
    pub count: u32,
    pub period: Duration,
}

impl Rate {
    pub fn new(count: u32, period: Duration) -> Self {
        Self { count, period }
    }

    /// Even spacing between slots within one period.
    pub fn spacing(&self) -> Duration {
        self.period / self.count.max(1)
    }
}

impl std::fmt::Display for Rate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}s", self.count, self.period.as_secs_f64())
    }
}

/// Error parsing a rate string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid rate '{0}': expected COUNT/[N]UNIT, e.g. 1/4s or 10/m")]
pub struct ParseRateError(String);

impl FromStr for Rate {
    type Err = ParseRateError;

    /// Parses `COUNT/[N]UNIT` where UNIT is one of `s`, `m`, `h`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseRateError(s.to_string());
        let (count, period) = s.trim().split_once('/').ok_or_else(err)?;

        let count: u32 = count.trim().parse().map_err(|_| err())?;
        if count == 0 {
            return Err(err());
        }

        let period = period.trim();
        let unit_at = period
            .find(|c: char| c.is_ascii_alphabetic())
            .ok_or_else(err)?;
        let (multiplier, unit) = period.split_at(unit_at);
        let multiplier: u64 = if multiplier.is_empty() {
            1
        } else {
            multiplier.parse().map_err(|_| err())?
        };
        let unit_secs = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            _ => return Err(err()),
        };
        if multiplier == 0 {
            return Err(err());
        }

        Ok(Rate::new(count, Duration::from_secs(multiplier * unit_secs)))
    }
}

/// Upper bound on the padding between a window edge and the slot after it.
const MAX_SLOT_MARGIN: Duration = Duration::from_millis(50);

/// Padding added to each handed-out slot, so a caller returning on time
/// arrives after the window it was deferred from has closed.
fn slot_margin(rate: Rate) -> Duration {
    (rate.spacing() / 20).clamp(Duration::from_millis(1), MAX_SLOT_MARGIN)
}

/// Shared rate limiter for named tasks.
#[derive(Clone)]
pub struct TaskThrottle {
    backend: Arc<dyn KeyValueBackend>,
    retry: RetryPolicy,
}

impl TaskThrottle {
    pub fn new(backend: Arc<dyn KeyValueBackend>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    /// Returns how long the caller must wait before running `task`.
    ///
    /// Zero means the caller was admitted and counted. A positive delay is a
    /// reserved slot: the caller should reschedule itself that far in the
    /// future and ask again then.
    ///
    /// Each store command is retried on its own after a transient failure.
    /// An increment whose reply was lost may land twice, which over-counts
    /// the window by one: the window admits fewer callers, never more, and
    /// the surplus expires with it.
    pub async fn get_task_wait(
        &self,
        task: &str,
        sub_key: Option<&str>,
        rate: Rate,
    ) -> Result<Duration, CoordinationError> {
        let counter = keys::throttle_counter(task, sub_key);
        let retry = self.retry;
        let backend = self.backend.as_ref();

        let raw = retry.run("throttle get", || backend.get(&counter)).await?;
        let current = match raw {
            Some(raw) => Some(raw.parse::<u32>().map_err(|_| CoordinationError::InvalidValue {
                key: counter.clone(),
                value: raw,
            })?),
            None => None,
        };

        match current {
            None => {
                let opened = retry
                    .run("throttle open", || backend.set_nx(&counter, "1", rate.period))
                    .await?;
                if opened {
                    return Ok(Duration::ZERO);
                }
                // Another caller opened the window first.
                self.admit_or_defer(&counter, rate).await
            }
            Some(n) if n < rate.count => self.admit_or_defer(&counter, rate).await,
            Some(_) => self.defer(&counter, rate).await,
        }
    }

    async fn admit_or_defer(
        &self,
        counter: &str,
        rate: Rate,
    ) -> Result<Duration, CoordinationError> {
        let backend = self.backend.as_ref();
        let n = self
            .retry
            .run("throttle incr", || backend.incr(counter, 1))
            .await?;
        if n == 1 {
            // The window lapsed between the read and the increment.
            self.retry
                .run("throttle expire", || backend.expire(counter, rate.period))
                .await?;
        }
        if n > i64::from(rate.count) {
            self.retry
                .run("throttle decr", || backend.incr(counter, -1))
                .await?;
            return self.defer(counter, rate).await;
        }
        Ok(Duration::ZERO)
    }

    async fn defer(&self, counter: &str, rate: Rate) -> Result<Duration, CoordinationError> {
        let backend = self.backend.as_ref();
        let schedule = keys::throttle_schedule(counter);
        let margin = slot_margin(rate);
        let now_ms = Utc::now().timestamp_millis();

        let window_left = self
            .retry
            .run("throttle ttl", || backend.ttl(counter))
            .await?
            .unwrap_or(rate.period);
        let first_slot = now_ms + ttl_millis(window_left + margin) as i64;
        let first = first_slot.to_string();
        let spacing_ms = ttl_millis(rate.spacing() + margin) as i64;

        let last = self
            .retry
            .run("throttle schedule", || backend.get(&schedule))
            .await?;
        let slot = match last {
            Some(raw) => {
                let last: i64 = raw.parse().map_err(|_| CoordinationError::InvalidValue {
                    key: schedule.clone(),
                    value: raw,
                })?;
                if last > now_ms {
                    self.retry
                        .run("throttle reserve", || backend.incr(&schedule, spacing_ms))
                        .await?
                } else {
                    self.retry
                        .run("throttle restart", || backend.set(&schedule, &first, None))
                        .await?;
                    first_slot
                }
            }
            None => {
                let started = self
                    .retry
                    .run("throttle start", || backend.set_nx(&schedule, &first, rate.period))
                    .await?;
                if started {
                    first_slot
                } else {
                    self.retry
                        .run("throttle reserve", || backend.incr(&schedule, spacing_ms))
                        .await?
                }
            }
        };

        let delay_ms = (slot - now_ms).max(1);
        let keep_for = Duration::from_millis(delay_ms as u64) + rate.period;
        self.retry
            .run("throttle expire", || backend.expire(&schedule, keep_for))
            .await?;

        debug!(key = counter, delay_ms, "Task throttled");
        Ok(Duration::from_millis(delay_ms as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryBackend;

    fn throttle(backend: Arc<MemoryBackend>) -> TaskThrottle {
        TaskThrottle::new(backend, RetryPolicy::default())
    }

    #[test]
    fn test_parse_rate() {
        assert_eq!(
            "1/4s".parse::<Rate>().unwrap(),
            Rate::new(1, Duration::from_secs(4))
        );
        assert_eq!(
            "10/m".parse::<Rate>().unwrap(),
            Rate::new(10, Duration::from_secs(60))
        );
        assert_eq!(
            "5/2h".parse::<Rate>().unwrap(),
            Rate::new(5, Duration::from_secs(7200))
        );
        assert!("0/s".parse::<Rate>().is_err());
        assert!("1/0s".parse::<Rate>().is_err());
        assert!("1/4d".parse::<Rate>().is_err());
        assert!("fast".parse::<Rate>().is_err());
    }

    #[test]
    fn test_spacing() {
        assert_eq!(Rate::new(2, Duration::from_secs(4)).spacing(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_admits_up_to_rate_then_defers() {
        let backend = Arc::new(MemoryBackend::new());
        let throttle = throttle(backend);
        let rate = Rate::new(2, Duration::from_secs(4));

        let first = throttle.get_task_wait("crawl", Some("nysd"), rate).await.unwrap();
        let second = throttle.get_task_wait("crawl", Some("nysd"), rate).await.unwrap();
        assert_eq!(first, Duration::ZERO);
        assert_eq!(second, Duration::ZERO);

        let third = throttle.get_task_wait("crawl", Some("nysd"), rate).await.unwrap();
        let fourth = throttle.get_task_wait("crawl", Some("nysd"), rate).await.unwrap();
        let fifth = throttle.get_task_wait("crawl", Some("nysd"), rate).await.unwrap();

        // First deferral lands just after the current window closes.
        assert!(third > Duration::from_millis(3500) && third <= Duration::from_millis(4100));
        // Later ones are spread period/count apart.
        let gap = fourth.saturating_sub(third);
        assert!(gap > Duration::from_millis(1500) && gap <= Duration::from_millis(2100));
        let gap = fifth.saturating_sub(fourth);
        assert!(gap > Duration::from_millis(1500) && gap <= Duration::from_millis(2100));
    }

    #[tokio::test]
    async fn test_sub_keys_are_independent() {
        let backend = Arc::new(MemoryBackend::new());
        let throttle = throttle(backend);
        let rate = Rate::new(1, Duration::from_secs(4));

        assert!(throttle.get_task_wait("crawl", Some("nysd"), rate).await.unwrap().is_zero());
        assert!(throttle.get_task_wait("crawl", Some("cand"), rate).await.unwrap().is_zero());
        assert!(!throttle.get_task_wait("crawl", Some("nysd"), rate).await.unwrap().is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry_readmits() {
        let backend = Arc::new(MemoryBackend::new());
        let throttle = throttle(backend);
        let rate = Rate::new(1, Duration::from_secs(4));

        assert!(throttle.get_task_wait("crawl", None, rate).await.unwrap().is_zero());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(throttle.get_task_wait("crawl", None, rate).await.unwrap().is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn test_survives_transient_failures() {
        let backend = Arc::new(MemoryBackend::new());
        let throttle = throttle(backend.clone());
        backend.inject_connection_failures(2);

        let wait = throttle
            .get_task_wait("crawl", Some("nysd"), Rate::new(1, Duration::from_secs(4)))
            .await
            .unwrap();
        assert!(wait.is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_failure_surfaces() {
        let backend = Arc::new(MemoryBackend::new());
        let throttle = throttle(backend.clone());
        backend.inject_connection_failures(100);

        let err = throttle
            .get_task_wait("crawl", Some("nysd"), Rate::new(1, Duration::from_secs(4)))
            .await
            .unwrap_err();
        assert!(err.is_connection());
    }

    #[test]
    fn test_slot_margin_bounds() {
        assert_eq!(
            slot_margin(Rate::new(2, Duration::from_secs(1))),
            Duration::from_millis(25)
        );
        assert_eq!(slot_margin(Rate::new(1, Duration::from_secs(4))), MAX_SLOT_MARGIN);
        assert_eq!(
            slot_margin(Rate::new(1000, Duration::from_secs(1))),
            Duration::from_millis(1)
        );
    }

    #[tokio::test]
    async fn test_deferred_callers_are_admitted_when_they_return() {
        let backend = Arc::new(MemoryBackend::new());
        let throttle = throttle(backend);
        let rate = Rate::new(2, Duration::from_secs(1));

        let mut delays = Vec::new();
        for _ in 0..8 {
            delays.push(throttle.get_task_wait("crawl", Some("nysd"), rate).await.unwrap());
        }
        assert!(delays[..2].iter().all(|d| d.is_zero()));
        assert!(delays[2..].iter().all(|d| !d.is_zero()));

        let returns = delays[2..].iter().map(|&delay| {
            let throttle = throttle.clone();
            async move {
                tokio::time::sleep(delay).await;
                throttle.get_task_wait("crawl", Some("nysd"), rate).await.unwrap()
            }
        });
        let waits = futures::future::join_all(returns).await;
        assert!(waits.iter().all(|w| w.is_zero()), "re-deferred: {waits:?}");
    }

    #[tokio::test]
    async fn test_failed_expiry_does_not_reserve_a_second_slot() {
        let backend = Arc::new(MemoryBackend::new());
        let retry = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        };
        let throttle = TaskThrottle::new(backend.clone(), retry);
        let rate = Rate::new(1, Duration::from_secs(4));

        assert!(throttle.get_task_wait("crawl", None, rate).await.unwrap().is_zero());

        // get, ttl, schedule get and schedule start succeed; the expiry fails once.
        backend.inject_connection_failures_after(4, 1);
        let second = throttle.get_task_wait("crawl", None, rate).await.unwrap();
        let third = throttle.get_task_wait("crawl", None, rate).await.unwrap();

        assert!(second > Duration::from_millis(3500) && second <= Duration::from_millis(4100));
        let gap = third.saturating_sub(second);
        assert!(gap > Duration::from_millis(3900) && gap <= Duration::from_millis(4100));
    }
}
