//! Bounded exponential backoff with jitter.
//!
//! 控制面调用、存储写入、消费任务重启共用同一套退避计算；
//! 错误是否值得重试由各自的错误类型通过 [`Retryable`] 自行判定。

use std::future::Future;
use std::time::Duration;

use educe::Educe;
use serde::{Deserialize, Serialize};

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

#[derive(Educe, Deserialize, Serialize, PartialEq, Clone)]
#[educe(Debug, Default)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    #[educe(Default = 5)]
    pub max_retries: u32,
    #[educe(Default = 200)]
    pub initial_delay_ms: u64,
    #[educe(Default = 30_000)]
    pub max_delay_ms: u64,
    #[educe(Default = 2.0)]
    pub multiplier: f64,
    /// Fraction of the computed delay that is randomised, 0.0..=1.0.
    #[educe(Default = 0.2)]
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            max_retries,
            initial_delay_ms: ms,
            max_delay_ms: ms,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt` (1-based). Attempt 0 never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.min(30) as i32 - 1;
        let base = (self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exp))
            .min(self.max_delay_ms as f64);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let delay = if jitter > 0.0 {
            // [-jitter, +jitter] 区间内均匀扰动
            let spread = base * jitter;
            base + spread * (rand::random::<f64>() * 2.0 - 1.0)
        } else {
            base
        };
        Duration::from_millis(delay.max(0.0) as u64)
    }

    /// Run `op` until it succeeds, fails permanently, or the retry budget is spent.
    /// Returns the last error on failure.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.delay_for_attempt(attempt);
                    log::warn!(
                        target: "cdc::retry",
                        "{} failed (attempt {}/{}), retry in {:?}: {}",
                        label,
                        attempt,
                        self.max_retries + 1,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Flaky(bool);

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky(transient={})", self.0)
        }
    }

    impl Retryable for Flaky {
        fn is_transient(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = RetryPolicy {
            initial_delay_ms: 1_000,
            max_delay_ms: 1_000,
            jitter: 0.5,
            ..RetryPolicy::default()
        };
        for _ in 0..200 {
            let d = policy.delay_for_attempt(3).as_millis();
            assert!((500..=1_500).contains(&d), "delay {d} out of band");
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_budget() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let res: Result<(), Flaky> = policy
            .run("flaky", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(true))
            })
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_errors_fail_fast() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let res: Result<(), Flaky> = policy
            .run("flaky", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(false))
            })
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let res = policy
            .run("flaky", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Flaky(true))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(res.ok(), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
