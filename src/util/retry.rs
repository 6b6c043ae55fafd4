/// 指数バックオフ+ジッター付き再試行ロジック。
///
/// 遅延は `min(base * 2^(attempt-1) + jitter, max_delay)`。ジッターは計算済み遅延の
/// `jitter_ratio` 倍を上限とする一様乱数で、並行ワーカー間の再試行の同期を防ぐ。
use std::{fmt::Display, future::Future, time::Duration};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use super::circuit_breaker::CircuitBreaker;

/// 再試行可能かどうかを呼び出し側が判別するためのトレイト。
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// 再試行戦略の設定。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// 最大試行回数（初回を含む）
    pub max_attempts: usize,
    /// ベースとなる遅延時間（ミリ秒）
    pub base_delay_ms: u64,
    /// 最大遅延時間（ミリ秒）
    pub max_delay_ms: u64,
    /// ジッター幅（計算済み遅延に対する比率, 0.0..=1.0）
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 10_000,
            jitter_ratio: 0.2,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub const fn new(max_attempts: usize, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
            jitter_ratio: 0.2,
        }
    }

    #[must_use]
    pub const fn with_jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio;
        self
    }

    /// ジッターを含まない遅延時間。
    ///
    /// # Arguments
    /// * `attempt` - 失敗済みの試行回数（1から開始、0は遅延なし）
    #[must_use]
    pub fn base_delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = u32::try_from(attempt - 1).unwrap_or(u32::MAX).min(63);
        let exponential = self
            .base_delay_ms
            .saturating_mul(2_u64.saturating_pow(exponent));

        Duration::from_millis(exponential.min(self.max_delay_ms))
    }

    /// ジッター込みの遅延時間。`max_delay` を超えることはない。
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        if base_ms == 0 {
            return Duration::ZERO;
        }

        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let jitter_cap = (base_ms as f64 * self.jitter_ratio.clamp(0.0, 1.0)) as u64;
        let jitter = if jitter_cap > 0 {
            rand::rng().random_range(0..=jitter_cap)
        } else {
            0
        };

        Duration::from_millis(base_ms.saturating_add(jitter).min(self.max_delay_ms))
    }

    /// `attempts` 回試行した後にもう一度試行できるか。
    #[must_use]
    pub const fn can_retry(&self, attempts: usize) -> bool {
        attempts < self.max_attempts
    }
}

/// 再試行ループの最終結果としてのエラー。
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("circuit breaker for {service} is open")]
    CircuitOpen { service: String },
    #[error("non-retryable failure on attempt {attempt}: {source}")]
    Rejected {
        attempt: usize,
        #[source]
        source: E,
    },
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: usize,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    /// 実際に行った試行回数（ブレーカーで拒否された場合は0）。
    #[must_use]
    pub fn attempts(&self) -> usize {
        match self {
            Self::CircuitOpen { .. } => 0,
            Self::Rejected { attempt, .. } => *attempt,
            Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

/// 失敗しうる処理を再試行付きで実行する。
///
/// 各試行の結果はブレーカーへ報告される。再試行可能な失敗のみがブレーカーの失敗として
/// 数えられ、再試行不可能な失敗（入力不正・認可エラーなど）は依存先が応答した証拠として
/// 成功扱いで報告される。ブレーカーが開いている場合はネットワークに触れず即座に失敗する。
///
/// # Errors
/// ブレーカー開放、再試行不可能な失敗、再試行上限到達のいずれかで [`RetryError`] を返す。
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    breaker: &CircuitBreaker,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        let permit = breaker.try_acquire().map_err(|open| RetryError::CircuitOpen {
            service: open.service,
        })?;

        match operation(attempt).await {
            Ok(value) => {
                permit.record_success();
                if attempt > 1 {
                    debug!(service = breaker.name(), attempt, "call succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if !error.is_retryable() => {
                permit.record_success();
                return Err(RetryError::Rejected {
                    attempt,
                    source: error,
                });
            }
            Err(error) => {
                permit.record_failure();

                if !config.can_retry(attempt) {
                    warn!(
                        service = breaker.name(),
                        attempt,
                        max_attempts = config.max_attempts,
                        error = %error,
                        "call failed after all retries"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        source: error,
                    });
                }

                let delay = config.delay_for_attempt(attempt);
                debug!(
                    service = breaker.name(),
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "call failed, retrying after delay"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::util::circuit_breaker::{CircuitBreakerConfig, CircuitState};

    #[derive(Debug)]
    enum TestError {
        Transient,
        Invalid,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::Transient => f.write_str("transient"),
                Self::Invalid => f.write_str("invalid"),
            }
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, Self::Transient)
        }
    }

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(30),
            },
        )
    }

    #[test]
    fn delay_for_attempt_zero_is_zero() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn base_delay_is_monotonic_and_capped() {
        let config = RetryConfig::new(20, 100, 5_000);
        let mut previous = Duration::ZERO;

        for attempt in 1..=20 {
            let delay = config.base_delay_for_attempt(attempt);
            assert!(delay >= previous, "attempt {attempt} decreased");
            assert!(delay <= Duration::from_millis(5_000));
            previous = delay;
        }
        assert_eq!(config.base_delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.base_delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn jitter_stays_within_ratio_and_cap() {
        let config = RetryConfig::new(5, 100, 10_000).with_jitter_ratio(0.5);

        for _ in 0..50 {
            let delay = config.delay_for_attempt(3);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(600));
        }

        let capped = RetryConfig::new(5, 100, 450).with_jitter_ratio(1.0);
        for _ in 0..50 {
            assert!(capped.delay_for_attempt(3) <= Duration::from_millis(450));
        }
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let config = RetryConfig::new(usize::MAX, u64::MAX / 2, u64::MAX);
        assert_eq!(
            config.base_delay_for_attempt(10_000),
            Duration::from_millis(u64::MAX)
        );
    }

    #[test]
    fn can_retry_respects_max_attempts() {
        let config = RetryConfig::new(3, 100, 1000);

        assert!(config.can_retry(1));
        assert!(config.can_retry(2));
        assert!(!config.can_retry(3));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_success() {
        let calls = AtomicUsize::new(0);
        let breaker = breaker(10);
        let config = RetryConfig::new(3, 10, 100);

        let result = retry_with_backoff(&config, &breaker, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TestError::Transient)
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.expect("third attempt succeeds"), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_attempt_count() {
        let breaker = breaker(10);
        let config = RetryConfig::new(4, 10, 100);

        let error = retry_with_backoff(&config, &breaker, |_| async {
            Err::<(), _>(TestError::Transient)
        })
        .await
        .expect_err("all attempts fail");

        assert!(matches!(error, RetryError::Exhausted { attempts: 4, .. }));
        assert_eq!(error.attempts(), 4);
        assert_eq!(breaker.consecutive_failures(), 4);
    }

    #[tokio::test]
    async fn non_retryable_failures_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let breaker = breaker(10);
        let config = RetryConfig::new(5, 10, 100);

        let error = retry_with_backoff(&config, &breaker, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TestError::Invalid) }
        })
        .await
        .expect_err("invalid input is rejected");

        assert!(matches!(error, RetryError::Rejected { attempt: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_short_circuits_without_calling() {
        let calls = AtomicUsize::new(0);
        let breaker = breaker(2);
        let config = RetryConfig::new(5, 10, 100);

        let error = retry_with_backoff(&config, &breaker, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TestError::Transient) }
        })
        .await
        .expect_err("breaker opens mid-retry");

        assert!(error.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(breaker.state(), CircuitState::Open);

        let error = retry_with_backoff(&config, &breaker, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, TestError>(()) }
        })
        .await
        .expect_err("still open");
        assert!(error.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
