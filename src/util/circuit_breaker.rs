//! 依存サービスごとのサーキットブレーカー。
//!
//! 状態は単一のミューテックスで保護され、次の遷移でのみ変化する。
//! closed は `failure_threshold` 回連続で失敗すると open になる。open は最後の失敗から
//! `recovery_timeout` が経過すると half-open になる。half-open はプローブ成功で closed、
//! 失敗で open に戻る。half-open 中に通すプローブは1件だけで、それ以外は即座に拒否する。

use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("circuit breaker for {service} is open (retry after {retry_after:?})")]
pub struct CircuitOpenError {
    pub service: String,
    pub retry_after: Duration,
}

/// ある時点のブレーカー状態。ステータス応答やログ用。
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub times_opened: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
    times_opened: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                probe_in_flight: false,
                times_opened: 0,
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            service: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            times_opened: inner.times_opened,
        }
    }

    /// 1回分の呼び出し許可を求める。
    ///
    /// # Errors
    /// open 中、または half-open のプローブが実行中の場合は [`CircuitOpenError`] を返す。
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitOpenError> {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => Ok(CallPermit::new(self, false)),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map_or(Duration::MAX, |at| at.elapsed());

                if elapsed >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(service = %self.name, "circuit half-open, admitting probe call");
                    Ok(CallPermit::new(self, true))
                } else {
                    Err(self.open_error(self.config.recovery_timeout - elapsed))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(self.open_error(Duration::ZERO))
                } else {
                    inner.probe_in_flight = true;
                    Ok(CallPermit::new(self, true))
                }
            }
        }
    }

    fn open_error(&self, retry_after: Duration) -> CircuitOpenError {
        CircuitOpenError {
            service: self.name.clone(),
            retry_after,
        }
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        if probe {
            inner.probe_in_flight = false;
        }

        match inner.state {
            CircuitState::HalfOpen if probe => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                info!(service = %self.name, "probe succeeded, circuit closed");
            }
            CircuitState::Closed => inner.consecutive_failures = 0,
            // open になる前に許可された呼び出しの遅れた結果。現在の状態には反映しない。
            CircuitState::Open | CircuitState::HalfOpen => {}
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut inner = self.lock();
        if probe {
            inner.probe_in_flight = false;
        }
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.times_opened += 1;
                    warn!(
                        service = %self.name,
                        consecutive_failures = inner.consecutive_failures,
                        recovery_timeout_ms =
                            u64::try_from(self.config.recovery_timeout.as_millis())
                                .unwrap_or(u64::MAX),
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen if probe => {
                inner.state = CircuitState::Open;
                inner.consecutive_failures += 1;
                inner.times_opened += 1;
                warn!(service = %self.name, "probe failed, circuit re-opened");
            }
            CircuitState::Open | CircuitState::HalfOpen => inner.consecutive_failures += 1,
        }
    }

    fn release_probe(&self) {
        let mut inner = self.lock();
        inner.probe_in_flight = false;
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // 更新途中で panic しないため、poison されたロックでも状態は整合している。
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// 1回分の呼び出し許可。結果は [`CallPermit::record_success`] か
/// [`CallPermit::record_failure`] で報告する。未報告のままプローブ許可を drop すると
/// half-open の枠は次の呼び出しに解放される。
#[must_use = "report the call outcome to the breaker"]
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "dnc",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(recovery_secs),
            },
        )
    }

    fn fail(breaker: &CircuitBreaker) {
        breaker
            .try_acquire()
            .expect("call admitted")
            .record_failure();
    }

    #[test]
    fn opens_after_exactly_threshold_failures() {
        let breaker = breaker(5, 30);

        for _ in 0..4 {
            fail(&breaker);
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        fail(&breaker);

        assert_eq!(breaker.state(), CircuitState::Open);
        let err = breaker.try_acquire().expect_err("open circuit rejects");
        assert_eq!(err.service, "dnc");
        assert_eq!(breaker.snapshot().times_opened, 1);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let breaker = breaker(3, 30);

        fail(&breaker);
        fail(&breaker);
        breaker.try_acquire().expect("closed").record_success();
        fail(&breaker);
        fail(&breaker);

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn half_opens_after_recovery_timeout_and_closes_on_probe_success() {
        let breaker = breaker(2, 10);
        fail(&breaker);
        fail(&breaker);

        tokio::time::advance(Duration::from_secs(9)).await;
        let err = breaker.try_acquire().expect_err("still cooling down");
        assert!(err.retry_after <= Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        let probe = breaker.try_acquire().expect("probe admitted");
        assert!(probe.is_probe());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(
            breaker.try_acquire().is_err(),
            "second caller fails fast while probe in flight"
        );

        probe.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens() {
        let breaker = breaker(1, 5);
        fail(&breaker);

        tokio::time::advance(Duration::from_secs(5)).await;
        breaker.try_acquire().expect("probe").record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_err());
        assert_eq!(breaker.snapshot().times_opened, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_probe_frees_the_slot() {
        let breaker = breaker(1, 5);
        fail(&breaker);
        tokio::time::advance(Duration::from_secs(5)).await;

        drop(breaker.try_acquire().expect("probe"));

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().expect("next probe").is_probe());
    }

    #[test]
    fn zero_threshold_is_treated_as_one() {
        let breaker = breaker(0, 5);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
