//! すべての外部呼び出しで共有する、再試行とサーキットブレーカーのラッパー。

use std::{future::Future, sync::Arc};

use crate::{
    observability::metrics::Metrics,
    util::{
        circuit_breaker::{CircuitBreaker, CircuitBreakerConfig},
        error::ServiceError,
        retry::{RetryConfig, RetryError, retry_with_backoff},
    },
};

#[derive(Debug, Clone)]
pub struct ServiceGuard {
    service: &'static str,
    retry: RetryConfig,
    breaker: Arc<CircuitBreaker>,
    metrics: Option<Arc<Metrics>>,
}

impl ServiceGuard {
    #[must_use]
    pub fn new(service: &'static str, retry: RetryConfig, breaker: CircuitBreakerConfig) -> Self {
        Self {
            service,
            retry,
            breaker: Arc::new(CircuitBreaker::new(service, breaker)),
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn service(&self) -> &'static str {
        self.service
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// 再試行ポリシーとこのサービスのブレーカーの下で `call` を実行する。
    ///
    /// # Errors
    /// [`retry_with_backoff`] を参照。
    pub async fn call<T, F, Fut>(&self, mut call: F) -> Result<T, RetryError<ServiceError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let result = retry_with_backoff(&self.retry, &self.breaker, |attempt| {
            if attempt > 1 {
                if let Some(metrics) = &self.metrics {
                    metrics.retries.with_label_values(&[self.service]).inc();
                }
            }
            call()
        })
        .await;

        if let (Err(RetryError::CircuitOpen { .. }), Some(metrics)) = (&result, &self.metrics) {
            metrics
                .circuit_rejections
                .with_label_values(&[self.service])
                .inc();
        }
        result
    }
}
