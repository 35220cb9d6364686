//! 健康检查服务
//!
//! 按固定间隔轮询健康端点，直到健康或尝试次数耗尽。
//! 每次调用都从零开始轮询，不缓存之前的结果

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::env::constants::{HEALTH_INTERVAL_SECS, HEALTH_MAX_ATTEMPTS};
use crate::domain::health::HealthCheckResult;
use crate::error::{DeployError, DeployResult};
use crate::infra::probe::HealthProbe;
use crate::services::retry::{RetryError, RetryPolicy};

/// 健康检查参数
#[derive(Clone, Debug, PartialEq)]
pub struct VerifyOptions {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(HEALTH_INTERVAL_SECS),
            max_attempts: HEALTH_MAX_ATTEMPTS,
        }
    }
}

impl VerifyOptions {
    fn policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_attempts, self.interval)
    }
}

/// 健康检查器
#[derive(Clone)]
pub struct HealthVerifier {
    probe: Arc<dyn HealthProbe>,
}

impl HealthVerifier {
    pub fn new(probe: Arc<dyn HealthProbe>) -> Self {
        Self { probe }
    }

    /// 轮询 `endpoint` 直到健康
    ///
    /// 连续 `max_attempts` 次不健康返回 `VerificationTimeout`
    pub async fn verify(
        &self,
        endpoint: &str,
        opts: &VerifyOptions,
        cancel: &CancellationToken,
    ) -> DeployResult<HealthCheckResult> {
        let policy = opts.policy();
        info!(
            endpoint,
            interval_secs = opts.interval.as_secs(),
            max_attempts = opts.max_attempts,
            budget_secs = policy.total_delay().as_secs(),
            "Verifying service health"
        );

        let result = policy
            .run(cancel, |attempt| {
                let probe = self.probe.clone();
                async move {
                    match probe.check(endpoint).await {
                        Ok(result) if result.is_healthy() => Ok(result),
                        Ok(result) => {
                            warn!(endpoint, attempt, state = %result.summary(), "Service not healthy yet");
                            Err(result.summary())
                        }
                        Err(e) => {
                            warn!(endpoint, attempt, error = %e, "Health probe failed");
                            Err(e.to_string())
                        }
                    }
                }
            })
            .await;

        match result {
            Ok(result) => {
                info!(endpoint, "Service is healthy");
                Ok(result)
            }
            Err(RetryError::Cancelled) => Err(DeployError::Cancelled),
            Err(RetryError::Exhausted { attempts, last }) => Err(DeployError::VerificationTimeout {
                endpoint: endpoint.to_string(),
                attempts,
                last,
            }),
        }
    }
}
