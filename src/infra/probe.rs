//! 健康端点探测

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use crate::domain::health::{HealthBody, HealthCheckResult};
use crate::error::{DeployError, DeployResult};

/// 单次健康探测
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// 请求一次端点
    ///
    /// 收到任何 HTTP 响应都返回 Ok（是否健康由结果判断），传输失败返回 Err
    async fn check(&self, endpoint: &str) -> DeployResult<HealthCheckResult>;
}

/// HTTP 健康探测
#[derive(Clone)]
pub struct HttpHealthProbe {
    client: Client,
}

impl HttpHealthProbe {
    pub fn new(request_timeout: Duration) -> DeployResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| DeployError::Config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, endpoint: &str) -> DeployResult<HealthCheckResult> {
        let resp = self
            .client
            .get(endpoint)
            .send()
            .await
            .map_err(|e| DeployError::connectivity(endpoint, e.to_string()))?;

        let status = resp.status().as_u16();
        // 非 JSON 响应体按缺失处理
        let body = resp.json::<HealthBody>().await.ok();
        Ok(HealthCheckResult::from_response(endpoint, status, body))
    }
}
