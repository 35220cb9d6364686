//! 健康检查领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `/health` 响应体
#[derive(Clone, Debug, Deserialize)]
pub struct HealthBody {
    pub status: Option<String>,
    pub database: Option<DependencyStatus>,
}

/// 依赖存储状态
#[derive(Clone, Debug, Deserialize)]
pub struct DependencyStatus {
    pub status: Option<String>,
}

/// 一次健康检查的结果
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct HealthCheckResult {
    pub endpoint: String,
    pub timestamp: DateTime<Utc>,
    pub http_status: u16,
    /// 主服务状态 (body.status)
    pub service_status: Option<String>,
    /// 依赖存储状态 (body.database.status)
    pub database_status: Option<String>,
}

impl HealthCheckResult {
    /// 从 HTTP 状态码和已解码的响应体构造
    pub fn from_response(endpoint: impl Into<String>, http_status: u16, body: Option<HealthBody>) -> Self {
        let (service_status, database_status) = match body {
            Some(body) => (body.status, body.database.and_then(|d| d.status)),
            None => (None, None),
        };
        Self {
            endpoint: endpoint.into(),
            timestamp: Utc::now(),
            http_status,
            service_status,
            database_status,
        }
    }

    /// HTTP 200 且服务 healthy 且数据库 connected/healthy
    ///
    /// HTTP 200 但依赖异常不算健康
    pub fn is_healthy(&self) -> bool {
        self.http_status == 200
            && self.service_status.as_deref() == Some("healthy")
            && matches!(
                self.database_status.as_deref(),
                Some("connected") | Some("healthy")
            )
    }

    /// 简短描述，用于日志和错误信息
    pub fn summary(&self) -> String {
        format!(
            "http={} status={} database={}",
            self.http_status,
            self.service_status.as_deref().unwrap_or("-"),
            self.database_status.as_deref().unwrap_or("-"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(http: u16, body: &str) -> HealthCheckResult {
        let body: Option<HealthBody> = serde_json::from_str(body).ok();
        HealthCheckResult::from_response("http://h:3000/health", http, body)
    }

    #[test]
    fn test_healthy() {
        let r = result(200, r#"{"status":"healthy","database":{"status":"connected"}}"#);
        assert!(r.is_healthy());
    }

    #[test]
    fn test_dependency_down_is_unhealthy() {
        let r = result(200, r#"{"status":"healthy","database":{"status":"disconnected"}}"#);
        assert!(!r.is_healthy());
        assert_eq!(r.summary(), "http=200 status=healthy database=disconnected");

        let r = result(200, r#"{"status":"healthy"}"#);
        assert!(!r.is_healthy());
    }

    #[test]
    fn test_bad_status_code_is_unhealthy() {
        let r = result(503, r#"{"status":"healthy","database":{"status":"connected"}}"#);
        assert!(!r.is_healthy());

        let r = result(200, "not json");
        assert!(!r.is_healthy());
    }
}
