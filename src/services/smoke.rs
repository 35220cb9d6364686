//! CRUD 冒烟检查
//!
//! 部署验证阶段可选的端到端检查：创建 → 读取 → 更新 → 删除一条记录，
//! 并确认缺失 id 返回 404、非法请求返回 400

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{DeployError, DeployResult};

/// 服务统一响应格式
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Value,
}

/// 冒烟检查器
#[derive(Clone)]
pub struct SmokeTester {
    client: Client,
}

impl SmokeTester {
    pub fn new(request_timeout: Duration) -> DeployResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| DeployError::Config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// 对 `base_url`（如 `http://host:3000`）执行一轮 CRUD
    pub async fn run(&self, base_url: &str) -> DeployResult<()> {
        let base = base_url.trim_end_matches('/');
        let collection = format!("{}/todos", base);
        info!(base, "Running CRUD smoke test");

        let created = self
            .step(
                "create",
                self.client
                    .post(&collection)
                    .json(&json!({ "title": "xjp-rollout smoke test", "completed": false })),
                &[StatusCode::OK, StatusCode::CREATED],
            )
            .await?;
        let id = record_id(&created.data)
            .ok_or_else(|| failure("create", "response carries no id"))?;
        let item = format!("{}/{}", collection, id);
        debug!(base, id = %id, "Created smoke test record");

        self.step("read", self.client.get(&item), &[StatusCode::OK]).await?;

        let updated = self
            .step(
                "update",
                self.client.put(&item).json(&json!({ "completed": true })),
                &[StatusCode::OK],
            )
            .await?;
        if updated.data.get("completed").and_then(Value::as_bool) == Some(false) {
            return Err(failure("update", "change did not persist"));
        }

        self.step("delete", self.client.delete(&item), &[StatusCode::OK, StatusCode::NO_CONTENT])
            .await?;
        self.step_status("read deleted", self.client.get(&item), StatusCode::NOT_FOUND)
            .await?;
        self.step_status(
            "validation",
            self.client.post(&collection).json(&json!({})),
            StatusCode::BAD_REQUEST,
        )
        .await?;

        info!(base, "CRUD smoke test passed");
        Ok(())
    }

    async fn step(
        &self,
        step: &str,
        request: reqwest::RequestBuilder,
        accepted: &[StatusCode],
    ) -> DeployResult<Envelope> {
        let resp = request
            .send()
            .await
            .map_err(|e| failure(step, &format!("request failed: {}", e)))?;
        let status = resp.status();
        if !accepted.contains(&status) {
            return Err(failure(step, &format!("unexpected status {}", status)));
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Envelope {
                success: true,
                data: Value::Null,
            });
        }

        let envelope: Envelope = resp
            .json()
            .await
            .map_err(|e| failure(step, &format!("invalid response body: {}", e)))?;
        if !envelope.success {
            return Err(failure(step, "response reported success=false"));
        }
        Ok(envelope)
    }

    async fn step_status(
        &self,
        step: &str,
        request: reqwest::RequestBuilder,
        expected: StatusCode,
    ) -> DeployResult<()> {
        let resp = request
            .send()
            .await
            .map_err(|e| failure(step, &format!("request failed: {}", e)))?;
        if resp.status() == expected {
            Ok(())
        } else {
            Err(failure(
                step,
                &format!("expected {}, got {}", expected, resp.status()),
            ))
        }
    }
}

/// 记录 id（`_id` 或 `id`，字符串或数字）
fn record_id(data: &Value) -> Option<String> {
    let id = data.get("_id").or_else(|| data.get("id"))?;
    match id {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn failure(step: &str, detail: &str) -> DeployError {
    DeployError::VerificationTimeout {
        endpoint: format!("smoke test ({})", step),
        attempts: 1,
        last: detail.to_string(),
    }
}
