//! API 模块
//!
//! HTTP handlers 和路由组装

pub mod backups;
pub mod deploy;
pub mod health;

use axum::Router;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// 构建完整的 API 路由
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health & Status
        .merge(health::router())
        // Deploy
        .merge(deploy::router())
        // Backups
        .merge(backups::router())
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::testing::{test_env_config, FakeHost};
    use crate::middleware::auth::API_KEY_HEADER;
    use crate::services::deploy::compose::stage;
    use serde_json::{json, Value};
    use std::time::Duration;

    async fn spawn_api(host: Arc<FakeHost>) -> String {
        let state = AppState::with_executor(test_env_config(), host).unwrap();
        let app = router(Arc::new(state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client() -> reqwest::Client {
        reqwest::Client::new()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let base = spawn_api(FakeHost::new()).await;
        let body: Value = client()
            .get(format!("{}/health", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["repository"], "rickyjim/todo-app");
        assert_eq!(body["active_deploys"], 0);
    }

    #[tokio::test]
    async fn test_deploy_requires_api_key() {
        let host = FakeHost::new();
        let base = spawn_api(host.clone()).await;
        let resp = client()
            .post(format!("{}/deployments", base))
            .json(&json!({ "host": "app.test", "tag": "v1.0.0" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
        assert_eq!(host.command_count(), 0);
    }

    #[tokio::test]
    async fn test_deploy_rejects_invalid_tag() {
        let host = FakeHost::new();
        let base = spawn_api(host.clone()).await;
        let resp = client()
            .post(format!("{}/deployments", base))
            .header(API_KEY_HEADER, "test-key")
            .json(&json!({ "host": "app.test", "tag": "bad tag!" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        assert_eq!(host.command_count(), 0);
    }

    #[tokio::test]
    async fn test_deploy_runs_in_background_and_is_queryable() {
        let host = FakeHost::new();
        host.fail_stage(stage::PULL_IMAGE, 1);
        let base = spawn_api(host.clone()).await;

        let resp = client()
            .post(format!("{}/deployments", base))
            .header(API_KEY_HEADER, "test-key")
            .json(&json!({ "host": "app.test", "tag": "v1.2.0", "run_id": "ci-42" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        let accepted: Value = resp.json().await.unwrap();
        assert_eq!(accepted["run_id"], "ci-42");
        assert_eq!(accepted["target"], "deploy@app.test:2222");
        assert_eq!(accepted["image"], "rickyjim/todo-app:v1.2.0");

        let mut run = Value::Null;
        for _ in 0..100 {
            let resp = client()
                .get(format!("{}/deployments/ci-42", base))
                .send()
                .await
                .unwrap();
            if resp.status() == 200 {
                run = resp.json().await.unwrap();
                if run["attempts"][0]["phase"] == "failed" {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let attempt = &run["attempts"][0];
        assert_eq!(attempt["phase"], "failed");
        assert_eq!(attempt["outcome"]["kind"], "external_tool");
        assert_eq!(attempt["outcome"]["phase"], "deploying");

        let recent: Value = client()
            .get(format!("{}/deployments/recent?target=deploy@app.test:2222", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(recent["total"], 1);
    }

    #[tokio::test]
    async fn test_rejected_deployment_is_queryable() {
        let host = FakeHost::new();
        host.set_reachable(false);
        let base = spawn_api(host.clone()).await;

        let resp = client()
            .post(format!("{}/deployments", base))
            .header(API_KEY_HEADER, "test-key")
            .json(&json!({ "host": "app.test", "tag": "v1.2.0", "run_id": "ci-43" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);

        let mut run = Value::Null;
        for _ in 0..100 {
            let resp = client()
                .get(format!("{}/deployments/ci-43", base))
                .send()
                .await
                .unwrap();
            if resp.status() == 200 {
                run = resp.json().await.unwrap();
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(run["attempts"], json!([]));
        assert_eq!(run["run"]["status"], "rejected");
        assert_eq!(run["run"]["kind"], "connectivity");
        assert_eq!(run["run"]["target"], "deploy@app.test:2222");
    }

    #[tokio::test]
    async fn test_unknown_deployment_is_404() {
        let base = spawn_api(FakeHost::new()).await;
        let resp = client()
            .get(format!("{}/deployments/nope", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_backup_and_restore_over_http() {
        let host = FakeHost::new();
        host.set_records(3);
        let base = spawn_api(host.clone()).await;

        let record: Value = client()
            .post(format!("{}/backups", base))
            .header(API_KEY_HEADER, "test-key")
            .json(&json!({ "host": "app.test", "name": "b1" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(record["name"], "b1");
        assert!(host.has_archive("b1"));

        let listing: Value = client()
            .get(format!("{}/backups?host=app.test", base))
            .header(API_KEY_HEADER, "test-key")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listing["backups"][0]["name"], "b1");

        host.add_records(2);
        let resp = client()
            .post(format!("{}/backups/b1/restore", base))
            .header(API_KEY_HEADER, "test-key")
            .json(&json!({ "host": "app.test" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "confirmation_declined");
        assert_eq!(host.records(), 5);

        let resp = client()
            .post(format!("{}/backups/b1/restore", base))
            .header(API_KEY_HEADER, "test-key")
            .json(&json!({ "host": "app.test", "confirm": "yes-destroy-current-state" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(host.records(), 3);

        let resp = client()
            .post(format!("{}/backups/missing/restore", base))
            .header(API_KEY_HEADER, "test-key")
            .json(&json!({ "host": "app.test", "confirm": "yes-destroy-current-state" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }
}
