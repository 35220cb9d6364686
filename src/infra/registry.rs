//! 镜像仓库 HTTP Client
//!
//! 查询仓库已发布的 tag：`GET /repositories/{ns}/{repo}/tags?page_size=N`，
//! 返回类型化的结构，不解析命令行输出

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{DeployError, DeployResult};

/// tag 信息
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TagInfo {
    pub name: String,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

/// tag 列表响应
#[derive(Debug, Deserialize)]
struct TagPage {
    #[serde(default)]
    results: Vec<TagInfo>,
}

/// tag 查询接口
#[async_trait]
pub trait TagRegistry: Send + Sync {
    /// 最近发布的 tag，按发布时间倒序
    async fn recent_tags(&self, repository: &str, limit: usize) -> DeployResult<Vec<TagInfo>>;
}

/// 按发布时间倒序排序，没有时间的排在最后
pub fn sort_by_recency(tags: &mut [TagInfo]) {
    tags.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
}

/// 镜像仓库客户端（Docker Hub v2 兼容）
#[derive(Clone)]
pub struct RegistryClient {
    client: Client,
    base_url: String,
}

impl RegistryClient {
    /// 创建新的仓库客户端
    ///
    /// # Arguments
    /// * `base_url` - API 根地址（如 https://hub.docker.com/v2）
    pub fn new(base_url: impl Into<String>) -> DeployResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(2)
            .build()
            .map_err(|e| DeployError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn tags_url(&self, repository: &str, limit: usize) -> DeployResult<String> {
        let (namespace, repo) = repository
            .split_once('/')
            .filter(|(ns, repo)| !ns.is_empty() && !repo.is_empty() && !repo.contains('/'))
            .ok_or_else(|| {
                DeployError::invalid_input(format!(
                    "repository '{}' must look like <namespace>/<name>",
                    repository
                ))
            })?;
        Ok(format!(
            "{}/repositories/{}/{}/tags?page_size={}&ordering=last_updated",
            self.base_url, namespace, repo, limit
        ))
    }
}

#[async_trait]
impl TagRegistry for RegistryClient {
    async fn recent_tags(&self, repository: &str, limit: usize) -> DeployResult<Vec<TagInfo>> {
        let url = self.tags_url(repository, limit)?;
        debug!(url = %url, "Fetching tags");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DeployError::Registry(format!("request to {} failed: {}", url, e)))?;

        match resp.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(DeployError::not_found(format!("repository '{}'", repository)));
            }
            status => {
                warn!(status = %status, repository, "Registry returned error status");
                return Err(DeployError::Registry(format!(
                    "{} returned {}",
                    url, status
                )));
            }
        }

        let page: TagPage = resp
            .json()
            .await
            .map_err(|e| DeployError::Registry(format!("invalid tag list: {}", e)))?;

        let mut tags = page.results;
        sort_by_recency(&mut tags);
        tags.truncate(limit);
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Path, http::StatusCode as AxumStatus, routing::get, Json, Router};

    async fn spawn_registry() -> String {
        let app = Router::new().route(
            "/v2/repositories/:ns/:repo/tags",
            get(|Path((ns, repo)): Path<(String, String)>| async move {
                if ns != "rickyjim" || repo != "todo-app" {
                    return Err(AxumStatus::NOT_FOUND);
                }
                Ok(Json(serde_json::json!({
                    "count": 3,
                    "results": [
                        {"name": "v1.0.0", "last_updated": "2024-01-01T00:00:00Z"},
                        {"name": "latest", "last_updated": "2024-02-01T00:00:00Z"},
                        {"name": "v1.1.0", "last_updated": "2024-02-01T00:00:00Z"}
                    ]
                })))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/v2", addr)
    }

    #[test]
    fn test_tags_url() {
        let client = RegistryClient::new("https://hub.docker.com/v2/").unwrap();
        assert_eq!(
            client.tags_url("rickyjim/todo-app", 10).unwrap(),
            "https://hub.docker.com/v2/repositories/rickyjim/todo-app/tags?page_size=10&ordering=last_updated"
        );
        assert!(client.tags_url("todo-app", 10).is_err());
        assert!(client.tags_url("a/b/c", 10).is_err());
    }

    #[tokio::test]
    async fn test_recent_tags_sorted() {
        let base = spawn_registry().await;
        let client = RegistryClient::new(base).unwrap();

        let tags = client.recent_tags("rickyjim/todo-app", 10).await.unwrap();
        assert_eq!(tags.len(), 3);
        assert_eq!(tags[2].name, "v1.0.0");
        assert!(tags[0].last_updated >= tags[1].last_updated);
    }

    #[tokio::test]
    async fn test_recent_tags_missing_repo() {
        let base = spawn_registry().await;
        let client = RegistryClient::new(base).unwrap();

        let err = client.recent_tags("rickyjim/other", 10).await.unwrap_err();
        assert!(matches!(err, DeployError::NotFound(_)));
    }
}
