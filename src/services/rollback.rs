//! 回滚目标选择
//!
//! 从仓库取最近 N 个 tag（按发布时间倒序），排除当前 tag 和可变别名，
//! 剩下的第一个即为回滚候选。决策不会自动确认

use std::sync::Arc;
use tracing::info;

use crate::domain::artifact::{is_valid_tag, ArtifactReference, TagPolicy};
use crate::domain::rollback::RollbackDecision;
use crate::error::{DeployError, DeployResult};
use crate::infra::registry::{TagInfo, TagRegistry};

/// 回滚选择器
#[derive(Clone)]
pub struct RollbackSelector {
    registry: Arc<dyn TagRegistry>,
    policy: TagPolicy,
    /// 查询的 tag 数量
    window: usize,
}

impl RollbackSelector {
    pub fn new(registry: Arc<dyn TagRegistry>, policy: TagPolicy, window: usize) -> Self {
        Self {
            registry,
            policy,
            window: window.max(1),
        }
    }

    /// 可变别名策略
    pub fn policy(&self) -> &TagPolicy {
        &self.policy
    }

    /// 最近发布的 tag（供 `--list-tags` 使用）
    pub async fn list_tags(&self, repository: &str) -> DeployResult<Vec<TagInfo>> {
        self.registry.recent_tags(repository, self.window).await
    }

    /// 选择回滚候选
    pub async fn select(&self, repository: &str, current_tag: &str) -> DeployResult<RollbackDecision> {
        let tags = self.list_tags(repository).await?;
        let candidate = pick_candidate(&tags, current_tag, &self.policy).ok_or_else(|| {
            DeployError::NoRollbackCandidate {
                repository: repository.to_string(),
                current: current_tag.to_string(),
            }
        })?;

        info!(
            repository,
            current = current_tag,
            candidate = %candidate.name,
            "Selected rollback candidate"
        );

        Ok(RollbackDecision::new(
            ArtifactReference::new(repository, current_tag),
            ArtifactReference::new(repository, candidate.name.clone()),
            format!(
                "most recent immutable tag among the last {} published (excluding {})",
                self.window, current_tag
            ),
        ))
    }

    /// 为运维指定的 tag 构造决策
    ///
    /// tag 必须是仓库中存在的不可变版本，且不是当前版本
    pub async fn decide_explicit(
        &self,
        repository: &str,
        current_tag: &str,
        tag: &str,
    ) -> DeployResult<RollbackDecision> {
        if !is_valid_tag(tag) || self.policy.is_mutable(tag) {
            return Err(DeployError::invalid_input(format!(
                "'{}' is not an immutable release tag",
                tag
            )));
        }
        if tag == current_tag {
            return Err(DeployError::invalid_input(format!(
                "'{}' is already the current tag",
                tag
            )));
        }

        let tags = self.list_tags(repository).await?;
        if !tags.iter().any(|t| t.name == tag) {
            return Err(DeployError::not_found(format!("tag '{}' in {}", tag, repository)));
        }

        Ok(RollbackDecision::new(
            ArtifactReference::new(repository, current_tag),
            ArtifactReference::new(repository, tag),
            "requested by operator",
        ))
    }
}

/// 候选选择：输入已按发布时间倒序
pub fn pick_candidate<'a>(tags: &'a [TagInfo], current_tag: &str, policy: &TagPolicy) -> Option<&'a TagInfo> {
    tags.iter()
        .find(|t| t.name != current_tag && !policy.is_mutable(&t.name))
}
