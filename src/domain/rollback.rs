//! 回滚决策领域模型

use serde::Serialize;

use crate::domain::artifact::ArtifactReference;
use crate::error::DeployError;

/// 回滚决策
///
/// 由 RollbackSelector 创建，默认未确认。只有通过 [`RollbackDecision::confirm`]
/// 得到的 [`ConfirmedRollback`] 才能被执行
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct RollbackDecision {
    pub current: ArtifactReference,
    pub candidate: ArtifactReference,
    pub confirmed: bool,
    pub justification: String,
}

impl RollbackDecision {
    pub fn new(
        current: ArtifactReference,
        candidate: ArtifactReference,
        justification: impl Into<String>,
    ) -> Self {
        Self {
            current,
            candidate,
            confirmed: false,
            justification: justification.into(),
        }
    }

    /// 确认决策（交互确认或显式的非交互覆盖）
    pub fn confirm(mut self) -> ConfirmedRollback {
        self.confirmed = true;
        ConfirmedRollback(self)
    }

    /// `approved` 为 false 时返回 ConfirmationDeclined
    pub fn confirm_if(self, approved: bool) -> Result<ConfirmedRollback, DeployError> {
        if approved {
            Ok(self.confirm())
        } else {
            Err(DeployError::ConfirmationDeclined(format!(
                "rollback {} -> {} requires confirmation",
                self.current.tag, self.candidate.tag
            )))
        }
    }
}

/// 已确认的回滚决策
///
/// 执行时按值消费，同一决策只能执行一次
#[derive(Debug)]
pub struct ConfirmedRollback(RollbackDecision);

impl ConfirmedRollback {
    pub fn decision(&self) -> &RollbackDecision {
        &self.0
    }

    pub fn candidate(&self) -> &ArtifactReference {
        &self.0.candidate
    }

    /// 执行完成后取回决策记录
    pub fn into_decision(self) -> RollbackDecision {
        self.0
    }
}

/// 回滚后健康结果
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum HealthOutcome {
    Healthy,
    Unhealthy { detail: String },
}

/// 回滚摘要
#[derive(Clone, Debug, Serialize)]
pub struct RollbackSummary {
    pub previous: String,
    pub rolled_back_to: String,
    pub health_outcome: HealthOutcome,
}
