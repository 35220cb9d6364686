//! 部署相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::artifact::ArtifactReference;
use crate::error::{DeployError, ErrorKind};

/// 部署阶段
///
/// `Provisioned → Configured → Deploying → Verifying → Succeeded | Failed`，
/// `Failed → RollingBack → Deploying` 重新进入部署循环
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeployPhase {
    Provisioned,
    Configured,
    Deploying,
    Verifying,
    Succeeded,
    Failed,
    RollingBack,
}

impl DeployPhase {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployPhase::Provisioned => "provisioned",
            DeployPhase::Configured => "configured",
            DeployPhase::Deploying => "deploying",
            DeployPhase::Verifying => "verifying",
            DeployPhase::Succeeded => "succeeded",
            DeployPhase::Failed => "failed",
            DeployPhase::RollingBack => "rolling_back",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeployPhase::Succeeded | DeployPhase::Failed)
    }

    /// 是否允许迁移到 `next`
    ///
    /// 任何非终态都可以直接失败
    pub fn can_transition_to(&self, next: DeployPhase) -> bool {
        use DeployPhase::*;
        match (self, next) {
            (Succeeded, _) | (Failed, _) => false,
            (_, Failed) => true,
            (Provisioned, Configured)
            | (Configured, Deploying)
            | (Deploying, Verifying)
            | (Verifying, Succeeded)
            | (RollingBack, Deploying) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for DeployPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 阶段迁移记录
#[derive(Clone, Debug, Serialize)]
pub struct PhaseTransition {
    pub phase: DeployPhase,
    pub at: DateTime<Utc>,
}

/// 部署结果（终态，设置后不可变）
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed {
        kind: ErrorKind,
        /// 失败时所处阶段
        phase: DeployPhase,
        detail: String,
    },
}

/// 一次部署尝试
#[derive(Clone, Debug, Serialize)]
pub struct DeploymentAttempt {
    pub id: String,
    /// 所属运行 ID（回滚尝试与原尝试共享）
    pub run_id: String,
    /// 目标标识
    pub target: String,
    pub artifact: ArtifactReference,
    pub phase: DeployPhase,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Option<AttemptOutcome>,
    pub transitions: Vec<PhaseTransition>,
}

impl DeploymentAttempt {
    /// 创建新尝试，初始阶段由调用方决定（正常部署为 Provisioned，回滚为 RollingBack）
    pub fn new(
        run_id: impl Into<String>,
        target: impl Into<String>,
        artifact: ArtifactReference,
        initial: DeployPhase,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            target: target.into(),
            artifact,
            phase: initial,
            started_at: now,
            ended_at: None,
            outcome: None,
            transitions: vec![PhaseTransition { phase: initial, at: now }],
        }
    }

    /// 迁移到下一阶段
    pub fn advance(&mut self, next: DeployPhase) -> Result<(), DeployError> {
        if next.is_terminal() || !self.phase.can_transition_to(next) {
            return Err(DeployError::InvalidTransition {
                from: self.phase.as_str(),
                to: next.as_str(),
            });
        }
        self.phase = next;
        self.transitions.push(PhaseTransition {
            phase: next,
            at: Utc::now(),
        });
        Ok(())
    }

    /// 标记成功
    pub fn succeed(&mut self) -> Result<(), DeployError> {
        self.complete(DeployPhase::Succeeded, AttemptOutcome::Succeeded)
    }

    /// 标记失败，记录失败阶段与错误类型
    pub fn fail(&mut self, err: &DeployError) -> Result<(), DeployError> {
        let outcome = AttemptOutcome::Failed {
            kind: err.kind(),
            phase: self.phase,
            detail: err.to_string(),
        };
        self.complete(DeployPhase::Failed, outcome)
    }

    fn complete(&mut self, terminal: DeployPhase, outcome: AttemptOutcome) -> Result<(), DeployError> {
        if self.outcome.is_some() || !self.phase.can_transition_to(terminal) {
            return Err(DeployError::InvalidTransition {
                from: self.phase.as_str(),
                to: terminal.as_str(),
            });
        }
        let now = Utc::now();
        self.phase = terminal;
        self.ended_at = Some(now);
        self.outcome = Some(outcome);
        self.transitions.push(PhaseTransition { phase: terminal, at: now });
        Ok(())
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self.outcome, Some(AttemptOutcome::Succeeded))
    }

    /// 失败类型（未失败返回 None）
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            Some(AttemptOutcome::Failed { kind, .. }) => Some(*kind),
            _ => None,
        }
    }

    /// 阶段路径，用于日志与断言
    pub fn phase_path(&self) -> Vec<DeployPhase> {
        self.transitions.iter().map(|t| t.phase).collect()
    }
}

/// 没有产生尝试就结束的运行
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunResult {
    /// 目标已运行该制品
    Noop,
    /// 在获取租约或连通性确认时失败
    Rejected { kind: ErrorKind, detail: String },
}

/// 运行级记录，供按运行 ID 查询
#[derive(Clone, Debug, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub target: String,
    pub artifact: ArtifactReference,
    #[serde(flatten)]
    pub result: RunResult,
    pub recorded_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn noop(run_id: impl Into<String>, target: impl Into<String>, artifact: ArtifactReference) -> Self {
        Self::new(run_id, target, artifact, RunResult::Noop)
    }

    pub fn rejected(
        run_id: impl Into<String>,
        target: impl Into<String>,
        artifact: ArtifactReference,
        err: &DeployError,
    ) -> Self {
        let result = RunResult::Rejected {
            kind: err.kind(),
            detail: err.to_string(),
        };
        Self::new(run_id, target, artifact, result)
    }

    fn new(run_id: impl Into<String>, target: impl Into<String>, artifact: ArtifactReference, result: RunResult) -> Self {
        Self {
            run_id: run_id.into(),
            target: target.into(),
            artifact,
            result,
            recorded_at: Utc::now(),
        }
    }
}
