//! 领域模型模块
//!
//! 纯数据结构，不依赖 axum/tokio

pub mod artifact;
pub mod backup;
pub mod deploy;
pub mod health;
pub mod rollback;
pub mod target;

// Re-exports for convenience
pub use artifact::{ArtifactReference, TagPolicy};
pub use backup::{BackupRecord, RetentionClass, ScheduleEntry, RESTORE_CONFIRMATION_TOKEN};
pub use deploy::{AttemptOutcome, DeployPhase, DeploymentAttempt, RunRecord, RunResult};
pub use health::HealthCheckResult;
pub use rollback::{ConfirmedRollback, HealthOutcome, RollbackDecision, RollbackSummary};
pub use target::{DeploymentTarget, Reachability};
