//! 运行时状态模块
//!
//! 管理应用状态、部署尝试存储和目标锁

pub mod app_state;
pub mod attempt_store;
pub mod target_locks;

pub use app_state::AppState;
pub use attempt_store::AttemptStore;
pub use target_locks::{TargetLease, TargetLocks};
