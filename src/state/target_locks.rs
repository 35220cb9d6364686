//! 按目标加锁
//!
//! 同一主机同一时间只允许一个部署或恢复操作，后来者直接被拒绝。
//! 租约按主机加锁，与 ssh 用户和端口无关

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

use crate::domain::target::DeploymentTarget;
use crate::error::DeployError;

/// 目标租约，drop 时释放
#[derive(Debug)]
pub struct TargetLease {
    key: String,
    operation: &'static str,
    _guard: OwnedMutexGuard<()>,
}

impl TargetLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }
}

/// 目标锁表
///
/// 多个控制器实例共享同一个 `TargetLocks` 即可互斥
#[derive(Clone, Default)]
pub struct TargetLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl TargetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尝试获取目标租约，已被占用时返回 `TargetBusy`
    pub fn try_acquire(&self, target: &DeploymentTarget, operation: &'static str) -> Result<TargetLease, DeployError> {
        let key = target.host_key();
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| DeployError::TargetBusy(format!("{} (lock table poisoned)", key)))?;
            locks.entry(key.clone()).or_default().clone()
        };

        match lock.try_lock_owned() {
            Ok(guard) => {
                tracing::debug!(target = %key, operation, "Acquired target lease");
                Ok(TargetLease {
                    key,
                    operation,
                    _guard: guard,
                })
            }
            Err(_) => {
                tracing::warn!(target = %key, operation, "Target is busy, rejecting operation");
                Err(DeployError::TargetBusy(key))
            }
        }
    }

    /// 目标当前是否被占用
    pub fn is_locked(&self, target: &DeploymentTarget) -> bool {
        let key = target.host_key();
        match self.locks.lock() {
            Ok(locks) => locks
                .get(&key)
                .map_or(false, |lock| lock.try_lock().is_err()),
            Err(_) => true,
        }
    }
}
