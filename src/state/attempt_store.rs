//! 部署尝试存储
//!
//! 管理活跃尝试和历史记录，以及每台主机上安装的制品和最近一次验证通过的制品

use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

use crate::config::env::constants::MAX_ATTEMPT_HISTORY;
use crate::domain::artifact::ArtifactReference;
use crate::domain::deploy::{DeploymentAttempt, RunRecord};
use crate::error::DeployError;

/// 尝试存储
pub struct AttemptStore {
    /// 活跃尝试 (target key -> attempt)
    active: RwLock<HashMap<String, DeploymentAttempt>>,
    /// 历史记录（最新在前）
    history: RwLock<VecDeque<DeploymentAttempt>>,
    /// 没有产生尝试的运行（最新在前）
    runs: RwLock<VecDeque<RunRecord>>,
    /// 每台主机最近一次验证通过的制品 (host key -> artifact)
    current: RwLock<HashMap<String, ArtifactReference>>,
    /// 每台主机已安装的制品，验证前即更新
    installed: RwLock<HashMap<String, ArtifactReference>>,
    /// 最大历史记录数
    max_history: usize,
}

impl AttemptStore {
    pub fn new() -> Self {
        Self::with_capacity(MAX_ATTEMPT_HISTORY)
    }

    pub fn with_capacity(max_history: usize) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            runs: RwLock::new(VecDeque::new()),
            current: RwLock::new(HashMap::new()),
            installed: RwLock::new(HashMap::new()),
            max_history,
        }
    }

    /// 登记新的活跃尝试
    ///
    /// 同一目标已有未结束的尝试时拒绝
    pub async fn begin(&self, attempt: &DeploymentAttempt) -> Result<(), DeployError> {
        let mut active = self.active.write().await;
        if let Some(existing) = active.get(&attempt.target) {
            if existing.outcome.is_none() {
                return Err(DeployError::TargetBusy(attempt.target.clone()));
            }
        }
        active.insert(attempt.target.clone(), attempt.clone());
        Ok(())
    }

    /// 更新活跃尝试快照
    pub async fn update(&self, attempt: &DeploymentAttempt) {
        let mut active = self.active.write().await;
        if let Some(slot) = active.get_mut(&attempt.target) {
            if slot.id == attempt.id {
                *slot = attempt.clone();
            }
        }
    }

    /// 结束尝试并移到历史记录
    pub async fn finish(&self, attempt: &DeploymentAttempt) {
        {
            let mut active = self.active.write().await;
            if active.get(&attempt.target).map_or(false, |a| a.id == attempt.id) {
                active.remove(&attempt.target);
            }
        }

        let mut history = self.history.write().await;
        history.push_front(attempt.clone());
        while history.len() > self.max_history {
            history.pop_back();
        }
    }

    /// 目标当前的活跃尝试
    pub async fn active(&self, target: &str) -> Option<DeploymentAttempt> {
        self.active.read().await.get(target).cloned()
    }

    /// 按尝试 ID 或运行 ID 查找（活跃在前，历史按时间倒序）
    pub async fn find(&self, id: &str) -> Vec<DeploymentAttempt> {
        let mut found: Vec<DeploymentAttempt> = self
            .active
            .read()
            .await
            .values()
            .filter(|a| a.id == id || a.run_id == id)
            .cloned()
            .collect();
        let history = self.history.read().await;
        found.extend(
            history
                .iter()
                .filter(|a| a.id == id || a.run_id == id)
                .cloned(),
        );
        found
    }

    /// 记录没有产生尝试的运行
    pub async fn record_run(&self, record: RunRecord) {
        let mut runs = self.runs.write().await;
        runs.retain(|r| r.run_id != record.run_id);
        runs.push_front(record);
        while runs.len() > self.max_history {
            runs.pop_back();
        }
    }

    /// 按运行 ID 查找运行级记录
    pub async fn run(&self, run_id: &str) -> Option<RunRecord> {
        self.runs
            .read()
            .await
            .iter()
            .find(|r| r.run_id == run_id)
            .cloned()
    }

    /// 活跃尝试数量
    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// 获取历史记录
    pub async fn history(&self, limit: usize, target: Option<&str>) -> Vec<DeploymentAttempt> {
        let history = self.history.read().await;
        history
            .iter()
            .filter(|a| target.map_or(true, |t| a.target == t))
            .take(limit)
            .cloned()
            .collect()
    }

    /// 主机上最近一次验证通过、且之后没有被改动的制品
    pub async fn current_artifact(&self, host: &str) -> Option<ArtifactReference> {
        self.current.read().await.get(host).cloned()
    }

    /// 主机上已安装的制品（可能未通过验证）
    pub async fn installed_artifact(&self, host: &str) -> Option<ArtifactReference> {
        self.installed.read().await.get(host).cloned()
    }

    /// 开始改动主机：记录新安装的制品并作废已验证的制品
    pub async fn mark_installed(&self, host: &str, artifact: ArtifactReference) {
        self.current.write().await.remove(host);
        self.installed.write().await.insert(host.to_string(), artifact);
    }

    /// 记录验证通过（或从远程标记读到）的制品
    pub async fn remember_current(&self, host: &str, artifact: ArtifactReference) {
        self.installed
            .write()
            .await
            .insert(host.to_string(), artifact.clone());
        self.current.write().await.insert(host.to_string(), artifact);
    }

    /// 记录从远程读到的已安装制品
    pub async fn remember_installed(&self, host: &str, artifact: ArtifactReference) {
        self.installed.write().await.insert(host.to_string(), artifact);
    }
}

impl Default for AttemptStore {
    fn default() -> Self {
        Self::new()
    }
}
