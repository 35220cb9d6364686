//! 备份 / 恢复服务
//!
//! 在目标主机上对数据容器做时间点快照：
//! dump 到工作目录 → 压缩为 `<name>.tar.gz`（每个逻辑库一个目录）→ 删除工作目录。
//! 任何一步失败都会删除工作目录和不完整的归档

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::backup::{
    archive_file, check_confirmation, default_backup_name, parse_archive_listing, validate_backup_name,
    validate_cron_spec, BackupRecord, ScheduleEntry,
};
use crate::domain::target::DeploymentTarget;
use crate::error::{DeployError, DeployResult};
use crate::infra::executor::{shell_quote, RemoteCommand, RemoteExecutor};
use crate::state::target_locks::TargetLocks;

/// 备份相关的远程操作名
pub mod stage {
    pub const DB_PING: &str = "db_ping";
    pub const DUMP: &str = "dump";
    pub const COMPRESS: &str = "compress";
    pub const REMOVE_WORKDIR: &str = "remove_workdir";
    pub const STAT_ARCHIVE: &str = "stat_archive";
    pub const DISCARD: &str = "discard";
    pub const ARCHIVE_EXISTS: &str = "archive_exists";
    pub const EXTRACT: &str = "extract";
    pub const LOAD: &str = "load";
    pub const CLEANUP_EXTRACT: &str = "cleanup_extract";
    pub const LIST_DATABASES: &str = "list_databases";
    pub const LIST_ARCHIVES: &str = "list_archives";
    pub const DELETE_ARCHIVE: &str = "delete_archive";
}

/// 数据存储在目标主机上的布局
#[derive(Clone, Debug)]
pub struct StoreLayout {
    /// 备份目录
    pub backup_dir: String,
    /// 数据库容器名
    pub container: String,
    /// 定时任务调用的本工具路径
    pub cli_path: String,
}

impl StoreLayout {
    fn dir(&self) -> &str {
        self.backup_dir.trim_end_matches('/')
    }

    fn workdir(&self, name: &str) -> String {
        format!("{}/{}", self.dir(), name)
    }

    fn archive(&self, name: &str) -> String {
        format!("{}/{}", self.dir(), archive_file(name))
    }

    fn extract_dir(&self, name: &str) -> String {
        format!("{}/.restore-{}", self.dir(), name)
    }

    fn exec(&self, args: &str) -> String {
        format!("docker exec {} {}", shell_quote(&self.container), args)
    }

    pub fn db_ping(&self) -> RemoteCommand {
        RemoteCommand::new(
            stage::DB_PING,
            self.exec("mongosh --quiet --eval 'db.adminCommand({ping: 1}).ok'"),
        )
    }

    /// 在容器内 dump，再复制到主机工作目录
    pub fn dump(&self, name: &str) -> RemoteCommand {
        let tmp = format!("/tmp/{}", name);
        RemoteCommand::new(
            stage::DUMP,
            format!(
                "mkdir -p {dir} && {rm} && {dump} && docker cp {src} {dst} && {rm}",
                dir = shell_quote(self.dir()),
                rm = self.exec(&format!("rm -rf {}", tmp)),
                dump = self.exec(&format!("mongodump --quiet --out {}", tmp)),
                src = shell_quote(&format!("{}:{}", self.container, tmp)),
                dst = shell_quote(&self.workdir(name)),
            ),
        )
        .with_subject(name)
    }

    pub fn compress(&self, name: &str) -> RemoteCommand {
        RemoteCommand::new(
            stage::COMPRESS,
            format!(
                "tar -czf {} -C {} {}",
                shell_quote(&self.archive(name)),
                shell_quote(self.dir()),
                shell_quote(name)
            ),
        )
        .with_subject(name)
    }

    pub fn remove_workdir(&self, name: &str) -> RemoteCommand {
        RemoteCommand::new(
            stage::REMOVE_WORKDIR,
            format!("rm -rf {}", shell_quote(&self.workdir(name))),
        )
        .with_subject(name)
    }

    /// 输出 `<mtime> <size>`
    pub fn stat_archive(&self, name: &str) -> RemoteCommand {
        RemoteCommand::new(
            stage::STAT_ARCHIVE,
            format!("stat -c '%Y %s' {}", shell_quote(&self.archive(name))),
        )
        .with_subject(name)
    }

    /// 失败后清理：工作目录和归档都删除
    pub fn discard(&self, name: &str) -> RemoteCommand {
        RemoteCommand::new(
            stage::DISCARD,
            format!(
                "rm -rf {} {}",
                shell_quote(&self.workdir(name)),
                shell_quote(&self.archive(name))
            ),
        )
        .with_subject(name)
    }

    /// 归档存在时退出码为 0
    pub fn archive_exists(&self, name: &str) -> RemoteCommand {
        RemoteCommand::new(
            stage::ARCHIVE_EXISTS,
            format!("test -f {}", shell_quote(&self.archive(name))),
        )
        .with_subject(name)
    }

    /// 解压并输出归档中的逻辑库目录名
    pub fn extract(&self, name: &str) -> RemoteCommand {
        let dir = shell_quote(&self.extract_dir(name));
        RemoteCommand::new(
            stage::EXTRACT,
            format!(
                "rm -rf {dir} && mkdir -p {dir} && tar -xzf {archive} -C {dir} && ls -1 {dir}/{name}",
                dir = dir,
                archive = shell_quote(&self.archive(name)),
                name = shell_quote(name),
            ),
        )
        .with_subject(name)
    }

    /// 删除现有数据并加载归档内容
    pub fn load(&self, name: &str) -> RemoteCommand {
        let tmp = format!("/tmp/restore-{}", name);
        RemoteCommand::new(
            stage::LOAD,
            format!(
                "docker cp {src} {dst} && {restore} && {rm}",
                src = shell_quote(&format!("{}/{}", self.extract_dir(name), name)),
                dst = shell_quote(&format!("{}:{}", self.container, tmp)),
                restore = self.exec(&format!("mongorestore --quiet --drop {}", tmp)),
                rm = self.exec(&format!("rm -rf {}", tmp)),
            ),
        )
        .with_subject(name)
    }

    pub fn cleanup_extract(&self, name: &str) -> RemoteCommand {
        RemoteCommand::new(
            stage::CLEANUP_EXTRACT,
            format!("rm -rf {}", shell_quote(&self.extract_dir(name))),
        )
        .with_subject(name)
    }

    /// 每行一个库名
    pub fn list_databases(&self) -> RemoteCommand {
        RemoteCommand::new(
            stage::LIST_DATABASES,
            self.exec(
                "mongosh --quiet --eval 'db.adminCommand({listDatabases: 1}).databases.map(d => d.name).join(\"\\n\")'",
            ),
        )
    }

    /// 输出 `<mtime> <size> <file>`
    pub fn list_archives(&self) -> RemoteCommand {
        RemoteCommand::new(
            stage::LIST_ARCHIVES,
            format!(
                "mkdir -p {dir} && find {dir} -maxdepth 1 -type f -name '*.tar.gz' -printf '%T@ %s %f\\n'",
                dir = shell_quote(self.dir())
            ),
        )
    }

    pub fn delete_archive(&self, name: &str) -> RemoteCommand {
        RemoteCommand::new(
            stage::DELETE_ARCHIVE,
            format!("rm -f {}", shell_quote(&self.archive(name))),
        )
        .with_subject(name)
    }
}

/// 恢复结果
#[derive(Clone, Debug, serde::Serialize)]
pub struct RestoreReport {
    pub name: String,
    /// 恢复并校验过的逻辑库
    pub databases: Vec<String>,
}

/// 备份管理器
#[derive(Clone)]
pub struct BackupManager {
    executor: Arc<dyn RemoteExecutor>,
    locks: TargetLocks,
    layout: StoreLayout,
}

impl BackupManager {
    pub fn new(executor: Arc<dyn RemoteExecutor>, locks: TargetLocks, layout: StoreLayout) -> Self {
        Self {
            executor,
            locks,
            layout,
        }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// 创建备份，`name` 为空时使用时间戳名称
    pub async fn backup(
        &self,
        target: &DeploymentTarget,
        name: Option<&str>,
        cancel: &CancellationToken,
    ) -> DeployResult<BackupRecord> {
        let name = match name {
            Some(n) => n.to_string(),
            None => default_backup_name(chrono::Utc::now()),
        };
        validate_backup_name(&name)?;
        let _lease = self.locks.try_acquire(target, "backup")?;
        self.backup_under_lease(target, &name, cancel).await
    }

    /// 调用方已持有目标租约时使用（部署前的安全备份）
    pub(crate) async fn backup_under_lease(
        &self,
        target: &DeploymentTarget,
        name: &str,
        cancel: &CancellationToken,
    ) -> DeployResult<BackupRecord> {
        validate_backup_name(name)?;

        // 备份记录不可变：同名归档已存在时拒绝，失败清理也就不会删掉它
        let exists = self.executor.run(target, &self.layout.archive_exists(name), cancel).await?;
        if exists.success() {
            return Err(DeployError::invalid_input(format!("backup '{}' already exists", name)));
        }
        info!(target = %target, name, "Creating backup");

        let ping = self.executor.run(target, &self.layout.db_ping(), cancel).await?;
        if !ping.success() {
            error!(target = %target, stderr = %ping.stderr.trim(), "Data store unreachable");
            return Err(DeployError::backup(format!(
                "data store in container '{}' is unreachable",
                self.layout.container
            )));
        }

        match self.create_archive(target, name, cancel).await {
            Ok(record) => {
                info!(target = %target, name, size_bytes = record.size_bytes, "Backup created");
                Ok(record)
            }
            Err(e) => {
                warn!(target = %target, name, error = %e, "Backup failed, discarding partial output");
                // 原 token 可能已取消，清理使用独立 token
                if let Err(discard_err) = self
                    .executor
                    .run_checked(target, &self.layout.discard(name), &CancellationToken::new())
                    .await
                {
                    error!(target = %target, name, error = %discard_err, "Failed to discard partial backup");
                }
                Err(match e {
                    DeployError::ExternalTool { .. } => DeployError::backup(e.to_string()),
                    other => other,
                })
            }
        }
    }

    async fn create_archive(
        &self,
        target: &DeploymentTarget,
        name: &str,
        cancel: &CancellationToken,
    ) -> DeployResult<BackupRecord> {
        let exec = &self.executor;
        exec.run_checked(target, &self.layout.dump(name), cancel).await?;
        exec.run_checked(target, &self.layout.compress(name), cancel).await?;
        exec.run_checked(target, &self.layout.remove_workdir(name), cancel).await?;

        let stat = exec.run_checked(target, &self.layout.stat_archive(name), cancel).await?;
        let line = format!("{} {}", stat.stdout.trim(), archive_file(name));
        parse_archive_listing(&line, &target.key())
            .into_iter()
            .next()
            .ok_or_else(|| DeployError::backup(format!("unexpected stat output '{}'", stat.stdout.trim())))
    }

    /// 从备份恢复
    ///
    /// **不可逆**：会删除目标上的现有数据，再加载归档内容，没有撤销路径。
    /// `confirmation` 必须等于 [`crate::domain::RESTORE_CONFIRMATION_TOKEN`]，
    /// 否则在发出任何远程命令之前返回 `ConfirmationDeclined`。
    /// 归档不存在时返回 `NotFound`，现有数据保持不变
    pub async fn restore(
        &self,
        target: &DeploymentTarget,
        name: &str,
        confirmation: Option<&str>,
        cancel: &CancellationToken,
    ) -> DeployResult<RestoreReport> {
        check_confirmation(confirmation)?;
        validate_backup_name(name)?;
        let _lease = self.locks.try_acquire(target, "restore")?;
        let exec = &self.executor;

        let exists = exec.run(target, &self.layout.archive_exists(name), cancel).await?;
        if !exists.success() {
            return Err(DeployError::not_found(format!("backup '{}'", name)));
        }

        let ping = exec.run(target, &self.layout.db_ping(), cancel).await?;
        if !ping.success() {
            return Err(DeployError::backup(format!(
                "data store in container '{}' is unreachable",
                self.layout.container
            )));
        }

        warn!(target = %target, name, "Restoring backup, existing data will be dropped");

        let result = self.load_archive(target, name, cancel).await;
        if let Err(e) = exec
            .run_checked(target, &self.layout.cleanup_extract(name), &CancellationToken::new())
            .await
        {
            warn!(target = %target, name, error = %e, "Failed to remove extracted archive");
        }
        let databases = result?;

        let listed = exec.run_checked(target, &self.layout.list_databases(), cancel).await?;
        let present: Vec<&str> = listed.stdout.lines().map(str::trim).collect();
        let missing: Vec<&String> = databases
            .iter()
            .filter(|db| !present.contains(&db.as_str()))
            .collect();
        if !missing.is_empty() {
            error!(target = %target, name, ?missing, "Post-restore verification failed");
            return Err(DeployError::backup(format!(
                "databases missing after restore: {:?}",
                missing
            )));
        }

        info!(target = %target, name, ?databases, "Backup restored");
        Ok(RestoreReport {
            name: name.to_string(),
            databases,
        })
    }

    async fn load_archive(
        &self,
        target: &DeploymentTarget,
        name: &str,
        cancel: &CancellationToken,
    ) -> DeployResult<Vec<String>> {
        let extracted = self
            .executor
            .run_checked(target, &self.layout.extract(name), cancel)
            .await?;
        let databases: Vec<String> = extracted
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        if databases.is_empty() {
            return Err(DeployError::backup(format!("archive '{}' contains no databases", name)));
        }

        self.executor
            .run_checked(target, &self.layout.load(name), cancel)
            .await?;
        Ok(databases)
    }

    /// 列出备份（按时间倒序）
    pub async fn list(
        &self,
        target: &DeploymentTarget,
        cancel: &CancellationToken,
    ) -> DeployResult<BoxStream<'static, BackupRecord>> {
        let records = self.fetch_records(target, cancel).await?;
        Ok(stream::iter(records).boxed())
    }

    async fn fetch_records(
        &self,
        target: &DeploymentTarget,
        cancel: &CancellationToken,
    ) -> DeployResult<Vec<BackupRecord>> {
        let output = self
            .executor
            .run_checked(target, &self.layout.list_archives(), cancel)
            .await?;
        Ok(parse_archive_listing(&output.stdout, &target.key()))
    }

    /// 超过保留期的备份（不删除）
    pub async fn cleanup_candidates(
        &self,
        target: &DeploymentTarget,
        retention_days: u32,
        cancel: &CancellationToken,
    ) -> DeployResult<Vec<BackupRecord>> {
        let now = chrono::Utc::now();
        Ok(self
            .fetch_records(target, cancel)
            .await?
            .into_iter()
            .filter(|r| r.is_expired(now, retention_days))
            .collect())
    }

    /// 删除超过保留期的备份，返回删除数量
    ///
    /// 有待删除记录时必须 `confirmed`
    pub async fn cleanup(
        &self,
        target: &DeploymentTarget,
        retention_days: u32,
        confirmed: bool,
        cancel: &CancellationToken,
    ) -> DeployResult<usize> {
        let _lease = self.locks.try_acquire(target, "cleanup")?;
        let expired = self.cleanup_candidates(target, retention_days, cancel).await?;
        if expired.is_empty() {
            info!(target = %target, retention_days, "No backups older than retention window");
            return Ok(0);
        }
        if !confirmed {
            return Err(DeployError::ConfirmationDeclined(format!(
                "{} backup(s) older than {} days would be deleted",
                expired.len(),
                retention_days
            )));
        }

        let mut deleted = 0;
        for record in &expired {
            self.executor
                .run_checked(target, &self.layout.delete_archive(&record.name), cancel)
                .await?;
            info!(target = %target, name = %record.name, "Deleted expired backup");
            deleted += 1;
        }
        Ok(deleted)
    }

    /// 生成定时备份条目（由外部调度器注册）
    pub fn schedule(&self, target: &DeploymentTarget, cron_spec: &str) -> DeployResult<ScheduleEntry> {
        let period = validate_cron_spec(cron_spec)?;
        let mut command = format!(
            "{} backup --host {} --user {} --port {} --dir {}",
            self.layout.cli_path,
            shell_quote(&target.host),
            shell_quote(&target.user),
            target.port,
            shell_quote(&self.layout.backup_dir)
        );
        if let Some(ref key) = target.identity_file {
            command.push_str(&format!(" --identity {}", shell_quote(key)));
        }
        Ok(ScheduleEntry {
            target: target.key(),
            period,
            command,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backup::RESTORE_CONFIRMATION_TOKEN;
    use crate::infra::testing::FakeHost;
    use chrono::{Duration, Utc};

    fn setup() -> (Arc<FakeHost>, BackupManager, DeploymentTarget) {
        let host = FakeHost::new();
        let manager = BackupManager::new(host.clone(), TargetLocks::new(), FakeHost::store_layout());
        (host, manager, DeploymentTarget::new("db-host", "deploy"))
    }

    #[tokio::test]
    async fn test_backup_creates_archive_and_removes_workdir() {
        let (host, manager, target) = setup();
        host.set_records(3);

        let record = manager
            .backup(&target, Some("b1"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(record.name, "b1");
        assert_eq!(record.source_target, target.key());
        assert!(host.has_archive("b1"));
        assert!(!host.has_workdir("b1"));
    }

    #[tokio::test]
    async fn test_backup_default_name() {
        let (_host, manager, target) = setup();
        let record = manager.backup(&target, None, &CancellationToken::new()).await.unwrap();
        assert!(record.name.starts_with("backup_"));
    }

    #[tokio::test]
    async fn test_backup_fails_when_store_down() {
        let (host, manager, target) = setup();
        host.set_db_up(false);

        let err = manager
            .backup(&target, Some("b1"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Backup(_)));
        assert!(!host.has_archive("b1"));
    }

    #[tokio::test]
    async fn test_failed_compress_leaves_nothing_behind() {
        let (host, manager, target) = setup();
        host.fail_stage(stage::COMPRESS, 2);

        let err = manager
            .backup(&target, Some("b1"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::Backup(_)));
        assert!(!host.has_archive("b1"));
        assert!(!host.has_workdir("b1"));
        assert!(host.ran(stage::DISCARD));
    }

    #[tokio::test]
    async fn test_existing_backup_name_is_rejected() {
        let (host, manager, target) = setup();
        let cancel = CancellationToken::new();
        host.set_records(3);
        manager.backup(&target, Some("b1"), &cancel).await.unwrap();

        host.fail_stage(stage::COMPRESS, 2);
        let err = manager.backup(&target, Some("b1"), &cancel).await.unwrap_err();

        assert!(matches!(err, DeployError::InvalidInput(_)));
        assert!(host.has_archive("b1"));
        assert_eq!(host.count(stage::DUMP, "b1"), 1);
        assert!(!host.ran(stage::DISCARD));
    }

    #[tokio::test]
    async fn test_restore_round_trip() {
        let (host, manager, target) = setup();
        let cancel = CancellationToken::new();
        host.set_records(3);

        manager.backup(&target, Some("b1"), &cancel).await.unwrap();
        host.add_records(2);
        assert_eq!(host.records(), 5);

        let report = manager
            .restore(&target, "b1", Some(RESTORE_CONFIRMATION_TOKEN), &cancel)
            .await
            .unwrap();

        assert_eq!(host.records(), 3);
        assert!(report.databases.contains(&"todos".to_string()));
    }

    #[tokio::test]
    async fn test_restore_missing_backup() {
        let (host, manager, target) = setup();
        host.set_records(4);

        let err = manager
            .restore(&target, "missing", Some(RESTORE_CONFIRMATION_TOKEN), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::NotFound(_)));
        assert_eq!(host.records(), 4);
        assert!(!host.ran(stage::LOAD));
    }

    #[tokio::test]
    async fn test_restore_requires_token() {
        let (host, manager, target) = setup();
        let cancel = CancellationToken::new();
        manager.backup(&target, Some("b1"), &cancel).await.unwrap();
        let before = host.command_count();

        for token in [None, Some("yes")] {
            let err = manager.restore(&target, "b1", token, &cancel).await.unwrap_err();
            assert!(matches!(err, DeployError::ConfirmationDeclined(_)));
        }
        assert_eq!(host.command_count(), before);
    }

    #[tokio::test]
    async fn test_restore_rejected_while_target_busy() {
        let host = FakeHost::new();
        let locks = TargetLocks::new();
        let manager = BackupManager::new(host.clone(), locks.clone(), FakeHost::store_layout());
        let target = DeploymentTarget::new("db-host", "deploy");

        let _lease = locks.try_acquire(&target, "deploy").unwrap();
        let err = manager
            .restore(&target, "b1", Some(RESTORE_CONFIRMATION_TOKEN), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::TargetBusy(_)));
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let (host, manager, target) = setup();
        let now = Utc::now();
        host.insert_archive("old", now - Duration::days(3), 1);
        host.insert_archive("new", now - Duration::hours(1), 1);
        host.insert_archive("mid", now - Duration::days(1), 1);

        let names: Vec<String> = manager
            .list(&target, &CancellationToken::new())
            .await
            .unwrap()
            .map(|r| r.name)
            .collect()
            .await;
        assert_eq!(names, vec!["new", "mid", "old"]);
    }

    #[tokio::test]
    async fn test_cleanup_requires_confirmation() {
        let (host, manager, target) = setup();
        let cancel = CancellationToken::new();
        let now = Utc::now();
        host.insert_archive("expired-1", now - Duration::days(10), 1);
        host.insert_archive("expired-2", now - Duration::days(30), 1);
        host.insert_archive("fresh", now - Duration::days(1), 1);

        let err = manager.cleanup(&target, 7, false, &cancel).await.unwrap_err();
        assert!(matches!(err, DeployError::ConfirmationDeclined(_)));
        assert!(host.has_archive("expired-1"));

        let deleted = manager.cleanup(&target, 7, true, &cancel).await.unwrap();
        assert_eq!(deleted, 2);
        assert!(!host.has_archive("expired-1"));
        assert!(!host.has_archive("expired-2"));
        assert!(host.has_archive("fresh"));
    }

    #[tokio::test]
    async fn test_cleanup_nothing_to_delete() {
        let (host, manager, target) = setup();
        host.insert_archive("fresh", Utc::now(), 1);

        let deleted = manager
            .cleanup(&target, 7, false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(deleted, 0);
    }

    #[tokio::test]
    async fn test_cleanup_with_huge_retention_keeps_everything() {
        let (host, manager, target) = setup();
        host.insert_archive("ancient", Utc::now() - Duration::days(3650), 1);

        let deleted = manager
            .cleanup(&target, u32::MAX, false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(deleted, 0);
        assert!(host.has_archive("ancient"));
    }

    #[test]
    fn test_schedule_entry() {
        let (_host, manager, target) = setup();
        let entry = manager.schedule(&target, "0 3 * * *").unwrap();
        assert_eq!(entry.period, "0 3 * * *");
        assert!(entry.command.contains("backup --host 'db-host' --user 'deploy'"));
        assert!(entry.crontab_line().starts_with("0 3 * * * "));

        assert!(manager.schedule(&target, "every day").is_err());
    }
}
