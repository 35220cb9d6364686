//! 测试用的内存假主机、假探测和静态仓库

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::env::constants::*;
use crate::config::env::{AppSettings, BackupSettings, EnvConfig, RegistrySettings, SshSettings};
use crate::domain::health::{DependencyStatus, HealthBody, HealthCheckResult};
use crate::domain::target::DeploymentTarget;
use crate::error::{DeployError, DeployResult};
use crate::infra::command::CommandOutput;
use crate::infra::executor::{RemoteCommand, RemoteExecutor};
use crate::infra::probe::HealthProbe;
use crate::infra::registry::{sort_by_recency, TagInfo, TagRegistry};
use crate::services::backup::{stage as backup_stage, StoreLayout};
use crate::services::deploy::compose::{stage as compose_stage, ComposeLayout};

#[derive(Clone, Debug)]
struct Archive {
    created_at: DateTime<Utc>,
    records: u64,
}

#[derive(Default)]
struct HostState {
    unreachable: bool,
    /// 前 N 次连接失败
    connect_failures: u32,
    db_down: bool,
    records: u64,
    workdirs: HashMap<String, u64>,
    archives: BTreeMap<String, Archive>,
    extracted: HashSet<String>,
    running_tag: Option<String>,
    /// `.env` 中的 IMAGE_TAG
    installed: Option<String>,
    marker: Option<String>,
    missing_images: HashSet<String>,
    failures: HashMap<&'static str, i32>,
    hang_on: Option<&'static str>,
    commands: Vec<(&'static str, Option<String>)>,
}

/// 按 stage 解释远程命令的假主机
#[derive(Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        stdout: stdout.into(),
        stderr: String::new(),
        exit_code: 0,
    }
}

fn exit(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: code,
    }
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn store_layout() -> StoreLayout {
        StoreLayout {
            backup_dir: "/var/backups/app".to_string(),
            container: "mongo".to_string(),
            cli_path: "xjp-rollout".to_string(),
        }
    }

    pub fn compose_layout() -> ComposeLayout {
        ComposeLayout {
            app_dir: "/opt/app".to_string(),
            compose_file: "docker-compose.yml".to_string(),
            service: Some("app".to_string()),
            env: BTreeMap::new(),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut HostState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.with(|s| s.unreachable = !reachable);
    }

    pub fn fail_connections(&self, count: u32) {
        self.with(|s| s.connect_failures = count);
    }

    pub fn set_db_up(&self, up: bool) {
        self.with(|s| s.db_down = !up);
    }

    pub fn set_records(&self, records: u64) {
        self.with(|s| s.records = records);
    }

    pub fn add_records(&self, count: u64) {
        self.with(|s| s.records += count);
    }

    pub fn records(&self) -> u64 {
        self.with(|s| s.records)
    }

    pub fn set_running(&self, tag: &str) {
        self.with(|s| {
            s.running_tag = Some(tag.to_string());
            s.installed = Some(tag.to_string());
            s.marker = Some(tag.to_string());
        });
    }

    pub fn running_tag(&self) -> Option<String> {
        self.with(|s| s.running_tag.clone())
    }

    pub fn marker(&self) -> Option<String> {
        self.with(|s| s.marker.clone())
    }

    pub fn missing_image(&self, tag: &str) {
        self.with(|s| s.missing_images.insert(tag.to_string()));
    }

    pub fn fail_stage(&self, stage: &'static str, exit_code: i32) {
        self.with(|s| s.failures.insert(stage, exit_code));
    }

    /// 执行到该 stage 时挂起直到取消
    pub fn hang_on(&self, stage: &'static str) {
        self.with(|s| s.hang_on = Some(stage));
    }

    pub fn insert_archive(&self, name: &str, created_at: DateTime<Utc>, records: u64) {
        self.with(|s| s.archives.insert(name.to_string(), Archive { created_at, records }));
    }

    pub fn has_archive(&self, name: &str) -> bool {
        self.with(|s| s.archives.contains_key(name))
    }

    pub fn has_workdir(&self, name: &str) -> bool {
        self.with(|s| s.workdirs.contains_key(name))
    }

    pub fn archive_names(&self) -> Vec<String> {
        self.with(|s| s.archives.keys().cloned().collect())
    }

    pub fn ran(&self, stage: &str) -> bool {
        self.with(|s| s.commands.iter().any(|(st, _)| *st == stage))
    }

    /// 某 stage 以指定 subject 执行的次数
    pub fn count(&self, stage: &str, subject: &str) -> usize {
        self.with(|s| {
            s.commands
                .iter()
                .filter(|(st, sub)| *st == stage && sub.as_deref() == Some(subject))
                .count()
        })
    }

    pub fn command_count(&self) -> usize {
        self.with(|s| s.commands.len())
    }

    fn execute(state: &mut HostState, command: &RemoteCommand) -> CommandOutput {
        if let Some(code) = state.failures.get(command.stage) {
            return exit(*code, "injected failure");
        }
        let subject = command.subject.clone().unwrap_or_default();

        match command.stage {
            compose_stage::PROBE | compose_stage::PREREQUISITES => ok(""),
            compose_stage::CONFIGURE => {
                state.installed = Some(subject);
                ok("")
            }
            compose_stage::PULL_IMAGE => {
                if state.missing_images.contains(&subject) {
                    exit(1, "manifest unknown")
                } else {
                    ok("")
                }
            }
            compose_stage::COMPOSE_UP => {
                state.running_tag = Some(subject);
                ok("")
            }
            compose_stage::READ_MARKER => ok(state.marker.clone().map(|m| m + "\n").unwrap_or_default()),
            compose_stage::READ_INSTALLED => ok(state.installed.clone().map(|t| t + "\n").unwrap_or_default()),
            compose_stage::CLEAR_MARKER => {
                state.marker = None;
                ok("")
            }
            compose_stage::WRITE_MARKER => {
                state.marker = Some(subject);
                ok("")
            }
            backup_stage::DB_PING | backup_stage::LIST_DATABASES if state.db_down => {
                exit(1, "MongoNetworkError: connect ECONNREFUSED")
            }
            backup_stage::DB_PING => ok("1\n"),
            backup_stage::LIST_DATABASES => ok("admin\nconfig\nlocal\ntodos\n"),
            backup_stage::DUMP => {
                state.workdirs.insert(subject, state.records);
                ok("")
            }
            backup_stage::COMPRESS => match state.workdirs.get(&subject) {
                Some(records) => {
                    let archive = Archive {
                        created_at: Utc::now(),
                        records: *records,
                    };
                    state.archives.insert(subject, archive);
                    ok("")
                }
                None => exit(2, "tar: cannot stat: No such file or directory"),
            },
            backup_stage::REMOVE_WORKDIR => {
                state.workdirs.remove(&subject);
                ok("")
            }
            backup_stage::STAT_ARCHIVE => match state.archives.get(&subject) {
                Some(a) => ok(format!("{} {}\n", a.created_at.timestamp(), 1024 + a.records * 64)),
                None => exit(1, "stat: cannot stat: No such file or directory"),
            },
            backup_stage::DISCARD => {
                state.workdirs.remove(&subject);
                state.archives.remove(&subject);
                ok("")
            }
            backup_stage::ARCHIVE_EXISTS => {
                if state.archives.contains_key(&subject) {
                    ok("")
                } else {
                    exit(1, "")
                }
            }
            backup_stage::EXTRACT => {
                if state.archives.contains_key(&subject) {
                    state.extracted.insert(subject);
                    ok("admin\ntodos\n")
                } else {
                    exit(2, "tar: Cannot open: No such file or directory")
                }
            }
            backup_stage::LOAD => {
                if state.db_down {
                    return exit(1, "MongoNetworkError: connect ECONNREFUSED");
                }
                match state.archives.get(&subject) {
                    Some(a) if state.extracted.contains(&subject) => {
                        state.records = a.records;
                        ok("")
                    }
                    _ => exit(1, "mongorestore: don't know what to do with file"),
                }
            }
            backup_stage::CLEANUP_EXTRACT => {
                state.extracted.remove(&subject);
                ok("")
            }
            backup_stage::LIST_ARCHIVES => ok(state
                .archives
                .iter()
                .map(|(name, a)| {
                    format!(
                        "{}.0000000000 {} {}.tar.gz\n",
                        a.created_at.timestamp(),
                        1024 + a.records * 64,
                        name
                    )
                })
                .collect::<String>()),
            backup_stage::DELETE_ARCHIVE => {
                state.archives.remove(&subject);
                ok("")
            }
            other => exit(127, &format!("unknown stage {}", other)),
        }
    }
}

#[async_trait]
impl RemoteExecutor for FakeHost {
    async fn run(
        &self,
        target: &DeploymentTarget,
        command: &RemoteCommand,
        cancel: &CancellationToken,
    ) -> DeployResult<CommandOutput> {
        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled);
        }

        let hang = self.with(|s| {
            if s.unreachable {
                return Err(DeployError::connectivity(target.key(), "Connection refused"));
            }
            if s.connect_failures > 0 {
                s.connect_failures -= 1;
                return Err(DeployError::connectivity(target.key(), "Connection timed out"));
            }
            s.commands.push((command.stage, command.subject.clone()));
            Ok(s.hang_on == Some(command.stage))
        })?;

        if hang {
            cancel.cancelled().await;
            return Err(DeployError::Cancelled);
        }

        Ok(self.with(|s| Self::execute(s, command)))
    }
}

/// 根据假主机上运行的 tag 判定健康
pub struct FakeProbe {
    host: Arc<FakeHost>,
    healthy_tags: HashSet<String>,
    polls: AtomicU32,
}

impl FakeProbe {
    pub fn new(host: Arc<FakeHost>, healthy_tags: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            host,
            healthy_tags: healthy_tags.iter().map(|t| t.to_string()).collect(),
            polls: AtomicU32::new(0),
        })
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn check(&self, endpoint: &str) -> DeployResult<HealthCheckResult> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let (running, db_up) = self.host.with(|s| (s.running_tag.clone(), !s.db_down));

        let healthy = running.map_or(false, |t| self.healthy_tags.contains(&t));
        let body = HealthBody {
            status: Some(if healthy { "healthy" } else { "unhealthy" }.to_string()),
            database: Some(DependencyStatus {
                status: Some(if db_up { "connected" } else { "disconnected" }.to_string()),
            }),
        };
        let http = if healthy && db_up { 200 } else { 503 };
        Ok(HealthCheckResult::from_response(endpoint, http, Some(body)))
    }
}

/// 固定 tag 列表的仓库
pub struct StaticRegistry {
    tags: Vec<TagInfo>,
}

impl StaticRegistry {
    pub fn new(mut tags: Vec<TagInfo>) -> Self {
        sort_by_recency(&mut tags);
        Self { tags }
    }
}

#[async_trait]
impl TagRegistry for StaticRegistry {
    async fn recent_tags(&self, repository: &str, limit: usize) -> DeployResult<Vec<TagInfo>> {
        if self.tags.is_empty() {
            return Err(DeployError::not_found(format!("repository '{}'", repository)));
        }
        Ok(self.tags.iter().take(limit).cloned().collect())
    }
}

/// 测试用环境配置
pub fn test_env_config() -> EnvConfig {
    EnvConfig {
        api_key: "test-key".to_string(),
        port: DEFAULT_PORT,
        ssh: SshSettings {
            user: "deploy".to_string(),
            identity_file: Some("/keys/id".to_string()),
            port: 2222,
        },
        registry: RegistrySettings {
            url: "http://127.0.0.1:9/v2".to_string(),
            docker_user: Some("rickyjim".to_string()),
            repo: "todo-app".to_string(),
            tag_window: ROLLBACK_TAG_WINDOW,
            mutable_tags: vec!["latest".to_string(), "canary".to_string()],
        },
        app: AppSettings {
            dir: "/opt/app".to_string(),
            compose_file: "docker-compose.yml".to_string(),
            service: None,
            health_url: DEFAULT_HEALTH_URL.to_string(),
            env_file: None,
        },
        backup: BackupSettings {
            dir: "/var/backups/app".to_string(),
            db_container: "mongo".to_string(),
            retention_days: RETENTION_DAYS,
        },
        health_interval_secs: HEALTH_INTERVAL_SECS,
        health_max_attempts: HEALTH_MAX_ATTEMPTS,
        reachability_attempts: 1,
    }
}
