//! 命令行入口
//!
//! 子命令与 HTTP API 共用同一个 [`AppState`]，命令行参数覆盖环境配置

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api;
use crate::config::EnvConfig;
use crate::domain::artifact::ArtifactReference;
use crate::domain::rollback::HealthOutcome;
use crate::domain::target::DeploymentTarget;
use crate::error::{DeployError, DeployResult};
use crate::services::deploy::DeployOptions;
use crate::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "xjp-rollout")]
#[command(about = "Deploy, roll back and back up a containerized app on a single host")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// 目标主机参数
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// 目标主机
    #[arg(long, env = "DEPLOY_HOST")]
    pub host: String,

    /// SSH 用户（默认 DEPLOY_SSH_USER）
    #[arg(long)]
    pub user: Option<String>,

    /// SSH 端口
    #[arg(long)]
    pub port: Option<u16>,

    /// SSH 私钥
    #[arg(long)]
    pub identity: Option<String>,
}

impl TargetArgs {
    fn apply(&self, config: &mut EnvConfig) {
        if let Some(ref user) = self.user {
            config.ssh.user = user.clone();
        }
        if let Some(port) = self.port {
            config.ssh.port = port;
        }
        if self.identity.is_some() {
            config.ssh.identity_file = self.identity.clone();
        }
    }

    fn target(&self, config: &EnvConfig) -> DeploymentTarget {
        config.target(&self.host)
    }
}

/// 备份存储参数
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// 远程备份目录
    #[arg(long)]
    pub dir: Option<String>,
}

impl StoreArgs {
    fn apply(&self, config: &mut EnvConfig) {
        self.target.apply(config);
        if let Some(ref dir) = self.dir {
            config.backup.dir = dir.clone();
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Deploy an image tag to the target
    Deploy {
        #[command(flatten)]
        target: TargetArgs,

        /// Image tag
        #[arg(long)]
        tag: String,

        /// Registry namespace (overrides DOCKER_USER)
        #[arg(long)]
        docker_user: Option<String>,

        /// Pick a rollback candidate when verification fails
        #[arg(long)]
        auto_rollback: bool,

        /// Confirm the automatic rollback in advance
        #[arg(long, short = 'y')]
        yes: bool,

        /// Redeploy even if the target already runs this tag
        #[arg(long)]
        force: bool,

        /// Take a database backup before changing anything
        #[arg(long)]
        safety_backup: bool,

        /// Run the CRUD smoke test after the health check
        #[arg(long)]
        smoke: bool,

        /// Run id to record (e.g. the CI job id)
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Roll the target back to a previous tag
    Rollback {
        #[command(flatten)]
        target: TargetArgs,

        /// Registry namespace (overrides DOCKER_USER)
        #[arg(long)]
        docker_user: Option<String>,

        /// Roll back to this tag instead of the selected candidate
        #[arg(long)]
        tag: Option<String>,

        /// Only list recent tags
        #[arg(long)]
        list_tags: bool,

        /// Skip the interactive confirmation
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Poll the health endpoint of the target
    Verify {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Back up the database
    Backup {
        #[command(flatten)]
        store: StoreArgs,

        /// Backup name (defaults to a timestamp)
        #[arg(long)]
        name: Option<String>,
    },

    /// Restore the database from a backup (destructive)
    Restore {
        #[command(flatten)]
        store: StoreArgs,

        /// Backup name
        #[arg(long)]
        name: String,

        /// Confirmation token: yes-destroy-current-state
        #[arg(long)]
        confirm: Option<String>,
    },

    /// List backups, newest first
    List {
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Delete backups older than the retention window
    Cleanup {
        #[command(flatten)]
        store: StoreArgs,

        /// Retention in days (overrides RETENTION_DAYS)
        #[arg(long)]
        retention: Option<u32>,

        /// Skip the interactive confirmation
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Print a crontab line for periodic backups
    Schedule {
        #[command(flatten)]
        store: StoreArgs,

        /// Cron expression or @hourly/@daily/@weekly/@monthly
        #[arg(long, default_value = "@daily")]
        cron: String,
    },

    /// Run the HTTP control API
    Serve {
        /// Listen port (overrides PORT)
        #[arg(long)]
        port: Option<u16>,
    },
}

impl Command {
    /// 把命令行参数写入配置
    pub fn apply(&self, config: &mut EnvConfig) {
        match self {
            Command::Deploy {
                target, docker_user, ..
            }
            | Command::Rollback {
                target, docker_user, ..
            } => {
                target.apply(config);
                if docker_user.is_some() {
                    config.registry.docker_user = docker_user.clone();
                }
            }
            Command::Verify { target } => target.apply(config),
            Command::Backup { store, .. }
            | Command::Restore { store, .. }
            | Command::List { store }
            | Command::Cleanup { store, .. }
            | Command::Schedule { store, .. } => store.apply(config),
            Command::Serve { port } => {
                if let Some(port) = port {
                    config.port = *port;
                }
            }
        }
    }
}

/// 解析后的命令行入口：加载配置、组装状态并执行
///
/// 返回 `Ok(false)` 表示操作完成但结果失败（如部署验证失败）
pub async fn run(cli: Cli, cancel: CancellationToken) -> DeployResult<bool> {
    let mut config = EnvConfig::from_env();
    cli.command.apply(&mut config);
    let state = Arc::new(AppState::new(config)?);
    execute(state, cli.command, &cancel).await
}

/// 在给定状态上执行子命令
pub async fn execute(
    state: Arc<AppState>,
    command: Command,
    cancel: &CancellationToken,
) -> DeployResult<bool> {
    match command {
        Command::Deploy {
            target,
            tag,
            auto_rollback,
            yes,
            force,
            safety_backup,
            smoke,
            run_id,
            ..
        } => {
            let target = target.target(&state.config);
            let artifact = ArtifactReference::new(state.controller.repository(), tag);
            let opts = DeployOptions {
                auto_rollback,
                confirmed: yes,
                force,
                safety_backup,
                smoke_test: smoke,
                health: state.config.verify_options(),
                run_id,
            };
            let report = state.controller.deploy(target, artifact, &opts, cancel).await?;
            print_json(&report);

            if let Some(failure) = report.failure() {
                eprintln!("error[{}]: {}", failure.kind, failure.detail);
            }
            if let Some(ref rollback) = report.rollback {
                if !rollback.executed() {
                    eprintln!(
                        "rollback candidate {} not confirmed; rerun `rollback --tag {}` to apply it",
                        rollback.decision.candidate.tag, rollback.decision.candidate.tag
                    );
                }
            }
            if let Some(ref e) = report.rollback_error {
                eprintln!("error[{}]: rollback: {}", e.kind, e.detail);
            }
            Ok(report.succeeded())
        }

        Command::Rollback {
            target,
            tag,
            list_tags,
            yes,
            ..
        } => {
            if list_tags {
                let tags = state
                    .controller
                    .selector()
                    .list_tags(state.controller.repository())
                    .await?;
                for t in tags {
                    let updated = t
                        .last_updated
                        .map(|d| d.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string());
                    println!("{}\t{}", t.name, updated);
                }
                return Ok(true);
            }

            let target = target.target(&state.config);
            let decision = state
                .controller
                .plan_rollback(&target, tag.as_deref(), cancel)
                .await?;
            println!(
                "Rollback {}: {} -> {} ({})",
                target, decision.current.tag, decision.candidate.tag, decision.justification
            );

            let approved = yes || prompt_yes_no("Proceed with rollback?").await;
            let confirmed = decision.confirm_if(approved)?;
            let opts = DeployOptions {
                confirmed: true,
                health: state.config.verify_options(),
                ..Default::default()
            };
            let report = state
                .controller
                .execute_rollback(target, confirmed, &opts, cancel)
                .await?;
            print_json(&report);

            match report.summary {
                Some(ref summary) => match summary.health_outcome {
                    HealthOutcome::Healthy => Ok(true),
                    HealthOutcome::Unhealthy { ref detail } => {
                        eprintln!("error[verification_timeout]: {}", detail);
                        Ok(false)
                    }
                },
                None => Ok(false),
            }
        }

        Command::Verify { target } => {
            let target = target.target(&state.config);
            let result = state
                .controller
                .verify(&target, &state.config.verify_options(), cancel)
                .await?;
            print_json(&result);
            Ok(true)
        }

        Command::Backup { store, name } => {
            let target = store.target.target(&state.config);
            let record = state.backups.backup(&target, name.as_deref(), cancel).await?;
            print_json(&record);
            Ok(true)
        }

        Command::Restore {
            store,
            name,
            confirm,
        } => {
            let target = store.target.target(&state.config);
            let report = state
                .backups
                .restore(&target, &name, confirm.as_deref(), cancel)
                .await?;
            print_json(&report);
            Ok(true)
        }

        Command::List { store } => {
            let target = store.target.target(&state.config);
            let mut records = state.backups.list(&target, cancel).await?;
            let mut count = 0usize;
            while let Some(record) = records.next().await {
                println!(
                    "{}\t{}\t{}\t{:?}",
                    record.name,
                    record.created_at.to_rfc3339(),
                    record.size_bytes,
                    record.retention_class
                );
                count += 1;
            }
            info!(target = %target, count, "Listed backups");
            Ok(true)
        }

        Command::Cleanup {
            store,
            retention,
            yes,
        } => {
            let target = store.target.target(&state.config);
            let days = retention.unwrap_or(state.config.backup.retention_days);
            let expired = state.backups.cleanup_candidates(&target, days, cancel).await?;
            for record in &expired {
                println!("{}\t{}", record.name, record.created_at.to_rfc3339());
            }
            let approved = yes
                || expired.is_empty()
                || prompt_yes_no(&format!("Delete {} backup(s)?", expired.len())).await;
            let deleted = state.backups.cleanup(&target, days, approved, cancel).await?;
            println!("deleted {} backup(s)", deleted);
            Ok(true)
        }

        Command::Schedule { store, cron } => {
            let target = store.target.target(&state.config);
            let entry = state.backups.schedule(&target, &cron)?;
            println!("{}", entry.crontab_line());
            Ok(true)
        }

        Command::Serve { .. } => {
            serve(state, cancel.clone()).await?;
            Ok(true)
        }
    }
}

/// 启动 HTTP 控制 API，`shutdown` 取消后优雅退出
pub async fn serve(state: Arc<AppState>, shutdown: CancellationToken) -> DeployResult<()> {
    let addr = format!("0.0.0.0:{}", state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| DeployError::Config(format!("failed to bind {}: {}", addr, e)))?;
    info!(addr = %addr, "Control API listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| DeployError::Config(format!("server error: {}", e)))?;

    info!("Control API stopped");
    Ok(())
}

/// 交互确认，非 y/yes 或读取失败都视为拒绝
async fn prompt_yes_no(question: &str) -> bool {
    let mut stderr = tokio::io::stderr();
    if stderr
        .write_all(format!("{} [y/N] ", question).as_bytes())
        .await
        .is_err()
    {
        return false;
    }
    let _ = stderr.flush().await;

    let mut line = String::new();
    match BufReader::new(tokio::io::stdin()).read_line(&mut line).await {
        Ok(_) => is_yes(&line),
        Err(e) => {
            warn!(error = %e, "Failed to read confirmation");
            false
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => warn!(error = %e, "Failed to render output"),
    }
}
