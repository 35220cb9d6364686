//! 远程执行适配器
//!
//! 编排逻辑只依赖 `RemoteExecutor` trait：`run(target, command) -> (stdout, exit code)`。
//! 生产实现 `SshExecutor` 通过本机 `ssh` 客户端执行，测试使用内存中的假主机。

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::target::DeploymentTarget;
use crate::error::{DeployError, DeployResult};
use crate::infra::command::{CommandError, CommandOutput, CommandRunner};

/// ssh 客户端自身出错（连接失败、认证失败）时的退出码
const SSH_CONNECTION_FAILURE: i32 = 255;

/// 远程命令
///
/// `stage` 是稳定的操作名，用于日志和错误上下文；`script` 是在远程 shell 中执行的内容
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteCommand {
    pub stage: &'static str,
    /// 操作对象（镜像 tag、备份名等）
    pub subject: Option<String>,
    pub script: String,
}

impl RemoteCommand {
    pub fn new(stage: &'static str, script: impl Into<String>) -> Self {
        Self {
            stage,
            subject: None,
            script: script.into(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

/// 单引号包裹，用于拼接远程 shell 脚本
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// 远程执行接口
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// 执行命令，返回输出和退出码
    ///
    /// 只有无法到达目标或被取消时返回错误，非零退出码由调用方判断
    async fn run(
        &self,
        target: &DeploymentTarget,
        command: &RemoteCommand,
        cancel: &CancellationToken,
    ) -> DeployResult<CommandOutput>;

    /// 执行命令，非零退出码视为 `ExternalTool` 错误
    async fn run_checked(
        &self,
        target: &DeploymentTarget,
        command: &RemoteCommand,
        cancel: &CancellationToken,
    ) -> DeployResult<CommandOutput> {
        let output = self.run(target, command, cancel).await?;
        if output.success() {
            Ok(output)
        } else {
            let detail = if output.stderr.trim().is_empty() {
                output.stdout.trim().to_string()
            } else {
                output.stderr.trim().to_string()
            };
            Err(DeployError::ExternalTool {
                stage: command.stage.to_string(),
                exit_code: output.exit_code,
                stderr: detail,
            })
        }
    }
}

/// 基于 ssh 客户端的执行器
#[derive(Clone, Debug)]
pub struct SshExecutor {
    /// 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 单条命令超时
    pub command_timeout: Duration,
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            command_timeout: Duration::from_secs(600),
        }
    }
}

impl SshExecutor {
    /// 构造 ssh 参数
    pub fn build_args(&self, target: &DeploymentTarget, script: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-p".to_string(),
            target.port.to_string(),
        ];
        if let Some(ref key) = target.identity_file {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        args.push(format!("{}@{}", target.user, target.host));
        args.push("--".to_string());
        args.push(script.to_string());
        args
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(
        &self,
        target: &DeploymentTarget,
        command: &RemoteCommand,
        cancel: &CancellationToken,
    ) -> DeployResult<CommandOutput> {
        debug!(target = %target, stage = command.stage, subject = ?command.subject, "Running remote command");

        let args = self.build_args(target, &command.script);
        let output = CommandRunner::run("ssh", &args, cancel, self.command_timeout)
            .await
            .map_err(|e| match e {
                CommandError::Cancelled => DeployError::Cancelled,
                CommandError::Timeout => DeployError::ExternalTool {
                    stage: command.stage.to_string(),
                    exit_code: -1,
                    stderr: format!("timed out after {:?}", self.command_timeout),
                },
                CommandError::SpawnFailed(e) => {
                    DeployError::connectivity(target.key(), format!("failed to start ssh: {}", e))
                }
            })?;

        if output.exit_code == SSH_CONNECTION_FAILURE {
            return Err(DeployError::connectivity(target.key(), output.stderr.trim()));
        }
        Ok(output)
    }
}
