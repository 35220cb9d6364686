//! 命令执行器
//!
//! 提供统一的本地命令执行接口，支持：
//! - 超时控制
//! - 取消支持（取消时杀死子进程）
//! - stdout/stderr 分离

use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// 命令执行器
pub struct CommandRunner;

/// 命令执行错误
#[derive(Debug, Error)]
pub enum CommandError {
    /// 命令启动失败
    #[error("Failed to spawn command: {0}")]
    SpawnFailed(#[source] std::io::Error),
    #[error("Command timed out")]
    Timeout,
    #[error("Command was cancelled")]
    Cancelled,
}

/// 命令输出
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// 退出码（被信号终止时为 -1）
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl CommandRunner {
    /// 执行命令并收集输出
    ///
    /// # Arguments
    /// * `program` - 要执行的程序
    /// * `args` - 命令行参数
    /// * `cancel` - 取消令牌
    /// * `timeout` - 超时时间
    ///
    /// 超时或取消时子进程随 future 一起被 drop 并杀死
    pub async fn run(
        program: &str,
        args: &[String],
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        tokio::select! {
            _ = cancel.cancelled() => {
                warn!(program, "Command cancelled, killing process");
                Err(CommandError::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                error!(program, "Command timed out after {:?}", timeout);
                Err(CommandError::Timeout)
            }
            result = child => {
                let output = result.map_err(CommandError::SpawnFailed)?;
                Ok(CommandOutput {
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    exit_code: output.status.code().unwrap_or(-1),
                })
            }
        }
    }
}
