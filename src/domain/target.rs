//! 部署目标主机

use serde::{Deserialize, Serialize};

/// 目标可达性
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    #[default]
    Unknown,
    Reachable,
    Unreachable,
}

/// 部署目标
///
/// 只有可达性探测会修改 `reachability`，其余字段创建后不变
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentTarget {
    /// 主机名或 IP
    pub host: String,
    /// SSH 用户
    pub user: String,
    /// SSH 端口
    pub port: u16,
    /// 私钥路径（凭据引用，不保存私钥内容）
    pub identity_file: Option<String>,
    #[serde(default)]
    pub reachability: Reachability,
}

impl DeploymentTarget {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            port: 22,
            identity_file: None,
            reachability: Reachability::Unknown,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_identity_file(mut self, path: Option<String>) -> Self {
        self.identity_file = path;
        self
    }

    /// 连接标识 `user@host:port`，用于尝试记录和错误信息
    pub fn key(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    /// 主机标识，用作租约和当前制品的 key
    ///
    /// 不含用户和端口：换一个 ssh 用户连接的仍是同一台主机
    pub fn host_key(&self) -> String {
        self.host.trim().to_ascii_lowercase()
    }

    pub fn mark_reachable(&mut self) {
        self.reachability = Reachability::Reachable;
    }

    pub fn mark_unreachable(&mut self) {
        self.reachability = Reachability::Unreachable;
    }
}

impl std::fmt::Display for DeploymentTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}
