//! 环境变量配置加载

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::domain::artifact::{TagPolicy, DEFAULT_MUTABLE_TAGS};
use crate::domain::target::DeploymentTarget;
use crate::error::{DeployError, DeployResult};
use crate::services::backup::StoreLayout;
use crate::services::deploy::compose::ComposeLayout;
use crate::services::health::VerifyOptions;
use crate::services::retry::RetryPolicy;

use self::constants::*;

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// API 密钥
    pub api_key: String,
    /// 控制 API 监听端口
    pub port: u16,
    /// SSH 连接配置
    pub ssh: SshSettings,
    /// 镜像仓库配置
    pub registry: RegistrySettings,
    /// 应用配置
    pub app: AppSettings,
    /// 备份配置
    pub backup: BackupSettings,
    /// 健康检查参数
    pub health_interval_secs: u64,
    pub health_max_attempts: u32,
    /// 可达性探测次数
    pub reachability_attempts: u32,
}

/// SSH 连接配置
#[derive(Clone, Debug)]
pub struct SshSettings {
    pub user: String,
    pub identity_file: Option<String>,
    pub port: u16,
}

/// 镜像仓库配置
#[derive(Clone, Debug)]
pub struct RegistrySettings {
    /// API 地址（Docker Hub v2 兼容）
    pub url: String,
    /// 命名空间（Docker Hub 用户名）
    pub docker_user: Option<String>,
    /// 仓库名
    pub repo: String,
    /// 回滚时查询的 tag 数量
    pub tag_window: usize,
    /// 可变别名
    pub mutable_tags: Vec<String>,
}

/// 应用配置
#[derive(Clone, Debug)]
pub struct AppSettings {
    pub dir: String,
    pub compose_file: String,
    pub service: Option<String>,
    /// 健康端点模板，`{host}` 替换为目标主机
    pub health_url: String,
    /// 运行时变量文件（本地，KEY=VALUE）
    pub env_file: Option<String>,
}

/// 备份配置
#[derive(Clone, Debug)]
pub struct BackupSettings {
    pub dir: String,
    pub db_container: String,
    pub retention_days: u32,
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        // API Key - 支持旧名称兼容
        let api_key = load_with_fallback("DEPLOY_AGENT_API_KEY", "API_KEY")
            .unwrap_or_else(|| "change-me-in-production".to_string());
        if env::var("API_KEY").is_ok() {
            warn!("Deprecated environment variable API_KEY detected. Please use DEPLOY_AGENT_API_KEY");
        }

        let port = parse_or("PORT", DEFAULT_PORT);

        let ssh = SshSettings {
            user: env::var("DEPLOY_SSH_USER").unwrap_or_else(|_| "root".to_string()),
            identity_file: non_empty("DEPLOY_SSH_KEY"),
            port: parse_or("DEPLOY_SSH_PORT", 22),
        };

        let registry = RegistrySettings {
            url: env::var("REGISTRY_URL").unwrap_or_else(|_| DEFAULT_REGISTRY_URL.to_string()),
            docker_user: non_empty("DOCKER_USER"),
            repo: env::var("APP_REPO").unwrap_or_else(|_| "todo-app".to_string()),
            tag_window: parse_or("ROLLBACK_TAG_WINDOW", ROLLBACK_TAG_WINDOW),
            mutable_tags: env::var("MUTABLE_TAGS")
                .map(|v| parse_list(&v))
                .unwrap_or_else(|_| DEFAULT_MUTABLE_TAGS.iter().map(|t| t.to_string()).collect()),
        };

        let app = AppSettings {
            dir: env::var("APP_DIR").unwrap_or_else(|_| "/opt/todo-app".to_string()),
            compose_file: env::var("COMPOSE_FILE").unwrap_or_else(|_| "docker-compose.yml".to_string()),
            service: non_empty("APP_SERVICE"),
            health_url: env::var("HEALTH_URL").unwrap_or_else(|_| DEFAULT_HEALTH_URL.to_string()),
            env_file: non_empty("APP_ENV_FILE"),
        };

        let backup = BackupSettings {
            dir: env::var("BACKUP_DIR").unwrap_or_else(|_| "/var/backups/todo-app".to_string()),
            db_container: env::var("DB_CONTAINER").unwrap_or_else(|_| "mongo".to_string()),
            retention_days: parse_or("RETENTION_DAYS", RETENTION_DAYS),
        };

        Self {
            api_key,
            port,
            ssh,
            registry,
            app,
            backup,
            health_interval_secs: parse_or("HEALTH_INTERVAL_SECS", HEALTH_INTERVAL_SECS),
            health_max_attempts: parse_or("HEALTH_MAX_ATTEMPTS", HEALTH_MAX_ATTEMPTS),
            reachability_attempts: parse_or("REACHABILITY_ATTEMPTS", REACHABILITY_ATTEMPTS),
        }
    }

    /// 构造部署目标
    pub fn target(&self, host: &str) -> DeploymentTarget {
        DeploymentTarget::new(host, self.ssh.user.clone())
            .with_port(self.ssh.port)
            .with_identity_file(self.ssh.identity_file.clone())
    }

    pub fn verify_options(&self) -> VerifyOptions {
        VerifyOptions {
            interval: Duration::from_secs(self.health_interval_secs),
            max_attempts: self.health_max_attempts.max(1),
        }
    }

    /// 可达性探测策略（指数退避）
    pub fn reachability_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.reachability_attempts,
            Duration::from_secs(REACHABILITY_INITIAL_DELAY_SECS),
            Duration::from_secs(REACHABILITY_MAX_DELAY_SECS),
        )
    }

    pub fn tag_policy(&self) -> TagPolicy {
        TagPolicy::new(self.registry.mutable_tags.iter())
    }

    pub fn store_layout(&self) -> StoreLayout {
        StoreLayout {
            backup_dir: self.backup.dir.clone(),
            container: self.backup.db_container.clone(),
            cli_path: env::current_exe()
                .ok()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string()),
        }
    }

    /// 读取运行时变量文件并构造应用布局
    pub fn compose_layout(&self) -> DeployResult<ComposeLayout> {
        let env = match self.app.env_file {
            Some(ref path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    DeployError::Config(format!("failed to read env file {}: {}", path, e))
                })?;
                parse_env_file(&content)
            }
            None => BTreeMap::new(),
        };
        Ok(ComposeLayout {
            app_dir: self.app.dir.clone(),
            compose_file: self.app.compose_file.clone(),
            service: self.app.service.clone(),
            env,
        })
    }
}

impl RegistrySettings {
    /// 完整仓库名 `<namespace>/<repo>`
    pub fn repository(&self) -> String {
        match self.docker_user {
            Some(ref user) if !self.repo.contains('/') => format!("{}/{}", user, self.repo),
            _ => self.repo.clone(),
        }
    }
}

/// 解析 KEY=VALUE 文件，忽略空行和 `#` 注释
pub fn parse_env_file(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| {
            let l = l.strip_prefix("export ").unwrap_or(l);
            let (key, value) = l.split_once('=')?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            Some((key.trim().to_string(), value.to_string()))
        })
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

/// 逗号分隔列表
fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(v) => v.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %v, "Invalid value, using default");
            default
        }),
        Err(_) => default,
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

/// 加载环境变量，支持 fallback
fn load_with_fallback(primary: &str, fallback: &str) -> Option<String> {
    env::var(primary).ok().or_else(|| env::var(fallback).ok())
}

/// 常量
pub mod constants {
    /// 控制 API 默认端口
    pub const DEFAULT_PORT: u16 = 9876;

    pub const DEFAULT_REGISTRY_URL: &str = "https://hub.docker.com/v2";

    pub const DEFAULT_HEALTH_URL: &str = "http://{host}:3000/health";

    /// 健康检查间隔（秒）
    pub const HEALTH_INTERVAL_SECS: u64 = 15;

    /// 健康检查最大次数
    pub const HEALTH_MAX_ATTEMPTS: u32 = 20;

    /// 单次健康请求超时（秒）
    pub const HEALTH_REQUEST_TIMEOUT_SECS: u64 = 10;

    /// 可达性探测次数
    pub const REACHABILITY_ATTEMPTS: u32 = 5;

    /// 可达性探测初始 / 最大间隔（秒）
    pub const REACHABILITY_INITIAL_DELAY_SECS: u64 = 2;
    pub const REACHABILITY_MAX_DELAY_SECS: u64 = 30;

    /// 回滚候选查询的 tag 数量
    pub const ROLLBACK_TAG_WINDOW: usize = 10;

    /// 备份保留天数
    pub const RETENTION_DAYS: u32 = 7;

    /// 部署历史最大保存数量
    pub const MAX_ATTEMPT_HISTORY: usize = 100;

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::testing::test_env_config as config;

    #[test]
    fn test_load_with_fallback() {
        env::set_var("TEST_PRIMARY", "primary_value");
        env::set_var("TEST_FALLBACK", "fallback_value");

        assert_eq!(
            load_with_fallback("TEST_PRIMARY", "TEST_FALLBACK"),
            Some("primary_value".to_string())
        );

        env::remove_var("TEST_PRIMARY");
        assert_eq!(
            load_with_fallback("TEST_PRIMARY", "TEST_FALLBACK"),
            Some("fallback_value".to_string())
        );

        env::remove_var("TEST_FALLBACK");
        assert_eq!(load_with_fallback("TEST_PRIMARY", "TEST_FALLBACK"), None);
    }

    #[test]
    fn test_repository_name() {
        let mut c = config();
        assert_eq!(c.registry.repository(), "rickyjim/todo-app");

        c.registry.repo = "org/other".to_string();
        assert_eq!(c.registry.repository(), "org/other");

        c.registry.repo = "todo-app".to_string();
        c.registry.docker_user = None;
        assert_eq!(c.registry.repository(), "todo-app");
    }

    #[test]
    fn test_target_from_config() {
        let c = config();
        let target = c.target("10.0.0.5");
        assert_eq!(target.key(), "deploy@10.0.0.5:2222");
        assert_eq!(target.identity_file.as_deref(), Some("/keys/id"));
    }

    #[test]
    fn test_reachability_policy() {
        let mut c = config();
        c.reachability_attempts = REACHABILITY_ATTEMPTS;
        let policy = c.reachability_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.total_delay(), Duration::from_secs(2 + 4 + 8 + 16));
    }

    #[test]
    fn test_tag_policy_from_config() {
        let policy = config().tag_policy();
        assert!(policy.is_mutable("canary"));
        assert!(!policy.is_mutable("v1.0.0"));
    }

    #[test]
    fn test_parse_env_file() {
        let vars = parse_env_file(
            "# app\nMONGO_URL=mongodb://mongo:27017/todos\n\nexport PORT=3000\nNAME=\"todo app\"\nbroken\n",
        );
        assert_eq!(vars.get("MONGO_URL").unwrap(), "mongodb://mongo:27017/todos");
        assert_eq!(vars.get("PORT").unwrap(), "3000");
        assert_eq!(vars.get("NAME").unwrap(), "todo app");
        assert_eq!(vars.len(), 3);
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list("latest, stable,,edge "), vec!["latest", "stable", "edge"]);
    }
}
