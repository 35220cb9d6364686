//! 基础设施模块
//!
//! 封装外部依赖（ssh、镜像仓库、HTTP 健康端点、命令执行）

pub mod command;
pub mod executor;
pub mod probe;
pub mod registry;

#[cfg(test)]
pub mod testing;

pub use command::CommandRunner;
pub use executor::{RemoteCommand, RemoteExecutor, SshExecutor};
pub use probe::{HealthProbe, HttpHealthProbe};
pub use registry::{RegistryClient, TagInfo, TagRegistry};
