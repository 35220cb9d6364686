//! XJP Rollout - 单主机部署、回滚与备份编排
//!
//! 通过 ssh 在目标主机上部署容器化应用、做健康验证，
//! 验证失败时回滚到上一个可用版本；同时管理应用数据库的备份与恢复。
//! 同一套组件既可以从命令行使用，也可以作为 HTTP 控制 API 运行

pub mod api;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod middleware;
pub mod services;
pub mod state;
