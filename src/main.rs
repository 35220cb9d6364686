//! XJP Rollout - 单主机部署、回滚与备份编排
//!
//! Usage:
//! - Deploy: `xjp-rollout deploy --host 10.0.0.5 --tag v1.2.0 --auto-rollback`
//! - Roll back: `xjp-rollout rollback --host 10.0.0.5 --list-tags`
//! - Back up: `xjp-rollout backup --host 10.0.0.5`
//! - Control API: `xjp-rollout serve --port 9876`

use clap::Parser;
use tracing::info;

use xjp_rollout::cli::{self, Cli};
use xjp_rollout::state::app_state::{get_shutdown_token, trigger_shutdown};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let shutdown = get_shutdown_token();

    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, cancelling");
            trigger_shutdown();
        }
    });

    match cli::run(cli, shutdown).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("error[{}]: {}", e.kind(), e);
            std::process::exit(1);
        }
    }
}
