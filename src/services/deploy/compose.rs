//! Docker Compose remote commands
//!
//! Builds the remote scripts the controller runs on the target: prerequisite
//! checks, runtime configuration, image pull, service recreation and the
//! deployed-tag marker.

use std::collections::BTreeMap;

use crate::domain::artifact::ArtifactReference;
use crate::infra::executor::{shell_quote, RemoteCommand};

/// Stage names shared by the controller and its test doubles
pub mod stage {
    pub const PROBE: &str = "probe";
    pub const PREREQUISITES: &str = "prerequisites";
    pub const CONFIGURE: &str = "configure";
    pub const PULL_IMAGE: &str = "pull_image";
    pub const COMPOSE_UP: &str = "compose_up";
    pub const READ_MARKER: &str = "read_marker";
    pub const WRITE_MARKER: &str = "write_marker";
    pub const CLEAR_MARKER: &str = "clear_marker";
    pub const READ_INSTALLED: &str = "read_installed";
}

/// Delimiter of the heredoc used to write the env file
const ENV_HEREDOC: &str = "XJP_ROLLOUT_ENV";

/// File recording the tag that last passed verification
const MARKER_FILE: &str = ".deployed-tag";

/// Layout of the application on the target host
#[derive(Clone, Debug)]
pub struct ComposeLayout {
    /// Application directory (holds the compose file and `.env`)
    pub app_dir: String,
    /// Compose file, relative to `app_dir` or absolute
    pub compose_file: String,
    /// Service to recreate (all services when `None`)
    pub service: Option<String>,
    /// Extra runtime variables written to `.env`
    pub env: BTreeMap<String, String>,
}

impl ComposeLayout {
    fn compose_path(&self) -> String {
        if self.compose_file.starts_with('/') {
            self.compose_file.clone()
        } else {
            format!("{}/{}", self.app_dir.trim_end_matches('/'), self.compose_file)
        }
    }

    fn marker_path(&self) -> String {
        format!("{}/{}", self.app_dir.trim_end_matches('/'), MARKER_FILE)
    }

    /// Cheap command used as the reachability probe
    pub fn probe(&self) -> RemoteCommand {
        RemoteCommand::new(stage::PROBE, "true")
    }

    /// docker, the compose plugin and the app directory must be present
    pub fn prerequisites(&self) -> RemoteCommand {
        RemoteCommand::new(
            stage::PREREQUISITES,
            format!(
                "command -v docker >/dev/null && docker compose version >/dev/null && mkdir -p {}",
                shell_quote(&self.app_dir)
            ),
        )
    }

    /// Render `.env` content: configured variables plus the image to run
    pub fn render_env(&self, artifact: &ArtifactReference) -> String {
        let mut vars = self.env.clone();
        vars.insert("IMAGE".to_string(), artifact.image());
        vars.insert("IMAGE_TAG".to_string(), artifact.tag.clone());

        vars.iter()
            .filter(|(k, _)| !k.is_empty() && !k.contains('='))
            .map(|(k, v)| format!("{}={}", k, v.replace('\n', " ")))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn env_path(&self) -> String {
        format!("{}/.env", self.app_dir.trim_end_matches('/'))
    }

    /// Install the runtime configuration
    pub fn configure(&self, artifact: &ArtifactReference) -> RemoteCommand {
        RemoteCommand::new(
            stage::CONFIGURE,
            format!(
                "cat > {} <<'{delim}'\n{}\n{delim}",
                shell_quote(&self.env_path()),
                self.render_env(artifact),
                delim = ENV_HEREDOC
            ),
        )
        .with_subject(artifact.tag.clone())
    }

    pub fn pull_image(&self, artifact: &ArtifactReference) -> RemoteCommand {
        RemoteCommand::new(
            stage::PULL_IMAGE,
            format!("docker pull {}", shell_quote(&artifact.image())),
        )
        .with_subject(artifact.tag.clone())
    }

    /// `docker compose up -d --force-recreate [service]`
    pub fn compose_up(&self, artifact: &ArtifactReference) -> RemoteCommand {
        let mut script = format!(
            "cd {} && docker compose -f {} up -d --force-recreate",
            shell_quote(&self.app_dir),
            shell_quote(&self.compose_path())
        );
        if let Some(ref svc) = self.service {
            script.push(' ');
            script.push_str(&shell_quote(svc));
        }
        RemoteCommand::new(stage::COMPOSE_UP, script).with_subject(artifact.tag.clone())
    }

    /// Prints the recorded tag, or nothing when there is none
    pub fn read_marker(&self) -> RemoteCommand {
        RemoteCommand::new(
            stage::READ_MARKER,
            format!("cat {} 2>/dev/null || true", shell_quote(&self.marker_path())),
        )
    }

    /// Prints the tag the installed `.env` points at, or nothing
    ///
    /// Unlike the marker this is set before verification, so it names what
    /// the target runs even after a failed attempt
    pub fn read_installed(&self) -> RemoteCommand {
        RemoteCommand::new(
            stage::READ_INSTALLED,
            format!(
                "sed -n 's/^IMAGE_TAG=//p' {} 2>/dev/null || true",
                shell_quote(&self.env_path())
            ),
        )
    }

    /// Drops the marker once the target is being changed
    pub fn clear_marker(&self) -> RemoteCommand {
        RemoteCommand::new(
            stage::CLEAR_MARKER,
            format!("rm -f {}", shell_quote(&self.marker_path())),
        )
    }

    pub fn write_marker(&self, artifact: &ArtifactReference) -> RemoteCommand {
        RemoteCommand::new(
            stage::WRITE_MARKER,
            format!(
                "printf '%s\\n' {} > {}",
                shell_quote(&artifact.tag),
                shell_quote(&self.marker_path())
            ),
        )
        .with_subject(artifact.tag.clone())
    }
}
