use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{HostError, HostResult};

pub const DEFAULT_PORT: u16 = 1234;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct HostConfig {
    pub port: u16,
    pub port_search_window: u16,
    /// Workspace root handed to the engine; defaults to the current directory.
    pub workspace: Option<PathBuf>,
    pub server: ServerSection,
    pub toolchain: ToolchainSection,
    pub environment: EnvironmentSection,
    pub credentials: CredentialsSection,
    pub readiness: ReadinessSection,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerSection {
    /// Engine executable, optionally followed by arguments.
    pub executable: String,
    pub environment_path: Option<String>,
    pub startup_grace_ms: u64,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolchainFailurePolicy {
    Continue,
    Abort,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ToolchainSection {
    pub enabled: bool,
    pub installer: String,
    pub channel: String,
    pub on_failure: ToolchainFailurePolicy,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EnvironmentSection {
    /// Project environment directory, relative to the workspace unless absolute.
    pub dir: PathBuf,
    pub setup_code: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CredentialsSection {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub timeout_ms: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ReadinessSection {
    pub max_attempts: u32,
    pub interval_ms: u64,
    pub request_timeout_ms: u64,
}

impl HostConfig {
    /// Load the config file if present, then apply environment overrides.
    pub fn load() -> HostResult<Self> {
        let mut config = Self::load_from(&nbhost_protocol::paths::config_path())?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> HostResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> HostResult<Self> {
        toml::from_str(contents).map_err(|err| HostError::Config(err.to_string()))
    }

    fn apply_env_overrides(&mut self) -> HostResult<()> {
        if let Ok(port) = std::env::var("NBHOST_PORT") {
            self.port = port
                .parse()
                .map_err(|_| HostError::Config(format!("NBHOST_PORT is not a port: {port}")))?;
        }
        if let Ok(workspace) = std::env::var("NBHOST_WORKSPACE") {
            self.workspace = Some(PathBuf::from(workspace));
        }
        if let Ok(executable) = std::env::var("NBHOST_EXECUTABLE") {
            self.server.executable = executable;
        }
        Ok(())
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.workspace
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    pub fn environment_dir(&self) -> PathBuf {
        if self.environment.dir.is_absolute() {
            self.environment.dir.clone()
        } else {
            self.workspace_root().join(&self.environment.dir)
        }
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.server.startup_grace_ms)
    }
}

impl ReadinessSection {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl CredentialsSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            port_search_window: crate::port::DEFAULT_SEARCH_WINDOW,
            workspace: None,
            server: ServerSection::default(),
            toolchain: ToolchainSection::default(),
            environment: EnvironmentSection::default(),
            credentials: CredentialsSection::default(),
            readiness: ReadinessSection::default(),
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            executable: "julia".to_string(),
            environment_path: None,
            startup_grace_ms: 15_000,
        }
    }
}

impl Default for ToolchainSection {
    fn default() -> Self {
        Self {
            enabled: true,
            installer: crate::launch::executable_name("juliaup"),
            channel: "1.11.7".to_string(),
            on_failure: ToolchainFailurePolicy::Continue,
        }
    }
}

impl Default for EnvironmentSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".env"),
            setup_code: r#"import Pkg; Pkg.add("Pluto"); Pkg.instantiate(); Pkg.precompile();"#
                .to_string(),
        }
    }
}

impl Default for CredentialsSection {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_ms: 10_000,
        }
    }
}

impl Default for ReadinessSection {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            interval_ms: 1_000,
            request_timeout_ms: 2_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = HostConfig::parse("").expect("parse");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.readiness.max_attempts, 60);
        assert_eq!(config.readiness.interval(), Duration::from_secs(1));
        assert_eq!(config.readiness.request_timeout(), Duration::from_secs(2));
        assert_eq!(config.toolchain.on_failure, ToolchainFailurePolicy::Continue);
        assert!(config.credentials.command.is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = HostConfig::parse(
            r#"
            port = 4321

            [toolchain]
            on_failure = "abort"

            [credentials]
            command = "pkg-auth"
            args = ["env"]
            "#,
        )
        .expect("parse");
        assert_eq!(config.port, 4321);
        assert_eq!(config.toolchain.on_failure, ToolchainFailurePolicy::Abort);
        assert_eq!(config.toolchain.channel, "1.11.7");
        assert_eq!(config.credentials.command.as_deref(), Some("pkg-auth"));
        assert_eq!(config.credentials.timeout(), Duration::from_secs(10));
        assert_eq!(config.server.executable, "julia");
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let err = HostConfig::parse("port = \"many\"").expect_err("bad type");
        assert!(matches!(err, HostError::Config(_)));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = HostConfig::load_from(&dir.path().join("nope.toml")).expect("load");
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn environment_dir_is_relative_to_workspace() {
        let config = HostConfig {
            workspace: Some(PathBuf::from("/work")),
            ..HostConfig::default()
        };
        assert_eq!(config.environment_dir(), PathBuf::from("/work/.env"));

        let absolute = HostConfig {
            environment: EnvironmentSection {
                dir: PathBuf::from("/opt/env"),
                ..EnvironmentSection::default()
            },
            ..config
        };
        assert_eq!(absolute.environment_dir(), PathBuf::from("/opt/env"));
    }
}
