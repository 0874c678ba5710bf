//! One-shot preparation before the engine server launches: toolchain install,
//! environment instantiation, and best-effort credential discovery.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::config::{HostConfig, ToolchainFailurePolicy};
use crate::error::{HostError, HostResult};
use crate::jobs::{JobHost, JobSpec};
use crate::launch;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapOutcome {
    /// False when the toolchain step failed and the policy said to continue.
    pub toolchain_ready: bool,
    /// Variables harvested by credential discovery, forwarded to the server.
    pub credentials: BTreeMap<String, String>,
}

pub struct BootstrapRunner<'a> {
    config: &'a HostConfig,
    host: &'a dyn JobHost,
}

impl<'a> BootstrapRunner<'a> {
    pub fn new(config: &'a HostConfig, host: &'a dyn JobHost) -> Self {
        Self { config, host }
    }

    pub async fn run(&self) -> HostResult<BootstrapOutcome> {
        let toolchain_ready = self.ensure_toolchain().await?;
        self.instantiate_environment().await?;
        let credentials = self.discover_credentials().await;
        Ok(BootstrapOutcome {
            toolchain_ready,
            credentials,
        })
    }

    async fn ensure_toolchain(&self) -> HostResult<bool> {
        if !self.config.toolchain.enabled {
            return Ok(true);
        }
        match run_one_shot(self.host, launch::toolchain_spec(self.config)).await {
            Ok(()) => {
                info!(channel = %self.config.toolchain.channel, "toolchain installed/verified");
                Ok(true)
            }
            Err(message) => match self.config.toolchain.on_failure {
                ToolchainFailurePolicy::Continue => {
                    warn!("toolchain install failed, continuing anyway: {message}");
                    Ok(false)
                }
                ToolchainFailurePolicy::Abort => Err(HostError::ToolchainInstallFailed(message)),
            },
        }
    }

    async fn instantiate_environment(&self) -> HostResult<()> {
        let env_dir = self.config.environment_dir();
        if !env_dir.exists() {
            info!(dir = %env_dir.display(), "creating environment directory");
            tokio::fs::create_dir_all(&env_dir).await.map_err(|err| {
                HostError::BootstrapFailed(format!("create {}: {err}", env_dir.display()))
            })?;
        }
        run_one_shot(self.host, launch::setup_spec(self.config))
            .await
            .map_err(HostError::BootstrapFailed)?;
        info!("environment instantiated");
        Ok(())
    }

    /// Never fails: a missing binary, non-zero exit, or timeout yields no
    /// credentials.
    async fn discover_credentials(&self) -> BTreeMap<String, String> {
        let Some(spec) = launch::credential_spec(self.config) else {
            return BTreeMap::new();
        };
        let command = spec.command.clone();
        let mut handle = match self.host.submit(spec) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(command = %command, "credential discovery unavailable: {err}");
                return BTreeMap::new();
            }
        };

        let timeout = self.config.credentials.timeout();
        let exit = match tokio::time::timeout(timeout, handle.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!(command = %command, ?timeout, "credential discovery timed out");
                self.host.terminate(handle.id());
                return BTreeMap::new();
            }
        };
        if !exit.success() {
            warn!(command = %command, "credential discovery failed with {}", exit.describe());
            return BTreeMap::new();
        }

        let credentials = parse_env_lines(exit.stdout.as_deref().unwrap_or_default());
        info!(count = credentials.len(), "credentials discovered");
        credentials
    }
}

async fn run_one_shot(host: &dyn JobHost, spec: JobSpec) -> Result<(), String> {
    let name = spec.name.clone();
    let mut handle = host.submit(spec).map_err(|err| err.to_string())?;
    let exit = handle.wait().await;
    if exit.success() {
        Ok(())
    } else {
        Err(format!("{name} failed with {}", exit.describe()))
    }
}

/// Harvest `KEY=VALUE` lines. Accepts an `export ` prefix and surrounding
/// quotes; anything that does not look like an assignment is skipped.
pub fn parse_env_lines(output: &str) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if !is_env_key(key) {
            continue;
        }
        vars.insert(key.to_string(), unquote(value.trim()).to_string());
    }
    vars
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
