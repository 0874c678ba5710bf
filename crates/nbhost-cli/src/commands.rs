use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use libnbhost::readiness::ReadinessPoller;
use libnbhost::{HostConfig, HostError, ServerEvent, ServerOrchestrator, SessionManager, Worker};
use nbhost_protocol::paths::{config_path, local_server_url};
use nbhost_protocol::{CellResult, OpenNotebook};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Config file plus environment, with command-line flags on top.
pub fn load_config(
    port: Option<u16>,
    workspace: Option<PathBuf>,
    executable: Option<String>,
) -> anyhow::Result<HostConfig> {
    let mut config = HostConfig::load()
        .map_err(describe)
        .with_context(|| format!("failed to load {}", config_path().display()))?;
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(workspace) = workspace {
        config.workspace = Some(workspace);
    }
    if let Some(executable) = executable {
        config.server.executable = executable;
    }
    Ok(config)
}

/// Where session commands send their requests.
pub struct Target {
    config: HostConfig,
    server: Option<String>,
}

impl Target {
    pub fn new(config: HostConfig, server: Option<String>) -> Self {
        Self { config, server }
    }

    pub fn url(&self) -> String {
        self.server
            .clone()
            .unwrap_or_else(|| local_server_url(self.config.port))
    }

    async fn sessions(&self) -> anyhow::Result<SessionManager> {
        let manager = SessionManager::with_server_url(self.url());
        manager
            .connect()
            .await
            .map_err(describe)
            .with_context(|| format!("no engine at {}; start one with `nbhost serve`", self.url()))?;
        Ok(manager)
    }
}

/// Attach the protocol error code, and a hint when retrying could help.
fn describe(err: HostError) -> anyhow::Error {
    let retry = err.is_retryable();
    let (code, message) = err.to_error_code();
    if retry {
        anyhow!("{message} [{}] (retrying may succeed)", code.as_str())
    } else {
        anyhow!("{message} [{}]", code.as_str())
    }
}

pub async fn serve(target: Target) -> anyhow::Result<()> {
    let orchestrator = ServerOrchestrator::with_process_host(target.config);
    let mut events = orchestrator.subscribe();

    let port = tokio::select! {
        started = orchestrator.start() => started.map_err(describe)?,
        _ = tokio::signal::ctrl_c() => {
            // Dropping the start future terminates anything it launched.
            info!("interrupted during startup");
            return Ok(());
        }
    };
    println!("engine server ready at {}", local_server_url(port));

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ServerEvent::Stopped { exit_code }) => {
                    let code = exit_code.map_or_else(|| "none".to_string(), |c| c.to_string());
                    bail!("engine server exited (code {code})");
                }
                Ok(ServerEvent::PortChanged { preferred, actual }) => {
                    info!(preferred, actual, "engine port changed");
                }
                Ok(ServerEvent::Ready { .. }) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed server events"),
                Err(RecvError::Closed) => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("stopping engine server");
                orchestrator.stop();
                if tokio::time::timeout(SHUTDOWN_TIMEOUT, orchestrator.wait_until_stopped())
                    .await
                    .is_err()
                {
                    warn!(timeout = ?SHUTDOWN_TIMEOUT, "engine server did not stop in time");
                }
                return Ok(());
            }
        }
    }
}

pub async fn status(target: &Target) -> anyhow::Result<()> {
    let url = target.url();
    let poller = ReadinessPoller::from_config(&target.config.readiness).map_err(describe)?;
    if poller.probe(&url).await {
        println!("engine server is running at {url}");
    } else {
        println!("engine server is not running at {url}");
    }
    Ok(())
}

async fn worker(manager: &SessionManager, path: PathBuf) -> anyhow::Result<Arc<Worker>> {
    let display = path.display().to_string();
    manager
        .get_worker(path, None)
        .await
        .map_err(describe)
        .with_context(|| format!("failed to open {display}"))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_result(result: &CellResult) -> anyhow::Result<()> {
    print_json(result)?;
    if let Some(error) = &result.error {
        bail!("cell {} failed: {}", result.cell_id, error.message);
    }
    Ok(())
}

pub async fn open(target: &Target, path: PathBuf) -> anyhow::Result<()> {
    let manager = target.sessions().await?;
    let worker = worker(&manager, path).await?;
    print_json(&OpenNotebook {
        path: worker.path().to_path_buf(),
        session_id: worker.session_id().to_string(),
    })
}

pub async fn eval(target: &Target, path: PathBuf, code: String) -> anyhow::Result<()> {
    let manager = target.sessions().await?;
    let worker = worker(&manager, path).await?;
    let result = manager
        .execute_code_ephemeral(&worker, &code)
        .await
        .map_err(describe)?;
    print_result(&result)
}

pub async fn exec(target: &Target, path: PathBuf, cell: String, code: String) -> anyhow::Result<()> {
    let manager = target.sessions().await?;
    let worker = worker(&manager, path).await?;
    let result = manager
        .execute_cell(&worker, &cell, &code)
        .await
        .map_err(describe)?;
    print_result(&result)
}

pub async fn add(target: &Target, path: PathBuf, index: usize, code: String) -> anyhow::Result<()> {
    let manager = target.sessions().await?;
    let worker = worker(&manager, path).await?;
    let cell = manager
        .add_cell(&worker, index, &code)
        .await
        .map_err(describe)?;
    println!("{cell}");
    Ok(())
}

pub async fn delete(target: &Target, path: PathBuf, cell: String) -> anyhow::Result<()> {
    let manager = target.sessions().await?;
    let worker = worker(&manager, path).await?;
    manager
        .delete_cell(&worker, &cell)
        .await
        .map_err(describe)?;
    println!("deleted {cell}");
    Ok(())
}
