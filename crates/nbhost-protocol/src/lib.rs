pub mod paths;
pub mod routes;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Opaque session identifier issued by the engine.
pub type SessionId = String;

/// Opaque cell identifier issued by the engine.
pub type CellId = String;

/// Notifications published to observers of a session manager.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum NotebookEvent {
    NotebookOpened {
        path: PathBuf,
    },
    NotebookClosed {
        path: PathBuf,
    },
    #[serde(rename_all = "camelCase")]
    CellUpdated {
        path: PathBuf,
        cell_id: CellId,
    },
}

impl NotebookEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            NotebookEvent::NotebookOpened { .. } => EventKind::NotebookOpened,
            NotebookEvent::NotebookClosed { .. } => EventKind::NotebookClosed,
            NotebookEvent::CellUpdated { .. } => EventKind::CellUpdated,
        }
    }

    pub fn path(&self) -> &PathBuf {
        match self {
            NotebookEvent::NotebookOpened { path }
            | NotebookEvent::NotebookClosed { path }
            | NotebookEvent::CellUpdated { path, .. } => path,
        }
    }
}

/// Event names listeners register against.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    NotebookOpened,
    NotebookClosed,
    CellUpdated,
}

/// Error codes surfaced to callers of the host.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AlreadyRunning,
    PortExhausted,
    BootstrapFailed,
    ToolchainInstallFailed,
    LaunchFailed,
    ServerNotReady,
    StartCancelled,
    NotConnected,
    NotebookNotFound,
    SessionOperationFailed,
    InvalidConfig,
    ServerError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AlreadyRunning => "already_running",
            ErrorCode::PortExhausted => "port_exhausted",
            ErrorCode::BootstrapFailed => "bootstrap_failed",
            ErrorCode::ToolchainInstallFailed => "toolchain_install_failed",
            ErrorCode::LaunchFailed => "launch_failed",
            ErrorCode::ServerNotReady => "server_not_ready",
            ErrorCode::StartCancelled => "start_cancelled",
            ErrorCode::NotConnected => "not_connected",
            ErrorCode::NotebookNotFound => "notebook_not_found",
            ErrorCode::SessionOperationFailed => "session_operation_failed",
            ErrorCode::InvalidConfig => "invalid_config",
            ErrorCode::ServerError => "server_error",
        }
    }
}

/// A notebook currently bound to a live engine session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OpenNotebook {
    pub path: PathBuf,
    pub session_id: SessionId,
}

/// Body of `POST /api/sessions`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OpenSessionRequest {
    pub path: PathBuf,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OpenSessionResponse {
    pub session_id: SessionId,
}

/// Body of `POST /api/sessions/{sid}/cells`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AddCellRequest {
    pub index: usize,
    pub code: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AddCellResponse {
    pub cell_id: CellId,
}

/// Body of the run and ephemeral endpoints.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunCodeRequest {
    pub code: String,
}

/// Rich display representation produced by a cell.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DisplayOutput {
    pub mime: String,
    pub body: String,
}

/// Error payload produced by a failing cell.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CellError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stacktrace: Vec<String>,
}

/// Structured outcome of running code in a cell.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CellResult {
    pub cell_id: CellId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<DisplayOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CellError>,
}

impl CellResult {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Error body returned by the engine on non-2xx responses.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EngineErrorBody {
    pub message: String,
}
