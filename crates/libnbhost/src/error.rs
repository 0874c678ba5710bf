use std::path::PathBuf;

use nbhost_protocol::ErrorCode;
use thiserror::Error;

pub type HostResult<T> = std::result::Result<T, HostError>;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("engine server is already running")]
    AlreadyRunning,

    #[error("no free port in {attempts} attempts starting at {start}")]
    PortExhausted { start: u16, attempts: u16 },

    #[error("toolchain install failed: {0}")]
    ToolchainInstallFailed(String),

    #[error("environment bootstrap failed: {0}")]
    BootstrapFailed(String),

    #[error("server launch failed: {0}")]
    LaunchFailed(String),

    #[error("engine server did not answer after {attempts} attempts")]
    ServerNotReady { attempts: u32 },

    #[error("server start cancelled by stop request")]
    StartCancelled,

    #[error("not connected to an engine server")]
    NotConnected,

    #[error("notebook not found: {}", .0.display())]
    NotebookNotFound(PathBuf),

    #[error("{operation} failed: {message}")]
    SessionOperationFailed { operation: String, message: String },

    #[error("invalid config: {0}")]
    Config(String),

    #[error("http client setup failed: {0}")]
    HttpClient(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    pub(crate) fn session_op(operation: &str, message: impl Into<String>) -> Self {
        HostError::SessionOperationFailed {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            HostError::AlreadyRunning => (ErrorCode::AlreadyRunning, self.to_string()),
            HostError::PortExhausted { .. } => (ErrorCode::PortExhausted, self.to_string()),
            HostError::ToolchainInstallFailed(_) => {
                (ErrorCode::ToolchainInstallFailed, self.to_string())
            }
            HostError::BootstrapFailed(_) => (ErrorCode::BootstrapFailed, self.to_string()),
            HostError::LaunchFailed(_) => (ErrorCode::LaunchFailed, self.to_string()),
            HostError::ServerNotReady { .. } => (ErrorCode::ServerNotReady, self.to_string()),
            HostError::StartCancelled => (ErrorCode::StartCancelled, self.to_string()),
            HostError::NotConnected => (ErrorCode::NotConnected, self.to_string()),
            HostError::NotebookNotFound(_) => (ErrorCode::NotebookNotFound, self.to_string()),
            HostError::SessionOperationFailed { .. } => {
                (ErrorCode::SessionOperationFailed, self.to_string())
            }
            HostError::Config(_) => (ErrorCode::InvalidConfig, self.to_string()),
            HostError::HttpClient(_) => (ErrorCode::ServerError, self.to_string()),
            HostError::Io(_) => (ErrorCode::ServerError, "internal I/O error".to_string()),
        }
    }

    /// Whether a later `start()` may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HostError::PortExhausted { .. }
                | HostError::ServerNotReady { .. }
                | HostError::LaunchFailed(_)
                | HostError::StartCancelled
        )
    }
}
