pub mod bootstrap;
pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod launch;
pub mod orchestrator;
pub mod port;
pub mod readiness;
pub mod session;

pub use broker::{EventBus, Listener};
pub use config::HostConfig;
pub use error::{HostError, HostResult};
pub use jobs::{JobHost, ProcessJobHost};
pub use orchestrator::{Lifecycle, ServerEvent, ServerOrchestrator};
pub use session::{SessionManager, Worker};
