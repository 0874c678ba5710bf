use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::TcpListener;
use tracing::debug;

use crate::error::{HostError, HostResult};

pub const DEFAULT_SEARCH_WINDOW: u16 = 100;

/// Finds a loopback port the engine server can bind.
#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    search_window: u16,
}

/// Outcome of a successful allocation; fixed until the server exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAssignment {
    pub preferred: u16,
    pub actual: u16,
}

impl PortAssignment {
    pub fn changed(&self) -> bool {
        self.preferred != self.actual
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_SEARCH_WINDOW)
    }
}

impl PortAllocator {
    pub fn new(search_window: u16) -> Self {
        Self {
            search_window: search_window.max(1),
        }
    }

    /// True iff the port can be bound right now. The probe listener is
    /// released before returning.
    pub async fn is_available(&self, port: u16) -> bool {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                drop(listener);
                true
            }
            Err(err) => {
                debug!(port, "port unavailable: {err}");
                false
            }
        }
    }

    /// Probe `preferred`, then `preferred + 1`, ... within the search window.
    pub async fn find_available(&self, preferred: u16) -> HostResult<u16> {
        for offset in 0..self.search_window {
            let Some(port) = preferred.checked_add(offset) else {
                break;
            };
            if port == 0 {
                continue;
            }
            if self.is_available(port).await {
                return Ok(port);
            }
        }
        Err(HostError::PortExhausted {
            start: preferred,
            attempts: self.search_window,
        })
    }

    pub async fn assign(&self, preferred: u16) -> HostResult<PortAssignment> {
        let actual = self.find_available(preferred).await?;
        Ok(PortAssignment { preferred, actual })
    }
}
