//! Tunnel binary ownership: process lifecycle, liveness monitoring and
//! the recovery state machine. External callers only ever ask for reload
//! or restart through the monitor's API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod monitor;
pub mod process;

/// Tunnel lifecycle states as observed by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Up,
    Down,
    Restarting,
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelStatus::Up => write!(f, "up"),
            TunnelStatus::Down => write!(f, "down"),
            TunnelStatus::Restarting => write!(f, "restarting"),
        }
    }
}

/// Delivered to subscribers whenever the monitor's state machine changes
/// state. Endpoints consume these to answer `tunnel_status` requests.
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelStatusChange {
    pub status: TunnelStatus,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub at: DateTime<Utc>,
}

/// The one door external callers have into the tunnel process: asking
/// for a configuration reload.
#[async_trait]
pub trait TunnelControl: Send + Sync {
    async fn request_reload(&self) -> Result<(), TunnelError>;
}

#[async_trait]
impl TunnelControl for monitor::TunnelMonitor {
    async fn request_reload(&self) -> Result<(), TunnelError> {
        self.reload().await
    }
}

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("could not spawn tunnel binary: `{0}`")]
    Spawn(String),

    #[error("could not signal tunnel process: `{0}`")]
    Signal(String),

    #[error("tunnel process is not running")]
    NotRunning,
}
