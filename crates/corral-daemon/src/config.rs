//! Daemon configuration

use corral_core::SandboxSettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Path to Unix socket
    pub socket_path: PathBuf,

    /// Sandbox settings handed to the templates and pools
    pub settings: SandboxSettings,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: corral_core::config::default_socket_path(),
            settings: SandboxSettings::default(),
        }
    }
}
