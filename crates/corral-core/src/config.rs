//! Sandbox settings shared by the daemon and the templates

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Settings consumed when the container and cgroup templates are built.
///
/// Supplied externally (flags, config file); read-only after startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    /// Maximum number of simultaneous executions; also the pool capacity
    pub parallelism: usize,

    /// Mount data string for the work and tmp tmpfs mounts
    pub tmpfs_data: String,

    /// Share the host network namespace instead of unsharing it
    pub share_net: bool,

    /// Container root directory; `None` means a fresh temp directory
    pub root: Option<PathBuf>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            parallelism: 4,
            tmpfs_data: String::from("size=8m,nr_inodes=4k"),
            share_net: false,
            root: None,
        }
    }
}

impl SandboxSettings {
    /// Create a new settings builder
    #[must_use]
    pub fn builder() -> SandboxSettingsBuilder {
        SandboxSettingsBuilder::default()
    }
}

/// Builder for [`SandboxSettings`]
#[derive(Debug, Default)]
pub struct SandboxSettingsBuilder {
    settings: SandboxSettings,
}

impl SandboxSettingsBuilder {
    #[must_use]
    pub fn parallelism(mut self, n: usize) -> Self {
        self.settings.parallelism = n.max(1);
        self
    }

    #[must_use]
    pub fn tmpfs_data(mut self, data: impl Into<String>) -> Self {
        self.settings.tmpfs_data = data.into();
        self
    }

    #[must_use]
    pub fn share_net(mut self, share: bool) -> Self {
        self.settings.share_net = share;
        self
    }

    #[must_use]
    pub fn root(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.root = Some(path.into());
        self
    }

    #[must_use]
    pub fn build(self) -> SandboxSettings {
        self.settings
    }
}

/// Get default socket path from CORRAL_SOCKET env var or system default
///
/// Returns:
/// - `$CORRAL_SOCKET` if set (for development)
/// - `/run/corral/corral.sock` otherwise (production)
pub fn default_socket_path() -> PathBuf {
    std::env::var("CORRAL_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/corral/corral.sock"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_covers_every_setting() {
        let s = SandboxSettings::builder()
            .parallelism(2)
            .tmpfs_data("size=1m")
            .share_net(true)
            .root("/var/lib/corral")
            .build();
        assert_eq!(s.parallelism, 2);
        assert_eq!(s.tmpfs_data, "size=1m");
        assert!(s.share_net);
        assert_eq!(s.root.as_deref(), Some(std::path::Path::new("/var/lib/corral")));
    }

    #[test]
    fn root_is_unset_unless_configured() {
        let s = SandboxSettings::builder().parallelism(1).build();
        assert!(s.root.is_none());
    }
}
