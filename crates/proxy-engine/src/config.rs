//! Engine launch configuration.

use std::path::PathBuf;

/// Host-level configuration for launching the engine, read once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the engine binary.
    pub binary: PathBuf,
    /// Optional gdb binary; when present a GDB port is allocated at spawn.
    pub gdb_binary: Option<PathBuf>,
    /// `RENODE_PROXY_GUI_DISABLED`: GUI launches are forbidden outright.
    pub gui_disabled: bool,
    /// `RENODE_HYPERVISOR_GUI_ENABLED` (legacy): GUI is forced on.
    pub gui_forced: bool,
}

impl EngineConfig {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            gdb_binary: None,
            gui_disabled: false,
            gui_forced: false,
        }
    }

    /// Effective GUI setting for a spawn request. The host disable switch
    /// wins over everything; the legacy force switch wins over the request.
    pub fn gui_for_request(&self, requested: bool) -> bool {
        if self.gui_disabled {
            return false;
        }
        self.gui_forced || requested
    }
}

/// Truthy environment flag: `1`, `true`, or `yes`, case-insensitive.
pub fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gui_disable_wins() {
        let mut config = EngineConfig::new("/bin/renode");
        config.gui_disabled = true;
        config.gui_forced = true;
        assert!(!config.gui_for_request(true));
    }

    #[test]
    fn test_gui_forced_overrides_request() {
        let mut config = EngineConfig::new("/bin/renode");
        config.gui_forced = true;
        assert!(config.gui_for_request(false));
    }

    #[test]
    fn test_gui_follows_request_by_default() {
        let config = EngineConfig::new("/bin/renode");
        assert!(config.gui_for_request(true));
        assert!(!config.gui_for_request(false));
    }
}
