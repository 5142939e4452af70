use crate::core::error::{Error, Result};
use crate::core::gateway::IptablesOptions;
use crate::core::reconciler::ReconcilerOptions;
use crate::utils::get_config_dir;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for `command_timeout_secs`
const MAX_COMMAND_TIMEOUT_SECS: u64 = 60;

/// Service configuration, stored as `config.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Address the HTTP API listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Packet-filter binary (absolute path or name looked up in PATH)
    #[serde(default = "default_iptables_path")]
    pub iptables_path: PathBuf,
    /// Pass `-w` so iptables waits for the xtables lock instead of failing
    #[serde(default = "default_true")]
    pub wait_for_xtables_lock: bool,
    /// Deadline for each iptables invocation (clamped to 1..=60 seconds)
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Seed the registry from existing kernel ACCEPT rules at startup
    #[serde(default)]
    pub sync_on_startup: bool,
    /// Record a rule the kernel already has when a client adds it
    #[serde(default)]
    pub adopt_existing: bool,
    /// Write kernel mutations to the audit log in the state directory
    #[serde(default = "default_true")]
    pub audit_enabled: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            iptables_path: default_iptables_path(),
            wait_for_xtables_lock: true,
            command_timeout_secs: default_command_timeout(),
            sync_on_startup: false,
            adopt_existing: false,
            audit_enabled: true,
        }
    }
}

impl ServiceConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.clamp(1, MAX_COMMAND_TIMEOUT_SECS))
    }

    pub fn iptables_options(&self) -> IptablesOptions {
        IptablesOptions {
            program: self.iptables_path.clone(),
            wait_for_lock: self.wait_for_xtables_lock,
            timeout: self.command_timeout(),
        }
    }

    pub fn reconciler_options(&self) -> ReconcilerOptions {
        ReconcilerOptions {
            adopt_existing: self.adopt_existing,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_iptables_path() -> PathBuf {
    PathBuf::from("iptables")
}

fn default_true() -> bool {
    true
}

fn default_command_timeout() -> u64 {
    5
}

/// `config.json` in the XDG config directory
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Loads the config from `path`, or returns defaults if the file does not exist.
///
/// # Errors
///
/// Returns `Err` if the file exists but cannot be read or parsed.
pub async fn load_config(path: &Path) -> Result<ServiceConfig> {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => serde_json::from_str(&json)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("No config at {}, using defaults", path.display());
            Ok(ServiceConfig::default())
        }
        Err(e) => Err(Error::Config(format!("{}: {e}", path.display()))),
    }
}

/// Saves the config using an atomic write pattern.
/// 1. Writes to a temporary file in the target directory.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
///
/// # Errors
///
/// Returns `Err` if the directory cannot be created or the file cannot be written.
pub fn save_config(config: &ServiceConfig, path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let json = serde_json::to_string_pretty(config)?;

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(json.as_bytes())?;
    file.as_file().sync_all()?;

    file.persist(path).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::StorageFull {
            Error::Config("Disk full: cannot save configuration".to_string())
        } else {
            Error::Io(e.error)
        }
    })?;

    Ok(())
}
