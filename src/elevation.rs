//! Privilege elevation for packet-filter commands
//!
//! WLFW normally runs as root (or with `CAP_NET_ADMIN`) and invokes iptables
//! directly. When it does not, it can wrap the tool in a non-interactive
//! elevation helper. A daemon has no terminal to prompt on, so only
//! password-less methods are offered.
//!
//! # Environment Variables
//!
//! - `WLFW_ELEVATION_METHOD`: Force a specific elevation method (`sudo` or `run0`).
//!   Meant for hosts with a sudoers NOPASSWD rule for iptables.
//!   Example: `WLFW_ELEVATION_METHOD=sudo wlfw serve`
//!
//! - `WLFW_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Security
//!
//! - Only the configured packet-filter binary can be elevated
//! - All inputs are validated before elevation
//! - Commands are constructed without shell interpolation

use std::path::Path;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `WLFW_ELEVATION_METHOD`
    #[error("Invalid WLFW_ELEVATION_METHOD '{0}'. Valid options: sudo, run0")]
    InvalidMethod(String),
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Builds the command used to run `program` with enough privilege to change
/// the kernel rule table.
///
/// Resolution order:
/// 1. `WLFW_TEST_NO_ELEVATION` set: run directly
/// 2. Already root: run directly
/// 3. `WLFW_ELEVATION_METHOD=sudo`: `sudo -n <program>`
/// 4. `WLFW_ELEVATION_METHOD=run0`: `run0 --no-ask-password <program>`
/// 5. Otherwise run directly and let the tool report the permission error
pub fn create_elevated_iptables_command(program: &Path) -> Result<Command, ElevationError> {
    let bypass = std::env::var("WLFW_TEST_NO_ELEVATION").is_ok() || nix::unistd::getuid().is_root();
    let method = std::env::var("WLFW_ELEVATION_METHOD").ok();
    build_elevated_command(program, bypass, method.as_deref())
}

fn build_elevated_command(
    program: &Path,
    bypass: bool,
    method: Option<&str>,
) -> Result<Command, ElevationError> {
    if bypass {
        return Ok(Command::new(program));
    }

    let method = method.map(str::to_lowercase).unwrap_or_default();
    match method.as_str() {
        "" => {
            tracing::debug!(
                "Not running as root and no elevation method configured; invoking {} directly",
                program.display()
            );
            Ok(Command::new(program))
        }
        "sudo" => {
            if !binary_exists("sudo") {
                return Err(ElevationError::MethodNotAvailable("sudo".into()));
            }
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(program);
            Ok(cmd)
        }
        "run0" => {
            if !binary_exists("run0") {
                return Err(ElevationError::MethodNotAvailable("run0".into()));
            }
            let mut cmd = Command::new("run0");
            cmd.arg("--no-ask-password").arg(program);
            Ok(cmd)
        }
        _ => Err(ElevationError::InvalidMethod(method)),
    }
}
