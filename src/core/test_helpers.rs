//! Shared test utilities for core module tests
//!
//! This module is only compiled in test mode.

use std::path::PathBuf;
use std::sync::Once;
use tempfile::TempDir;

static NO_ELEVATION_INIT: Once = Once::new();

/// Makes every gateway command run the configured program directly.
///
/// Thread-safe and idempotent; nothing in the test suite unsets it again.
pub fn setup_no_elevation() {
    NO_ELEVATION_INIT.call_once(|| {
        // SAFETY: Only called once due to Once, and only in test code.
        unsafe {
            std::env::set_var("WLFW_TEST_NO_ELEVATION", "1");
        }
    });
}

/// A private instance of the mock iptables script (`tests/mock_iptables.sh`).
///
/// Each instance is a scratch directory holding a symlink to the script; the
/// script keeps its rule table and behaviour switches next to the symlink,
/// so parallel tests never share state.
pub struct MockIptables {
    dir: TempDir,
}

impl MockIptables {
    pub fn new() -> Self {
        let script = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("mock_iptables.sh");
        ensure_executable(&script);

        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(&script, dir.path().join("iptables")).unwrap();
        Self { dir }
    }

    /// Every call fails with a permission error (exit 4)
    pub fn failing() -> Self {
        let mock = Self::new();
        std::fs::write(mock.dir.path().join("fail"), "").unwrap();
        mock
    }

    /// Every call sleeps `secs` seconds before answering
    pub fn slow(secs: u32) -> Self {
        let mock = Self::new();
        std::fs::write(mock.dir.path().join("delay"), secs.to_string()).unwrap();
        mock
    }

    /// Switches on or off a wrapper-style refusal: exit 1 with sudo's stderr,
    /// iptables never runs
    pub fn set_denied(&self, denied: bool) {
        let marker = self.dir.path().join("deny");
        if denied {
            std::fs::write(marker, "").unwrap();
        } else {
            let _ = std::fs::remove_file(marker);
        }
    }

    pub fn program(&self) -> PathBuf {
        self.dir.path().join("iptables")
    }

    /// Stored rules as "<chain> <args...>" lines
    pub fn stored_rules(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("rules"))
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }
}

fn ensure_executable(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = std::fs::metadata(path).unwrap().permissions();
    if perms.mode() & 0o111 == 0 {
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).unwrap();
    }
}
