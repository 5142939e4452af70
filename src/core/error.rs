use std::time::Duration;
use thiserror::Error;

/// Core error types for WLFW
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Packet-filter tool invocation failed
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Configuration could not be loaded or saved
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Which gateway operation was running when a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum GatewayOp {
    Exists,
    Insert,
    Delete,
    List,
}

/// Why a gateway call failed
#[derive(Debug, Error)]
pub enum GatewayErrorKind {
    /// The tool could not be started (missing binary, exec permission)
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// No usable privilege escalation path
    #[error("privilege elevation unavailable: {0}")]
    Elevation(String),

    /// The tool did not finish before the deadline and was killed
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The tool ran but reported failure
    #[error("exited with status {}: {stderr}", .exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },

    /// The backend refused the call (in-memory backend fault injection)
    #[error("{0}")]
    Unavailable(String),
}

/// A failed packet-filter operation, with enough context to diagnose it
#[derive(Debug, Error)]
#[error("{op} `{rule}` failed: {kind}")]
pub struct GatewayError {
    pub op: GatewayOp,
    pub rule: String,
    #[source]
    pub kind: GatewayErrorKind,
}

impl GatewayError {
    pub fn new(op: GatewayOp, rule_args: &[String], kind: GatewayErrorKind) -> Self {
        Self {
            op,
            rule: rule_args.join(" "),
            kind,
        }
    }

    /// Timeouts are the only failures a caller may reasonably retry blind.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, GatewayErrorKind::Timeout(_))
    }

    pub fn translation(&self) -> ErrorTranslation {
        match &self.kind {
            GatewayErrorKind::Timeout(_) => IptablesErrorPattern::match_error("timed out"),
            GatewayErrorKind::Spawn { source, .. }
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                IptablesErrorPattern::match_error("command not found")
            }
            GatewayErrorKind::Elevation(msg) | GatewayErrorKind::Unavailable(msg) => {
                IptablesErrorPattern::match_error(msg)
            }
            GatewayErrorKind::Spawn { source, .. } => {
                IptablesErrorPattern::match_error(&source.to_string())
            }
            GatewayErrorKind::Failed { stderr, .. } => IptablesErrorPattern::match_error(stderr),
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// True if `stderr` is iptables reporting that no rule matches (`-C`/`-D` miss).
    ///
    /// Exit status 1 alone is not enough: privilege wrappers such as
    /// `sudo -n` also exit 1 without ever running iptables.
    pub fn is_missing_rule(stderr: &str) -> bool {
        let lower = stderr.to_lowercase();
        lower.contains("bad rule") && lower.contains("does a matching rule exist")
    }

    /// Matches an error message against known patterns and returns an operator-facing translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("you must be root")
        {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run the service as root or grant it CAP_NET_ADMIN")
                .with_suggestion("Or set WLFW_ELEVATION_METHOD=sudo with a NOPASSWD sudoers rule");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables-nft  (Fedora/RHEL)")
                .with_suggestion("Or point `iptables_path` in config.json at the binary");
        }

        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("Another process holds the xtables lock")
                .with_suggestion("Enable `wait_for_xtables_lock` in config.json")
                .with_suggestion("Check for conflicting firewall managers: systemctl status firewalld ufw");
        }

        if lower.contains("timeout") || lower.contains("timed out") {
            return ErrorTranslation::new("Firewall tool did not respond in time")
                .with_suggestion("The request was not applied; it is safe to retry")
                .with_suggestion("Raise `command_timeout_secs` if the host is heavily loaded");
        }

        if lower.contains("bad rule") || lower.contains("does a matching rule exist") {
            return ErrorTranslation::new("Rule not present in the kernel table")
                .with_suggestion("The rule may have been removed by another tool");
        }

        if lower.contains("chain") && (lower.contains("does not exist") || lower.contains("no chain")) {
            return ErrorTranslation::new("Firewall chain not found")
                .with_suggestion("Check the filter table: sudo iptables -t filter -S");
        }

        if (lower.contains("host/network") && lower.contains("not found"))
            || lower.contains("invalid mask")
        {
            return ErrorTranslation::new("Invalid source IP range")
                .with_suggestion("Use IPv4 CIDR notation: 10.0.0.0/8 or 192.168.1.10");
        }

        if lower.contains("invalid port") || (lower.contains("port") && lower.contains("invalid")) {
            return ErrorTranslation::new("Invalid destination port")
                .with_suggestion("Port numbers must be between 1 and 65535");
        }

        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Verify iptables is working: sudo iptables -t filter -S INPUT")
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iptables_missing_command() {
        let translation = IptablesErrorPattern::match_error("command not found: iptables");
        assert!(translation.user_message.contains("not installed"));
        assert!(translation.suggestions.len() >= 3);
    }

    #[test]
    fn test_permission_error() {
        let translation = IptablesErrorPattern::match_error(
            "iptables v1.8.9 (nf_tables): Could not fetch rule set generation id: Permission denied (you must be root)",
        );
        assert!(translation.user_message.contains("permissions"));
        assert!(translation.suggestions.iter().any(|s| s.contains("sudo")));
    }

    #[test]
    fn test_lock_contention() {
        let translation = IptablesErrorPattern::match_error(
            "Another app is currently holding the xtables lock. Perhaps you want to use the -w option?",
        );
        assert!(translation.user_message.contains("xtables lock"));
    }

    #[test]
    fn test_invalid_source_range() {
        let translation =
            IptablesErrorPattern::match_error("host/network `10.0.0.300' not found");
        assert!(translation.user_message.contains("source IP range"));
    }

    #[test]
    fn test_missing_rule_needs_iptables_message() {
        assert!(IptablesErrorPattern::is_missing_rule(
            "iptables: Bad rule (does a matching rule exist in that chain?)."
        ));
        assert!(!IptablesErrorPattern::is_missing_rule("sudo: a password is required"));
        assert!(!IptablesErrorPattern::is_missing_rule(
            "Failed to start transient service unit: Interactive authentication required."
        ));
        assert!(!IptablesErrorPattern::is_missing_rule(""));
    }

    #[test]
    fn test_generic_fallback_keeps_message() {
        let translation = IptablesErrorPattern::match_error("something odd happened");
        assert!(translation.user_message.contains("something odd happened"));
    }

    #[test]
    fn test_gateway_error_carries_context() {
        let args = vec!["-p".to_string(), "tcp".to_string(), "--dport".to_string(), "22".to_string()];
        let err = GatewayError::new(
            GatewayOp::Insert,
            &args,
            GatewayErrorKind::Failed {
                exit_code: Some(4),
                stderr: "Permission denied".to_string(),
            },
        );

        let msg = err.to_string();
        assert!(msg.starts_with("insert"));
        assert!(msg.contains("-p tcp --dport 22"));
        assert!(msg.contains("status 4"));
        assert!(!err.is_timeout());
        assert!(err.translation().user_message.contains("permissions"));
    }

    #[test]
    fn test_timeout_is_classified_separately() {
        let err = GatewayError::new(
            GatewayOp::Exists,
            &[],
            GatewayErrorKind::Timeout(Duration::from_millis(250)),
        );

        assert!(err.is_timeout());
        assert!(err.to_string().contains("250ms"));
        assert!(err.translation().user_message.contains("in time"));
    }
}
