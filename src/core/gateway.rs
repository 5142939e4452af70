//! Packet-filter gateway
//!
//! [`Firewall`] is the only boundary through which kernel rule state is read
//! or changed. [`IptablesFirewall`] drives the `iptables` binary through
//! `tokio::process`, bounding every call with a deadline; the in-memory
//! backend in [`crate::core::memory`] stands in for it in tests and dry runs.
//!
//! Exit-status contract for `iptables -C`: 0 means the rule exists, 1 with
//! iptables' "Bad rule" message means no matching rule, anything else
//! (including a refusing `sudo -n`, which also exits 1) is a failure.

use crate::core::error::{GatewayError, GatewayErrorKind, GatewayOp, IptablesErrorPattern};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, error};

/// Gateway operations on one table/chain. `insert` and `delete` are not
/// idempotent; callers check `exists` first.
#[async_trait]
pub trait Firewall: Send + Sync {
    async fn exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool, GatewayError>;

    async fn insert(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        rule: &[String],
    ) -> Result<(), GatewayError>;

    async fn delete(&self, table: &str, chain: &str, rule: &[String]) -> Result<(), GatewayError>;

    /// Raw `-S` style rule specifications of the chain
    async fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, GatewayError>;
}

/// Settings for the process-backed gateway
#[derive(Debug, Clone)]
pub struct IptablesOptions {
    pub program: PathBuf,
    pub wait_for_lock: bool,
    pub timeout: Duration,
}

impl Default for IptablesOptions {
    fn default() -> Self {
        Self {
            program: PathBuf::from("iptables"),
            wait_for_lock: true,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Output of one finished tool invocation
struct ToolOutput {
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
}

pub struct IptablesFirewall {
    options: IptablesOptions,
}

impl IptablesFirewall {
    pub fn new(options: IptablesOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &IptablesOptions {
        &self.options
    }

    /// Runs `<program> [-w] -t <table> <command...> <rule...>` under the deadline.
    async fn run(
        &self,
        op: GatewayOp,
        table: &str,
        command: &[&str],
        rule: &[String],
    ) -> Result<ToolOutput, GatewayError> {
        let fail = |kind| GatewayError::new(op, rule, kind);

        let mut cmd = crate::elevation::create_elevated_iptables_command(&self.options.program)
            .map_err(|e| fail(GatewayErrorKind::Elevation(e.to_string())))?;

        if self.options.wait_for_lock {
            cmd.arg("-w");
        }
        cmd.args(["-t", table])
            .args(command)
            .args(rule)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(%op, "Running {} -t {table} {} {}", self.options.program.display(), command.join(" "), rule.join(" "));

        let child = cmd.spawn().map_err(|source| {
            error!("Failed to spawn {}: {source}", self.options.program.display());
            fail(GatewayErrorKind::Spawn {
                program: self.options.program.display().to_string(),
                source,
            })
        })?;

        // Dropping the pending future on timeout kills the child (kill_on_drop)
        let output = tokio::time::timeout(self.options.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                error!(%op, "iptables timed out after {:?}", self.options.timeout);
                fail(GatewayErrorKind::Timeout(self.options.timeout))
            })?
            .map_err(|source| {
                fail(GatewayErrorKind::Spawn {
                    program: self.options.program.display().to_string(),
                    source,
                })
            })?;

        Ok(ToolOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    fn check_success(op: GatewayOp, rule: &[String], output: ToolOutput) -> Result<ToolOutput, GatewayError> {
        if output.exit_code == Some(0) {
            return Ok(output);
        }

        error!(%op, exit_code = ?output.exit_code, "iptables failed: {}", output.stderr);
        Err(GatewayError::new(
            op,
            rule,
            GatewayErrorKind::Failed {
                exit_code: output.exit_code,
                stderr: output.stderr,
            },
        ))
    }
}

#[async_trait]
impl Firewall for IptablesFirewall {
    async fn exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool, GatewayError> {
        let output = self.run(GatewayOp::Exists, table, &["-C", chain], rule).await?;

        match output.exit_code {
            Some(0) => Ok(true),
            Some(1) if IptablesErrorPattern::is_missing_rule(&output.stderr) => Ok(false),
            exit_code => {
                error!(op = %GatewayOp::Exists, ?exit_code, "iptables check failed: {}", output.stderr);
                Err(GatewayError::new(
                    GatewayOp::Exists,
                    rule,
                    GatewayErrorKind::Failed {
                        exit_code,
                        stderr: output.stderr,
                    },
                ))
            }
        }
    }

    async fn insert(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        rule: &[String],
    ) -> Result<(), GatewayError> {
        let position = position.to_string();
        let output = self
            .run(GatewayOp::Insert, table, &["-I", chain, &position], rule)
            .await?;
        Self::check_success(GatewayOp::Insert, rule, output).map(|_| ())
    }

    async fn delete(&self, table: &str, chain: &str, rule: &[String]) -> Result<(), GatewayError> {
        let output = self.run(GatewayOp::Delete, table, &["-D", chain], rule).await?;
        Self::check_success(GatewayOp::Delete, rule, output).map(|_| ())
    }

    async fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, GatewayError> {
        let output = self.run(GatewayOp::List, table, &["-S", chain], &[]).await?;
        let output = Self::check_success(GatewayOp::List, &[], output)?;

        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::accept::{Accept, CHAIN, TABLE};
    use crate::core::test_helpers::{MockIptables, setup_no_elevation};

    fn firewall(mock: &MockIptables) -> IptablesFirewall {
        IptablesFirewall::new(IptablesOptions {
            program: mock.program(),
            wait_for_lock: true,
            timeout: Duration::from_secs(5),
        })
    }

    #[tokio::test]
    async fn test_insert_then_exists_then_delete() {
        setup_no_elevation();
        let mock = MockIptables::new();
        let fw = firewall(&mock);
        let rule = Accept::new("10.0.0.0/8", 22).rule_args();

        assert!(!fw.exists(TABLE, CHAIN, &rule).await.unwrap());
        fw.insert(TABLE, CHAIN, 1, &rule).await.unwrap();
        assert!(fw.exists(TABLE, CHAIN, &rule).await.unwrap());

        fw.delete(TABLE, CHAIN, &rule).await.unwrap();
        assert!(!fw.exists(TABLE, CHAIN, &rule).await.unwrap());
    }

    #[tokio::test]
    async fn test_insert_goes_to_top_of_chain() {
        setup_no_elevation();
        let mock = MockIptables::new();
        let fw = firewall(&mock);

        fw.insert(TABLE, CHAIN, 1, &Accept::new("", 80).rule_args()).await.unwrap();
        fw.insert(TABLE, CHAIN, 1, &Accept::new("", 443).rule_args()).await.unwrap();

        let lines = fw.list(TABLE, CHAIN).await.unwrap();
        assert_eq!(lines[0], "-P INPUT ACCEPT");
        assert!(lines[1].contains("--dport 443"));
        assert!(lines[2].contains("--dport 80"));
    }

    #[tokio::test]
    async fn test_argument_order_matters_for_exists() {
        setup_no_elevation();
        let mock = MockIptables::new();
        let fw = firewall(&mock);
        let rule = Accept::new("10.0.0.0/8", 22).rule_args();
        fw.insert(TABLE, CHAIN, 1, &rule).await.unwrap();

        let reordered: Vec<String> = ["-s", "10.0.0.0/8", "-p", "tcp", "--dport", "22", "-j", "ACCEPT"]
            .into_iter()
            .map(String::from)
            .collect();
        assert!(!fw.exists(TABLE, CHAIN, &reordered).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_missing_rule_fails() {
        setup_no_elevation();
        let mock = MockIptables::new();
        let fw = firewall(&mock);
        let rule = Accept::new("", 8080).rule_args();

        let err = fw.delete(TABLE, CHAIN, &rule).await.unwrap_err();
        assert_eq!(err.op, GatewayOp::Delete);
        assert!(matches!(err.kind, GatewayErrorKind::Failed { exit_code: Some(1), .. }));
        assert!(err.rule.contains("--dport 8080"));
    }

    #[tokio::test]
    async fn test_tool_failure_is_error_not_absent() {
        setup_no_elevation();
        let mock = MockIptables::failing();
        let fw = firewall(&mock);
        let rule = Accept::new("", 22).rule_args();

        let err = fw.exists(TABLE, CHAIN, &rule).await.unwrap_err();
        assert_eq!(err.op, GatewayOp::Exists);
        assert!(matches!(err.kind, GatewayErrorKind::Failed { exit_code: Some(4), .. }));
        assert!(err.translation().user_message.contains("permissions"));
    }

    #[tokio::test]
    async fn test_wrapper_exit_one_is_error_not_absent() {
        setup_no_elevation();
        let mock = MockIptables::new();
        mock.set_denied(true);
        let fw = firewall(&mock);
        let rule = Accept::new("10.0.0.0/8", 22).rule_args();

        let err = fw.exists(TABLE, CHAIN, &rule).await.unwrap_err();
        assert_eq!(err.op, GatewayOp::Exists);
        match err.kind {
            GatewayErrorKind::Failed { exit_code, stderr } => {
                assert_eq!(exit_code, Some(1));
                assert!(stderr.contains("password is required"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_tool_times_out() {
        setup_no_elevation();
        let mock = MockIptables::slow(3);
        let fw = IptablesFirewall::new(IptablesOptions {
            program: mock.program(),
            wait_for_lock: false,
            timeout: Duration::from_millis(200),
        });

        let err = fw
            .exists(TABLE, CHAIN, &Accept::new("", 22).rule_args())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        setup_no_elevation();
        let fw = IptablesFirewall::new(IptablesOptions {
            program: PathBuf::from("/nonexistent/wlfw-iptables"),
            ..IptablesOptions::default()
        });

        let err = fw
            .exists(TABLE, CHAIN, &Accept::new("", 22).rule_args())
            .await
            .unwrap_err();
        assert!(matches!(err.kind, GatewayErrorKind::Spawn { .. }));
        assert!(err.translation().user_message.contains("not installed"));
    }
}
