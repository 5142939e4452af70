//! In-memory packet-filter backend
//!
//! Behaves like the kernel table as seen through iptables: rules are matched
//! by exact argument sequence, `insert` does not deduplicate, and `delete` of
//! an absent rule fails. Used by the test suite and by `wlfw serve --dry-run`.
//!
//! # Example
//!
//! ```
//! use wlfw::core::gateway::Firewall;
//! use wlfw::core::memory::MemoryFirewall;
//!
//! # async fn example() {
//! let fw = MemoryFirewall::new();
//! let rule = vec!["-p".to_string(), "tcp".to_string()];
//! fw.insert("filter", "INPUT", 1, &rule).await.unwrap();
//! assert!(fw.exists("filter", "INPUT", &rule).await.unwrap());
//! # }
//! ```

use crate::core::error::{GatewayError, GatewayErrorKind, GatewayOp};
use crate::core::gateway::Firewall;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Call counters, for asserting which gateway operations ran
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub exists: usize,
    pub insert: usize,
    pub delete: usize,
    pub list: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.exists + self.insert + self.delete + self.list
    }
}

#[derive(Default)]
pub struct MemoryFirewall {
    chains: Mutex<HashMap<(String, String), Vec<Vec<String>>>>,
    calls: Mutex<CallCounts>,
    fail_next: Mutex<Option<GatewayOp>>,
    unavailable: AtomicBool,
    latency_ms: AtomicUsize,
}

impl MemoryFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call of `op` fail once.
    pub fn fail_next(&self, op: GatewayOp) {
        *self.fail_next.lock() = Some(op);
    }

    /// Makes every call fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Adds a delay to every call, widening check-then-act windows in tests.
    pub fn set_latency(&self, latency: Duration) {
        let millis = usize::try_from(latency.as_millis()).unwrap_or(usize::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    pub fn calls(&self) -> CallCounts {
        *self.calls.lock()
    }

    /// Rules of a chain, highest priority first
    pub fn rules(&self, table: &str, chain: &str) -> Vec<Vec<String>> {
        self.chains
            .lock()
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Adds a rule behind the service's back, like an operator running iptables by hand.
    pub fn seed(&self, table: &str, chain: &str, rule: &[String]) {
        self.chains
            .lock()
            .entry((table.to_string(), chain.to_string()))
            .or_default()
            .push(rule.to_vec());
    }

    /// Removes every copy of a rule behind the service's back.
    pub fn purge(&self, table: &str, chain: &str, rule: &[String]) {
        if let Some(rules) = self
            .chains
            .lock()
            .get_mut(&(table.to_string(), chain.to_string()))
        {
            rules.retain(|r| r.as_slice() != rule);
        }
    }

    async fn enter(&self, op: GatewayOp, rule: &[String]) -> Result<(), GatewayError> {
        {
            let mut calls = self.calls.lock();
            match op {
                GatewayOp::Exists => calls.exists += 1,
                GatewayOp::Insert => calls.insert += 1,
                GatewayOp::Delete => calls.delete += 1,
                GatewayOp::List => calls.list += 1,
            }
        }

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency as u64)).await;
        }

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::new(
                op,
                rule,
                GatewayErrorKind::Unavailable("firewall backend unavailable".to_string()),
            ));
        }

        let mut fail_next = self.fail_next.lock();
        if *fail_next == Some(op) {
            *fail_next = None;
            return Err(GatewayError::new(
                op,
                rule,
                GatewayErrorKind::Unavailable(format!("injected {op} failure")),
            ));
        }

        Ok(())
    }
}

#[async_trait]
impl Firewall for MemoryFirewall {
    async fn exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool, GatewayError> {
        self.enter(GatewayOp::Exists, rule).await?;
        Ok(self
            .rules(table, chain)
            .iter()
            .any(|r| r.as_slice() == rule))
    }

    async fn insert(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        rule: &[String],
    ) -> Result<(), GatewayError> {
        self.enter(GatewayOp::Insert, rule).await?;

        let mut chains = self.chains.lock();
        let rules = chains
            .entry((table.to_string(), chain.to_string()))
            .or_default();

        // iptables positions are 1-based
        let index = (position.max(1) as usize - 1).min(rules.len());
        rules.insert(index, rule.to_vec());
        Ok(())
    }

    async fn delete(&self, table: &str, chain: &str, rule: &[String]) -> Result<(), GatewayError> {
        self.enter(GatewayOp::Delete, rule).await?;

        let mut chains = self.chains.lock();
        let index = chains
            .get(&(table.to_string(), chain.to_string()))
            .and_then(|rules| rules.iter().position(|r| r.as_slice() == rule));

        match index {
            Some(index) => {
                if let Some(rules) = chains.get_mut(&(table.to_string(), chain.to_string())) {
                    rules.remove(index);
                }
                Ok(())
            }
            None => Err(GatewayError::new(
                GatewayOp::Delete,
                rule,
                GatewayErrorKind::Failed {
                    exit_code: Some(1),
                    stderr: "iptables: Bad rule (does a matching rule exist in that chain?)."
                        .to_string(),
                },
            )),
        }
    }

    async fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, GatewayError> {
        self.enter(GatewayOp::List, &[]).await?;

        let mut lines = vec![format!("-P {chain} ACCEPT")];
        lines.extend(
            self.rules(table, chain)
                .iter()
                .map(|r| format!("-A {chain} {}", r.join(" "))),
        );
        Ok(lines)
    }
}
