//! Registry/kernel reconciliation
//!
//! The [`Reconciler`] is the only code path that changes either the kernel
//! rule table or the [`Registry`]. Each operation runs under a per-key lock
//! for its `(port, source range)` pair, always mutates the kernel first and
//! the registry second, and never touches the registry when the kernel call
//! failed.
//!
//! # Add
//!
//! 1. Render the rule and ask the gateway whether it already exists
//! 2. Exists: report [`AddOutcome::AlreadyExists`]; the registry is left as is
//!    unless `adopt_existing` is enabled
//! 3. Absent: insert at position 1, then append to the registry
//!
//! # Delete
//!
//! 1. Look the entry up in the registry; absent means [`DeleteOutcome::NotFound`]
//!    with no gateway call
//! 2. Ask the gateway whether the rule exists
//! 3. Absent in the kernel: drop the stale registry entry ([`DeleteOutcome::Healed`])
//! 4. Present: delete it, then drop the registry entry

use crate::audit::{AuditEvent, AuditLog, EventType};
use crate::core::accept::{Accept, CHAIN, INSERT_POSITION, TABLE, parse_rule_spec};
use crate::core::error::Result;
use crate::core::gateway::Firewall;
use crate::core::locks::KeyedLocks;
use crate::core::registry::{Registry, RegistrySnapshot};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Rule inserted into the kernel and recorded
    Created,
    /// Kernel already had an identical rule; nothing inserted
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Rule removed from the kernel and the registry
    Deleted,
    /// No such entry in the registry; the kernel was not consulted
    NotFound,
    /// Entry was registered but the kernel rule was already gone; entry dropped
    Healed,
}

impl DeleteOutcome {
    /// `Healed` is reported to clients like `NotFound`: the rule was not there to delete.
    pub fn is_not_found(self) -> bool {
        matches!(self, Self::NotFound | Self::Healed)
    }
}

/// Reconciler behaviour switches
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcilerOptions {
    /// Record a pre-existing kernel rule in the registry on `AlreadyExists`
    pub adopt_existing: bool,
}

pub struct Reconciler {
    firewall: Arc<dyn Firewall>,
    registry: Mutex<Registry>,
    locks: KeyedLocks<(u16, String)>,
    audit: Option<AuditLog>,
    options: ReconcilerOptions,
}

impl Reconciler {
    pub fn new(firewall: Arc<dyn Firewall>) -> Self {
        Self {
            firewall,
            registry: Mutex::new(Registry::new()),
            locks: KeyedLocks::new(),
            audit: None,
            options: ReconcilerOptions::default(),
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_options(mut self, options: ReconcilerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn list(&self) -> RegistrySnapshot {
        self.registry.lock().list_all()
    }

    pub async fn add(&self, accept: Accept) -> Result<AddOutcome> {
        let _key = self.locks.lock(accept.key()).await;
        let rule = accept.rule_args();

        debug!(port = accept.dest_port, source = %accept.source_ip_range, "Checking kernel for rule");
        let exists = self.firewall.exists(TABLE, CHAIN, &rule).await.map_err(|e| {
            error!("Existence check failed: {e}");
            e
        })?;

        if exists {
            info!(
                port = accept.dest_port,
                source = %accept.source_ip_range,
                "Rule already present in kernel"
            );
            if self.options.adopt_existing {
                let mut registry = self.registry.lock();
                if !registry.contains(accept.dest_port, &accept.source_ip_range) {
                    registry.append(accept);
                }
            }
            return Ok(AddOutcome::AlreadyExists);
        }

        if let Err(e) = self
            .firewall
            .insert(TABLE, CHAIN, INSERT_POSITION, &rule)
            .await
        {
            error!("Insert failed, registry unchanged: {e}");
            self.audit(AuditEvent::for_accept(
                EventType::InsertRule,
                &accept,
                false,
                Some(e.to_string()),
            ))
            .await;
            return Err(e.into());
        }

        info!(
            port = accept.dest_port,
            source = %accept.source_ip_range,
            "Inserted ACCEPT rule at {TABLE}/{CHAIN} position {INSERT_POSITION}"
        );
        let event = AuditEvent::for_accept(EventType::InsertRule, &accept, true, None);
        self.registry.lock().append(accept);
        self.audit(event).await;

        Ok(AddOutcome::Created)
    }

    pub async fn delete(&self, dest_port: u16, source_ip_range: &str) -> Result<DeleteOutcome> {
        let _key = self
            .locks
            .lock((dest_port, source_ip_range.to_string()))
            .await;

        let Some(accept) = self
            .registry
            .lock()
            .find(dest_port, source_ip_range)
            .cloned()
        else {
            debug!(port = dest_port, source = %source_ip_range, "Delete target not registered");
            return Ok(DeleteOutcome::NotFound);
        };

        let rule = accept.rule_args();
        let exists = self.firewall.exists(TABLE, CHAIN, &rule).await.map_err(|e| {
            error!("Existence check failed: {e}");
            e
        })?;

        if !exists {
            warn!(
                port = dest_port,
                source = %source_ip_range,
                "Registered rule missing from kernel, dropping stale registry entry"
            );
            self.registry.lock().remove(dest_port, source_ip_range);
            self.audit(AuditEvent::for_accept(
                EventType::HealRegistry,
                &accept,
                true,
                Some("rule absent from kernel".to_string()),
            ))
            .await;
            return Ok(DeleteOutcome::Healed);
        }

        if let Err(e) = self.firewall.delete(TABLE, CHAIN, &rule).await {
            error!("Delete failed, registry unchanged: {e}");
            self.audit(AuditEvent::for_accept(
                EventType::DeleteRule,
                &accept,
                false,
                Some(e.to_string()),
            ))
            .await;
            return Err(e.into());
        }

        info!(port = dest_port, source = %source_ip_range, "Deleted ACCEPT rule");
        self.registry.lock().remove(dest_port, source_ip_range);
        self.audit(AuditEvent::for_accept(EventType::DeleteRule, &accept, true, None))
            .await;

        Ok(DeleteOutcome::Deleted)
    }

    /// Seeds the registry from plain TCP ACCEPT rules already in the kernel.
    ///
    /// Returns how many entries were added. Rules already registered are skipped.
    pub async fn adopt_existing_rules(&self) -> Result<usize> {
        let lines = self.firewall.list(TABLE, CHAIN).await?;

        let found: Vec<Accept> = lines
            .iter()
            .filter_map(|line| parse_rule_spec(line, CHAIN))
            .collect();

        let mut adopted = 0;
        {
            let mut registry = self.registry.lock();
            for accept in found {
                if !registry.contains(accept.dest_port, &accept.source_ip_range) {
                    registry.append(accept);
                    adopted += 1;
                }
            }
        }

        info!("Adopted {adopted} existing ACCEPT rule(s) from {TABLE}/{CHAIN}");
        self.audit(AuditEvent::new(
            EventType::AdoptRules,
            true,
            serde_json::json!({ "adopted": adopted, "scanned": lines.len() }),
            None,
        ))
        .await;

        Ok(adopted)
    }

    async fn audit(&self, event: AuditEvent) {
        if let Some(audit) = &self.audit {
            audit.record(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{Error, GatewayOp};
    use crate::core::memory::MemoryFirewall;
    use std::time::Duration;

    fn setup() -> (Arc<MemoryFirewall>, Reconciler) {
        let fw = Arc::new(MemoryFirewall::new());
        let reconciler = Reconciler::new(fw.clone());
        (fw, reconciler)
    }

    #[tokio::test]
    async fn test_add_then_list() {
        let (fw, reconciler) = setup();

        let outcome = reconciler.add(Accept::new("10.0.0.0/8", 22)).await.unwrap();
        assert_eq!(outcome, AddOutcome::Created);

        let snapshot = reconciler.list();
        assert_eq!(snapshot.accept_list[&22], vec![Accept::new("10.0.0.0/8", 22)]);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(fw.rules(TABLE, CHAIN), vec![Accept::new("10.0.0.0/8", 22).rule_args()]);
    }

    #[tokio::test]
    async fn test_add_existing_leaves_registry_unchanged() {
        let (fw, reconciler) = setup();
        let accept = Accept::new("10.0.0.0/8", 22);
        fw.seed(TABLE, CHAIN, &accept.rule_args());

        let before = reconciler.list().len();
        let outcome = reconciler.add(accept).await.unwrap();

        assert_eq!(outcome, AddOutcome::AlreadyExists);
        assert_eq!(reconciler.list().len(), before);
        assert_eq!(fw.calls().insert, 0);
        assert_eq!(fw.rules(TABLE, CHAIN).len(), 1);
    }

    #[tokio::test]
    async fn test_add_existing_adopts_when_enabled() {
        let (fw, reconciler) = setup();
        let reconciler = reconciler.with_options(ReconcilerOptions { adopt_existing: true });
        let accept = Accept::new("10.0.0.0/8", 22);
        fw.seed(TABLE, CHAIN, &accept.rule_args());

        assert_eq!(reconciler.add(accept.clone()).await.unwrap(), AddOutcome::AlreadyExists);
        assert_eq!(reconciler.add(accept).await.unwrap(), AddOutcome::AlreadyExists);
        assert_eq!(reconciler.list().len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_add_is_idempotent_in_kernel() {
        let (fw, reconciler) = setup();

        assert_eq!(reconciler.add(Accept::new("", 80)).await.unwrap(), AddOutcome::Created);
        assert_eq!(
            reconciler.add(Accept::new("", 80)).await.unwrap(),
            AddOutcome::AlreadyExists
        );
        assert_eq!(fw.rules(TABLE, CHAIN).len(), 1);
        assert_eq!(reconciler.list().len(), 1);
    }

    #[tokio::test]
    async fn test_add_gateway_failure_leaves_registry_unchanged() {
        let (fw, reconciler) = setup();

        fw.fail_next(GatewayOp::Exists);
        let err = reconciler.add(Accept::new("", 22)).await.unwrap_err();
        assert!(matches!(err, Error::Gateway(ref g) if g.op == GatewayOp::Exists));
        assert!(reconciler.list().is_empty());

        fw.fail_next(GatewayOp::Insert);
        let err = reconciler.add(Accept::new("", 22)).await.unwrap_err();
        assert!(matches!(err, Error::Gateway(ref g) if g.op == GatewayOp::Insert));
        assert!(reconciler.list().is_empty());
        assert!(fw.rules(TABLE, CHAIN).is_empty());
    }

    #[tokio::test]
    async fn test_new_rules_take_precedence() {
        let (fw, reconciler) = setup();
        reconciler.add(Accept::new("", 80)).await.unwrap();
        reconciler.add(Accept::new("", 443)).await.unwrap();

        let rules = fw.rules(TABLE, CHAIN);
        assert_eq!(rules[0], Accept::new("", 443).rule_args());
        assert_eq!(rules[1], Accept::new("", 80).rule_args());
    }

    #[tokio::test]
    async fn test_delete_never_added_makes_no_gateway_call() {
        let (fw, reconciler) = setup();

        let outcome = reconciler.delete(22, "10.0.0.0/8").await.unwrap();
        assert_eq!(outcome, DeleteOutcome::NotFound);
        assert_eq!(fw.calls().total(), 0);
    }

    #[tokio::test]
    async fn test_delete_heals_when_kernel_rule_gone() {
        let (fw, reconciler) = setup();
        let accept = Accept::new("10.0.0.0/8", 22);
        reconciler.add(accept.clone()).await.unwrap();

        fw.purge(TABLE, CHAIN, &accept.rule_args());

        let outcome = reconciler.delete(22, "10.0.0.0/8").await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Healed);
        assert!(outcome.is_not_found());
        assert!(!reconciler.list().contains(22, "10.0.0.0/8"));
        assert_eq!(fw.calls().delete, 0);
    }

    #[tokio::test]
    async fn test_delete_twice_yields_deleted_then_not_found() {
        let (_fw, reconciler) = setup();
        reconciler.add(Accept::new("10.0.0.0/8", 22)).await.unwrap();

        assert_eq!(
            reconciler.delete(22, "10.0.0.0/8").await.unwrap(),
            DeleteOutcome::Deleted
        );
        assert_eq!(
            reconciler.delete(22, "10.0.0.0/8").await.unwrap(),
            DeleteOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_delete_gateway_failure_leaves_registry_unchanged() {
        let (fw, reconciler) = setup();
        reconciler.add(Accept::new("", 22)).await.unwrap();

        fw.fail_next(GatewayOp::Delete);
        assert!(reconciler.delete(22, "").await.is_err());
        assert!(reconciler.list().contains(22, ""));
        assert_eq!(fw.rules(TABLE, CHAIN).len(), 1);

        fw.fail_next(GatewayOp::Exists);
        assert!(reconciler.delete(22, "").await.is_err());
        assert!(reconciler.list().contains(22, ""));
    }

    #[tokio::test]
    async fn test_delete_only_touches_matching_range() {
        let (fw, reconciler) = setup();
        reconciler.add(Accept::new("10.0.0.0/8", 22)).await.unwrap();
        reconciler.add(Accept::new("192.168.0.0/16", 22)).await.unwrap();

        reconciler.delete(22, "10.0.0.0/8").await.unwrap();

        let snapshot = reconciler.list();
        assert_eq!(snapshot.accept_list[&22], vec![Accept::new("192.168.0.0/16", 22)]);
        assert_eq!(fw.rules(TABLE, CHAIN), vec![Accept::new("192.168.0.0/16", 22).rule_args()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_add_delete_same_key_converges() {
        for _ in 0..20 {
            let fw = Arc::new(MemoryFirewall::new());
            fw.set_latency(Duration::from_millis(2));
            let reconciler = Arc::new(Reconciler::new(fw.clone()));

            let mut handles = Vec::new();
            for i in 0..6 {
                let reconciler = Arc::clone(&reconciler);
                handles.push(tokio::spawn(async move {
                    if i % 2 == 0 {
                        reconciler.add(Accept::new("10.0.0.0/8", 22)).await.map(|_| ())
                    } else {
                        reconciler.delete(22, "10.0.0.0/8").await.map(|_| ())
                    }
                }));
            }
            for handle in handles {
                handle.await.unwrap().unwrap();
            }

            let in_registry = reconciler.list().contains(22, "10.0.0.0/8");
            let rule = Accept::new("10.0.0.0/8", 22).rule_args();
            let in_kernel = fw.rules(TABLE, CHAIN).iter().filter(|r| **r == rule).count();

            assert!(in_kernel <= 1, "duplicate kernel rule");
            assert_eq!(in_registry, in_kernel == 1, "registry and kernel diverged");
            assert!(reconciler.list().len() <= 1, "duplicate registry entry");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_distinct_keys_proceed_concurrently() {
        let fw = Arc::new(MemoryFirewall::new());
        fw.set_latency(Duration::from_millis(50));
        let reconciler = Arc::new(Reconciler::new(fw.clone()));

        let started = std::time::Instant::now();
        let mut handles = Vec::new();
        for port in 1000..1008u16 {
            let reconciler = Arc::clone(&reconciler);
            handles.push(tokio::spawn(async move {
                reconciler.add(Accept::new("", port)).await.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), AddOutcome::Created);
        }

        // Two gateway calls of 50ms each per add; serialised would be 800ms
        assert!(started.elapsed() < Duration::from_millis(600));
        assert_eq!(reconciler.list().len(), 8);
    }

    #[tokio::test]
    async fn test_adopt_existing_rules() {
        let (fw, reconciler) = setup();
        fw.seed(TABLE, CHAIN, &Accept::new("10.0.0.0/8", 22).rule_args());
        fw.seed(TABLE, CHAIN, &Accept::new("", 443).rule_args());
        fw.seed(TABLE, CHAIN, &["-i".to_string(), "lo".to_string(), "-j".to_string(), "ACCEPT".to_string()]);

        assert_eq!(reconciler.adopt_existing_rules().await.unwrap(), 2);
        assert_eq!(reconciler.adopt_existing_rules().await.unwrap(), 0);

        let snapshot = reconciler.list();
        assert!(snapshot.contains(22, "10.0.0.0/8"));
        assert!(snapshot.contains(443, ""));

        // Adopted entries are deletable like any other
        assert_eq!(reconciler.delete(443, "").await.unwrap(), DeleteOutcome::Deleted);
    }

    #[tokio::test]
    async fn test_mutations_are_audited() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::at(dir.path().join("audit.log"));
        let fw = Arc::new(MemoryFirewall::new());
        let reconciler = Reconciler::new(fw.clone()).with_audit(audit.clone());

        reconciler.add(Accept::new("", 22)).await.unwrap();
        reconciler.delete(22, "").await.unwrap();

        let events = audit.read_recent(10).await.unwrap();
        let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![EventType::DeleteRule, EventType::InsertRule]);
        assert!(events.iter().all(|e| e.success));
    }
}
