//! In-memory whitelist registry
//!
//! Maps destination port to the accepted source ranges for that port, in
//! insertion order. This is the service's belief about desired state; the
//! kernel table stays authoritative. The registry is not synchronised on its
//! own: the reconciler owns it behind a mutex.

use crate::core::accept::Accept;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Point-in-time copy of the registry, serialised as `{"list": {...}}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(rename = "list")]
    pub accept_list: BTreeMap<u16, Vec<Accept>>,
}

impl RegistrySnapshot {
    /// Total number of entries across all ports
    pub fn len(&self) -> usize {
        self.accept_list.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, dest_port: u16, source_ip_range: &str) -> bool {
        self.accept_list
            .get(&dest_port)
            .is_some_and(|list| list.iter().any(|a| a.source_ip_range == source_ip_range))
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    accept_list: BTreeMap<u16, Vec<Accept>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list_all(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            accept_list: self.accept_list.clone(),
        }
    }

    pub fn append(&mut self, accept: Accept) {
        self.accept_list
            .entry(accept.dest_port)
            .or_default()
            .push(accept);
    }

    pub fn find(&self, dest_port: u16, source_ip_range: &str) -> Option<&Accept> {
        self.accept_list
            .get(&dest_port)?
            .iter()
            .find(|a| a.source_ip_range == source_ip_range)
    }

    pub fn contains(&self, dest_port: u16, source_ip_range: &str) -> bool {
        self.find(dest_port, source_ip_range).is_some()
    }

    /// Removes the first entry for `dest_port` matching `source_ip_range`.
    ///
    /// The port key stays in place even when its list becomes empty.
    pub fn remove(&mut self, dest_port: u16, source_ip_range: &str) -> Option<Accept> {
        let list = self.accept_list.get_mut(&dest_port)?;
        let index = list
            .iter()
            .position(|a| a.source_ip_range == source_ip_range)?;
        Some(list.remove(index))
    }

    pub fn len(&self) -> usize {
        self.accept_list.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
