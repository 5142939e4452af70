//! Core whitelist management functionality
//!
//! This module contains the types and logic that keep the declared whitelist
//! and the kernel's iptables rule table in step:
//!
//! - [`accept`]: Whitelist entries and their iptables argument encoding
//! - [`gateway`]: The packet-filter boundary and its iptables implementation
//! - [`memory`]: In-memory packet-filter backend for tests and dry runs
//! - [`registry`]: In-memory map of declared entries, keyed by port
//! - [`locks`]: Per-key mutual exclusion
//! - [`reconciler`]: Add/delete flows, including registry self-healing
//! - [`error`]: Error types for firewall operations

pub mod accept;
pub mod error;
pub mod gateway;
pub mod locks;
pub mod memory;
pub mod reconciler;
pub mod registry;

#[cfg(test)]
pub mod test_helpers;
