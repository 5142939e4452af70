//! WLFW - Whitelist Firewall
//!
//! An HTTP service that manages a whitelist of iptables ACCEPT rules.
//!
//! # Architecture
//!
//! - [`core`] - Rule codec, firewall gateway, whitelist registry and the reconciler
//! - [`api`] - HTTP routes mapping reconciler outcomes to status codes
//! - [`audit`] - Audit logging for every kernel mutation
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Configuration persistence
//! - [`elevation`] - Running iptables with enough privilege
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Safety Features
//!
//! - Kernel first, registry second: a failed iptables call never changes the registry
//! - Per-entry locking so concurrent requests on one rule are serialized
//! - Bounded iptables invocations (timeout, `-w` for the xtables lock)
//! - Input validation before anything reaches the command line
//! - Atomic config writes with secure permissions

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod api;
pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::accept::Accept;
pub use core::error::{Error, Result};
pub use core::reconciler::Reconciler;
