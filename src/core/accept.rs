//! Whitelist entries and their iptables rule encoding
//!
//! An [`Accept`] names one TCP source range allowed to reach one destination
//! port. [`Accept::rule_args`] renders it as the argument sequence handed to
//! the packet-filter tool; [`parse_rule_spec`] reads one line of
//! `iptables -S` output back into an [`Accept`] for startup adoption.
//!
//! # Example
//!
//! ```
//! use wlfw::core::accept::Accept;
//!
//! let accept = Accept::new("10.0.0.0/8", 22);
//! assert_eq!(
//!     accept.rule_args(),
//!     ["-p", "tcp", "-s", "10.0.0.0/8", "--dport", "22", "-j", "ACCEPT"]
//! );
//! ```

use serde::{Deserialize, Serialize};

/// Packet-filter table every rule lives in
pub const TABLE: &str = "filter";

/// Chain every rule lives in
pub const CHAIN: &str = "INPUT";

/// New rules always take precedence over existing ones
pub const INSERT_POSITION: u32 = 1;

/// One whitelist entry: TCP traffic from `source_ip_range` to `dest_port`.
///
/// An empty `source_ip_range` means "any source". Identity is the pair
/// `(dest_port, source_ip_range)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Accept {
    #[serde(rename = "sourceIPRange", default)]
    pub source_ip_range: String,
    #[serde(rename = "destPort")]
    pub dest_port: u16,
}

impl Accept {
    pub fn new(source_ip_range: impl Into<String>, dest_port: u16) -> Self {
        Self {
            source_ip_range: source_ip_range.into(),
            dest_port,
        }
    }

    /// Lock/identity key for this entry
    pub fn key(&self) -> (u16, String) {
        (self.dest_port, self.source_ip_range.clone())
    }

    /// Renders the rule exactly as the gateway passes it to the tool.
    ///
    /// iptables matches rules for `-C`/`-D` by the argument sequence, so the
    /// order here must never change between insert, check and delete.
    pub fn rule_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(8);
        args.extend(["-p".to_string(), "tcp".to_string()]);

        if !self.source_ip_range.is_empty() {
            args.extend(["-s".to_string(), self.source_ip_range.clone()]);
        }

        args.extend([
            "--dport".to_string(),
            self.dest_port.to_string(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ]);
        args
    }
}

/// Parses one `iptables -S <chain>` line into an [`Accept`].
///
/// Only plain TCP ACCEPT rules with a single destination port and an optional
/// source are recognised. Anything carrying extra matches, negations, port
/// ranges, interfaces or another target yields `None`, since adopting such a
/// rule would misrepresent what it allows.
pub fn parse_rule_spec(line: &str, chain: &str) -> Option<Accept> {
    let mut tokens = line.split_whitespace();

    if tokens.next()? != "-A" || tokens.next()? != chain {
        return None;
    }

    let mut protocol = None;
    let mut source = String::new();
    let mut port = None;
    let mut target = None;

    while let Some(flag) = tokens.next() {
        match flag {
            "-p" | "--protocol" => protocol = Some(tokens.next()?),
            "-s" | "--source" => source = tokens.next()?.to_string(),
            "--dport" | "--destination-port" => port = Some(tokens.next()?.parse::<u16>().ok()?),
            "-j" | "--jump" => target = Some(tokens.next()?),
            // `iptables -S` spells out the implicit tcp match module
            "-m" | "--match" => {
                if tokens.next()? != "tcp" {
                    return None;
                }
            }
            _ => return None,
        }
    }

    match (protocol, port, target) {
        (Some("tcp"), Some(dest_port), Some("ACCEPT")) if dest_port != 0 => {
            Some(Accept::new(source, dest_port))
        }
        _ => None,
    }
}
