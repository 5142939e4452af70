//! Input validation for WLFW
//!
//! Every value that ends up on the iptables command line passes through here
//! first. Arguments are never run through a shell, but a value starting with
//! `-` would still be read by iptables as an option, so source ranges are
//! checked strictly.

use crate::core::accept::Accept;
use crate::core::error::{Error, Result};
use ipnetwork::IpNetwork;

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16> {
    if port == 0 {
        Err(Error::validation("destPort", "Port must be between 1 and 65535"))
    } else {
        Ok(port)
    }
}

/// Parses a destination port taken from a URL path segment.
///
/// # Errors
///
/// Returns `Err` if the segment is not all ASCII digits or not in 1..=65535.
pub fn parse_port_param(raw: &str) -> Result<u16> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::validation("destPort", format!("'{raw}' is not a port number")));
    }
    let port = raw
        .parse::<u16>()
        .map_err(|_| Error::validation("destPort", format!("'{raw}' is not a port number")))?;
    validate_port(port)
}

/// Validates a source range.
///
/// Empty means "any source". Anything else must be an IPv4 address or CIDR
/// network. The original spelling is kept: iptables matches rules by
/// exact argument text, so normalising here would change rule identity.
///
/// # Examples
///
/// ```
/// use wlfw::validators::validate_source_range;
///
/// assert!(validate_source_range("").is_ok());
/// assert!(validate_source_range("10.0.0.0/8").is_ok());
/// assert!(validate_source_range("2001:db8::/32").is_err());
/// assert!(validate_source_range("-j DROP").is_err());
/// ```
///
/// # Errors
///
/// Returns `Err` if the range contains whitespace, control characters or a
/// leading `-`, or does not parse as an IPv4 network.
pub fn validate_source_range(input: &str) -> Result<&str> {
    if input.is_empty() {
        return Ok(input);
    }

    if input.len() > 64 {
        return Err(Error::validation("sourceIPRange", "Source range too long"));
    }

    if input.starts_with('-') || input.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::validation(
            "sourceIPRange",
            "Source range contains invalid characters",
        ));
    }

    let network = input.parse::<IpNetwork>().map_err(|e| {
        Error::validation("sourceIPRange", format!("'{input}' is not an IP network: {e}"))
    })?;

    // Rules go through the IPv4 `iptables` binary, which cannot take v6 sources
    if network.is_ipv6() {
        return Err(Error::validation(
            "sourceIPRange",
            format!("'{input}' is an IPv6 network; only IPv4 sources are supported"),
        ));
    }

    Ok(input)
}

/// Validates a decoded whitelist entry before any gateway call is made.
///
/// # Errors
///
/// Returns the first field that fails validation.
pub fn validate_accept(accept: &Accept) -> Result<()> {
    validate_port(accept.dest_port)?;
    validate_source_range(&accept.source_ip_range)?;
    Ok(())
}
