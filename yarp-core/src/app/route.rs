//! Host-to-target routing.
//!
//! Rules are consulted in declaration order; the first match wins. A
//! pattern starting with `*` matches any host ending in the remaining
//! suffix, anything else must match exactly. Candidate hosts may arrive in
//! `host:port` form; the port is ignored for matching.

use thiserror::Error;

use crate::config::HostRule;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no host found")]
    NoHost,

    #[error("invalid host rule: {0}")]
    InvalidRule(String),
}

/// Returns the target of the first rule matching `host_port`.
pub fn resolve_target(host_port: &str, rules: &[HostRule]) -> Result<String, RouteError> {
    let host = strip_port(host_port);

    for rule in rules {
        if rule.host.is_empty() || rule.target.is_empty() {
            return Err(RouteError::InvalidRule(
                "host or target host are empty".to_string(),
            ));
        }
        if let Some(suffix) = rule.host.strip_prefix('*') {
            if suffix.is_empty() {
                return Err(RouteError::InvalidRule(format!(
                    "invalid host pattern {:?}",
                    rule.host
                )));
            }
            if host.ends_with(suffix) {
                return Ok(rule.target.clone());
            }
        } else if host == rule.host {
            return Ok(rule.target.clone());
        }
    }

    Err(RouteError::NoHost)
}

/// Drops a trailing `:port` when one is present. Bracketed IPv6 literals
/// keep their address; bare IPv6 literals (more than one colon) are passed
/// through untouched.
fn strip_port(host_port: &str) -> &str {
    if let Some(rest) = host_port.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match host_port.rfind(':') {
        Some(idx) if !host_port[..idx].contains(':') => &host_port[..idx],
        _ => host_port,
    }
}
