//! Configuration model for the proxy.
//!
//! The configuration is loaded once from a TOML file and handed to the rest
//! of the system as an immutable value. Absent top-level sections disable
//! the corresponding listener. Key names follow the config file format
//! (`bindAddr`, `httpUser`, ...), mapped onto Rust field names with serde
//! renames.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Top-level configuration. Every section is optional; whatever is present
/// starts concurrently at boot.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct YarpConfig {
    #[serde(default)]
    pub tcp: Option<Vec<IpRule>>,

    #[serde(default)]
    pub udp: Option<Vec<IpRule>>,

    #[serde(default)]
    pub http: Option<HttpConfig>,

    #[serde(default)]
    pub https: Option<HttpConfig>,

    #[serde(default)]
    pub dashboard: Option<DashboardConfig>,
}

/// One opaque forwarding rule: everything accepted on `bind_addr` goes to
/// `target`.
#[derive(Debug, Clone, Deserialize)]
pub struct IpRule {
    #[serde(rename = "bindAddr")]
    pub bind_addr: String,

    pub target: String,
}

/// A host-routing listener (HTTP or HTTPS) with its rule table.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(rename = "bindAddr")]
    pub bind_addr: String,

    pub rules: Vec<HostRule>,
}

/// One host-routing rule. `host` is either a literal hostname or a
/// `*suffix` wildcard; rules are consulted in declaration order and the
/// first match wins.
#[derive(Debug, Clone, Deserialize)]
pub struct HostRule {
    pub host: String,
    pub target: String,
}

/// Dashboard endpoint. Basic auth is enabled iff both `httpUser` and
/// `httpPassword` are non-empty.
#[derive(Debug, Clone, Deserialize)]
pub struct DashboardConfig {
    #[serde(rename = "bindAddr")]
    pub bind_addr: String,

    #[serde(rename = "httpUser", default)]
    pub http_user: String,

    #[serde(rename = "httpPassword", default)]
    pub http_password: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("couldn't read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("couldn't parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    InvalidRule(String),
}

/// Reads and validates the configuration file.
pub fn load(path: &Path) -> Result<YarpConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let config: YarpConfig = toml::from_str(&raw)?;
    config.validate()?;
    Ok(config)
}

impl YarpConfig {
    /// Rejects rules that would otherwise only fail on their first use:
    /// empty endpoints, empty hosts or targets, and bare `*` wildcards.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (proto, rules) in [("tcp", &self.tcp), ("udp", &self.udp)] {
            for rule in rules.iter().flatten() {
                if rule.bind_addr.is_empty() || rule.target.is_empty() {
                    return Err(ConfigError::InvalidRule(format!(
                        "{} rule with empty bindAddr or target",
                        proto
                    )));
                }
            }
        }

        for (proto, listener) in [("http", &self.http), ("https", &self.https)] {
            if let Some(listener) = listener {
                if listener.bind_addr.is_empty() {
                    return Err(ConfigError::InvalidRule(format!(
                        "{} listener with empty bindAddr",
                        proto
                    )));
                }
                for rule in &listener.rules {
                    if rule.host.is_empty() || rule.target.is_empty() {
                        return Err(ConfigError::InvalidRule(format!(
                            "{} rule with empty host or target",
                            proto
                        )));
                    }
                    if rule.host.starts_with('*') && rule.host.len() < 2 {
                        return Err(ConfigError::InvalidRule(format!(
                            "invalid host pattern {:?}",
                            rule.host
                        )));
                    }
                }
            }
        }

        if let Some(dashboard) = &self.dashboard {
            if dashboard.bind_addr.is_empty() {
                return Err(ConfigError::InvalidRule(
                    "dashboard with empty bindAddr".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let raw = r#"
            [[tcp]]
            bindAddr = "0.0.0.0:9000"
            target   = "10.0.0.1:9000"

            [[udp]]
            bindAddr = "0.0.0.0:5353"
            target   = "1.1.1.1:53"

            [http]
            bindAddr = "0.0.0.0:80"
            rules = [
                { host = "a.example", target = "10.0.0.2:8080" },
                { host = "*.example", target = "10.0.0.3:8080" },
            ]

            [dashboard]
            bindAddr     = "127.0.0.1:8080"
            httpUser     = "admin"
            httpPassword = "secret"
        "#;
        let config: YarpConfig = toml::from_str(raw).unwrap();
        config.validate().unwrap();

        assert_eq!(config.tcp.as_ref().unwrap().len(), 1);
        assert_eq!(config.tcp.as_ref().unwrap()[0].bind_addr, "0.0.0.0:9000");
        assert_eq!(config.udp.as_ref().unwrap()[0].target, "1.1.1.1:53");
        let http = config.http.as_ref().unwrap();
        assert_eq!(http.rules[1].host, "*.example");
        assert!(config.https.is_none());
        assert_eq!(config.dashboard.as_ref().unwrap().http_user, "admin");
    }

    #[test]
    fn absent_sections_disable_listeners() {
        let config: YarpConfig = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert!(config.tcp.is_none());
        assert!(config.udp.is_none());
        assert!(config.http.is_none());
        assert!(config.https.is_none());
        assert!(config.dashboard.is_none());
    }

    #[test]
    fn rejects_empty_target() {
        let raw = r#"
            [[tcp]]
            bindAddr = "0.0.0.0:9000"
            target   = ""
        "#;
        let config: YarpConfig = toml::from_str(raw).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRule(_))
        ));
    }

    #[test]
    fn rejects_bare_wildcard() {
        let raw = r#"
            [http]
            bindAddr = "0.0.0.0:80"
            rules = [ { host = "*", target = "10.0.0.2:8080" } ]
        "#;
        let config: YarpConfig = toml::from_str(raw).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRule(_))
        ));
    }
}
