//! Binds every configured endpoint and spawns its serving task.
//!
//! Binding happens up front so that an unusable endpoint fails the whole
//! startup; once a listener is bound, its accept/read loop runs forever and
//! handles its own transient errors.

use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinSet;

use crate::app::{http, https, tcp, udp};
use crate::config::YarpConfig;
use crate::service::stats::StatsRegistry;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

/// Binds and spawns every listener present in `config`. Returns as soon as
/// all sockets are bound; the spawned tasks never finish on their own.
pub async fn spawn_all(
    config: &YarpConfig,
    stats: &Arc<StatsRegistry>,
    tasks: &mut JoinSet<()>,
) -> Result<(), StartError> {
    if let Some(rules) = &config.tcp {
        for rule in rules {
            let listener = bind_tcp(&rule.bind_addr).await?;
            log::info!("starting tcp proxy on {}", rule.bind_addr);
            tasks.spawn(tcp::serve(listener, rule.clone(), Arc::clone(stats)));
        }
    }

    if let Some(rules) = &config.udp {
        for rule in rules {
            let socket = UdpSocket::bind(&rule.bind_addr)
                .await
                .map_err(|source| StartError::Bind {
                    addr: rule.bind_addr.clone(),
                    source,
                })?;
            log::info!("starting udp proxy on {}", rule.bind_addr);
            tasks.spawn(udp::serve(socket, rule.clone(), Arc::clone(stats)));
        }
    }

    if let Some(cfg) = &config.http {
        let listener = bind_tcp(&cfg.bind_addr).await?;
        log::info!("starting http proxy on {}", cfg.bind_addr);
        tasks.spawn(http::serve(listener, cfg.clone(), Arc::clone(stats)));
    }

    if let Some(cfg) = &config.https {
        let listener = bind_tcp(&cfg.bind_addr).await?;
        log::info!("starting https proxy on {}", cfg.bind_addr);
        tasks.spawn(https::serve(listener, cfg.clone(), Arc::clone(stats)));
    }

    Ok(())
}

async fn bind_tcp(addr: &str) -> Result<TcpListener, StartError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| StartError::Bind {
            addr: addr.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpRule;

    #[tokio::test]
    async fn bind_failure_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let config = YarpConfig {
            tcp: Some(vec![IpRule {
                bind_addr: addr.to_string(),
                target: "127.0.0.1:1".to_string(),
            }]),
            ..Default::default()
        };

        let stats = StatsRegistry::new();
        let mut tasks = JoinSet::new();
        let result = spawn_all(&config, &stats, &mut tasks).await;
        assert!(matches!(result, Err(StartError::Bind { .. })));
    }

    #[tokio::test]
    async fn empty_config_spawns_nothing() {
        let stats = StatsRegistry::new();
        let mut tasks = JoinSet::new();
        spawn_all(&YarpConfig::default(), &stats, &mut tasks)
            .await
            .unwrap();
        assert!(tasks.is_empty());
    }
}
