//! HTTP listener: sniff the Host header, pick a target from the rule table,
//! replay the request bytes and pipe the rest of the connection through.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use super::pipe::pipe;
use super::proxy_host::sniff_host;
use super::rewind::RewindStream;
use super::route::resolve_target;
use super::ProxyError;
use crate::config::{HostRule, HttpConfig};
use crate::service::stats::StatsRegistry;

pub async fn serve(listener: TcpListener, cfg: HttpConfig, stats: Arc<StatsRegistry>) {
    let rules = Arc::new(cfg.rules);

    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::error!(
                    "[http] failed to accept connection on {}: {}",
                    cfg.bind_addr,
                    e
                );
                continue;
            }
        };
        let rules = Arc::clone(&rules);
        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            if let Err(e) = handle(conn, peer, &rules, &stats).await {
                log::warn!("[http] conn from {} dropped: {}", peer, e);
            }
        });
    }
}

async fn handle(
    conn: TcpStream,
    peer: SocketAddr,
    rules: &[HostRule],
    stats: &StatsRegistry,
) -> Result<(), ProxyError> {
    let mut conn = RewindStream::new(conn);
    let host = sniff_host(&mut conn).await?;
    let target = resolve_target(&host, rules)?;
    log::info!("[http] new conn from {}, {} -> {}", peer, host, target);

    let target_conn = TcpStream::connect(&target)
        .await
        .map_err(|source| ProxyError::Dial {
            target: target.clone(),
            source,
        })?;

    let rule_key = format!("http:{}->{}", host, target);
    pipe(conn, target_conn, Some(&rule_key), stats).await?;
    Ok(())
}
