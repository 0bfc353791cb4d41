//! HTTPS listener: sniff the ClientHello SNI, pick a target from the rule
//! table and pipe the connection through untouched. TLS is never terminated
//! here; the handshake happens end-to-end between client and backend.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use super::pipe::pipe;
use super::proxy_sni::sniff_sni;
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
                    "[https] failed to accept connection on {}: {}",
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
                log::warn!("[https] conn from {} dropped: {}", peer, e);
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
    let (conn, sni) = sniff_sni(conn).await?;
    let target = resolve_target(&sni, rules)?;
    log::info!("[https] new conn from {}, {} -> {}", peer, sni, target);

    let target_conn = TcpStream::connect(&target)
        .await
        .map_err(|source| ProxyError::Dial {
            target: target.clone(),
            source,
        })?;

    let rule_key = format!("https:{}->{}", sni, target);
    pipe(conn, target_conn, Some(&rule_key), stats).await?;
    Ok(())
}
