//! Opaque TCP forwarder. Every accepted connection is piped to the fixed
//! target configured for the listener.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use super::pipe::pipe;
use crate::config::IpRule;
use crate::service::stats::StatsRegistry;

pub async fn serve(listener: TcpListener, rule: IpRule, stats: Arc<StatsRegistry>) {
    let IpRule { bind_addr, target } = rule;
    let rule_key = Arc::new(format!("tcp:{}->{}", bind_addr, target));
    let target = Arc::new(target);

    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("[tcp] failed to accept connection on {}: {}", bind_addr, e);
                continue;
            }
        };
        log::info!("[tcp] new conn from {}, {} -> {}", peer, bind_addr, target);

        let stats = Arc::clone(&stats);
        let rule_key = Arc::clone(&rule_key);
        let target = Arc::clone(&target);
        tokio::spawn(async move {
            let target_conn = match TcpStream::connect(target.as_str()).await {
                Ok(conn) => conn,
                Err(e) => {
                    log::error!("[tcp] failed to dial target {}: {}", target, e);
                    return;
                }
            };
            if let Err(e) = pipe(conn, target_conn, Some(&rule_key), &stats).await {
                log::warn!("[tcp] failed to pipe connection from {}: {}", peer, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn forwards_to_the_configured_target() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = backend.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            conn.write_all(b"world").await.unwrap();
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let stats = StatsRegistry::new();
        let rule = IpRule {
            bind_addr: proxy_addr.to_string(),
            target: backend_addr.to_string(),
        };
        let rule_key = format!("tcp:{}->{}", rule.bind_addr, rule.target);
        tokio::spawn(serve(listener, rule, Arc::clone(&stats)));

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"world");
        client.shutdown().await.unwrap();
        drop(client);

        // The pipe flushes residual bytes when the connection winds down.
        let mut observed = false;
        for _ in 0..50 {
            if let Some(rule) = stats.snapshot().rule_stats.get(&rule_key) {
                if rule.bytes_out == 5 && rule.bytes_in == 5 && rule.conn_count == 0 {
                    observed = true;
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(observed, "accounting never converged");
    }
}
