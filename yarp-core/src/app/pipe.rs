//! Bidirectional pipe with traffic accounting.
//!
//! [`pipe`] shuttles bytes between two stream endpoints until either
//! direction ends or fails, then closes both sides. When a rule key is
//! given, each direction is wrapped in a counting writer that folds byte
//! totals into the stats registry, and the logical connection count is
//! maintained for the duration of the pipe.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::service::stats::StatsRegistry;

/// Accumulated bytes are folded into the registry whenever a direction
/// crosses this threshold; the remainder is flushed when the pipe ends.
const FLUSH_THRESHOLD: u64 = 2 * 1024;

#[derive(Clone, Copy)]
enum Direction {
    /// target → client
    In,
    /// client → target
    Out,
}

/// Write-side byte accounting for one direction of a pipe. Flushes residual
/// bytes on drop, so accounting stays truthful when the direction is
/// cancelled mid-copy.
struct ByteTap<'a> {
    stats: &'a StatsRegistry,
    rule_key: &'a str,
    direction: Direction,
    pending: u64,
}

impl ByteTap<'_> {
    fn record(&mut self, n: usize) {
        self.pending += n as u64;
        if self.pending >= FLUSH_THRESHOLD {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.pending == 0 {
            return;
        }
        match self.direction {
            Direction::In => self.stats.add_bytes(self.rule_key, self.pending, 0),
            Direction::Out => self.stats.add_bytes(self.rule_key, 0, self.pending),
        }
        self.pending = 0;
    }
}

impl Drop for ByteTap<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}

/// `AsyncWrite` adapter that counts every successfully written byte.
struct CountingWriter<'a, W> {
    inner: W,
    tap: Option<ByteTap<'a>>,
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<'_, W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if let Some(tap) = this.tap.as_mut() {
                    tap.record(n);
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Keeps the logical connection count balanced even when the pipe future is
/// cancelled.
struct ConnGuard<'a> {
    stats: &'a StatsRegistry,
    rule_key: &'a str,
}

impl<'a> ConnGuard<'a> {
    fn new(stats: &'a StatsRegistry, rule_key: &'a str) -> Self {
        stats.add_conn(rule_key);
        ConnGuard { stats, rule_key }
    }
}

impl Drop for ConnGuard<'_> {
    fn drop(&mut self) {
        self.stats.remove_conn(self.rule_key);
    }
}

/// Transfers bytes between `client` and `target` in both directions until
/// either direction sees EOF or an error, then closes both endpoints and
/// returns the first observed error. Half-open forwarding is not supported.
pub async fn pipe<A, B>(
    client: A,
    target: B,
    rule_key: Option<&str>,
    stats: &StatsRegistry,
) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let _conn = rule_key.map(|key| ConnGuard::new(stats, key));

    let (mut client_rd, client_wr) = tokio::io::split(client);
    let (mut target_rd, target_wr) = tokio::io::split(target);

    let mut to_target = CountingWriter {
        inner: target_wr,
        tap: rule_key.map(|key| ByteTap {
            stats,
            rule_key: key,
            direction: Direction::Out,
            pending: 0,
        }),
    };
    let mut to_client = CountingWriter {
        inner: client_wr,
        tap: rule_key.map(|key| ByteTap {
            stats,
            rule_key: key,
            direction: Direction::In,
            pending: 0,
        }),
    };

    // Whichever direction finishes first wins; the other copy is cancelled
    // and every half is dropped on return, closing both endpoints.
    let result = tokio::select! {
        res = tokio::io::copy(&mut client_rd, &mut to_target) => res,
        res = tokio::io::copy(&mut target_rd, &mut to_client) => res,
    };

    result.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::stats::StatsRegistry;
    use std::sync::Arc;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn forwards_both_directions_and_accounts() {
        let stats = StatsRegistry::new();
        let (client_near, client_far) = duplex(16 * 1024);
        let (target_near, target_far) = duplex(16 * 1024);

        let pipe_stats = Arc::clone(&stats);
        let pipe_task =
            tokio::spawn(async move { pipe(client_far, target_near, Some("k"), &pipe_stats).await });

        let request: Vec<u8> = (0..1_048_576u32).map(|i| (i % 251) as u8).collect();
        let response: Vec<u8> = (0..524_288u32).map(|i| (i % 241) as u8).collect();

        let (mut client_rd, mut client_wr) = tokio::io::split(client_near);
        let (mut target_rd, mut target_wr) = tokio::io::split(target_far);

        let send = {
            let request = request.clone();
            tokio::spawn(async move {
                client_wr.write_all(&request).await.unwrap();
                client_wr
            })
        };

        // The backend consumes the full request before answering, so the
        // whole client->target flow completes before anything comes back.
        let backend = {
            let request = request.clone();
            let response = response.clone();
            tokio::spawn(async move {
                let mut seen = vec![0u8; request.len()];
                target_rd.read_exact(&mut seen).await.unwrap();
                assert_eq!(seen, request);
                target_wr.write_all(&response).await.unwrap();
                target_wr.shutdown().await.unwrap();
            })
        };

        let mut answered = Vec::new();
        client_rd.read_to_end(&mut answered).await.unwrap();
        assert_eq!(answered, response);

        send.await.unwrap();
        backend.await.unwrap();
        pipe_task.await.unwrap().unwrap();

        let snapshot = stats.snapshot();
        let k = &snapshot.rule_stats["k"];
        assert_eq!(k.bytes_out, 1_048_576);
        assert_eq!(k.bytes_in, 524_288);
        assert_eq!(k.conn_count, 0);
    }

    #[tokio::test]
    async fn client_eof_closes_the_target_side() {
        let stats = StatsRegistry::new();
        let (client_near, client_far) = duplex(1024);
        let (target_near, target_far) = duplex(1024);

        let pipe_stats = Arc::clone(&stats);
        let pipe_task =
            tokio::spawn(async move { pipe(client_far, target_near, None, &pipe_stats).await });

        // Closing the client write side ends the client->target flow; the
        // pipe must tear the target down with it.
        drop(client_near);
        pipe_task.await.unwrap().unwrap();

        let (mut target_rd, _target_wr) = tokio::io::split(target_far);
        let mut rest = Vec::new();
        target_rd.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn small_transfers_flush_residual_bytes() {
        let stats = StatsRegistry::new();
        let (client_near, client_far) = duplex(1024);
        let (target_near, target_far) = duplex(1024);

        let pipe_stats = Arc::clone(&stats);
        let pipe_task =
            tokio::spawn(async move { pipe(client_far, target_near, Some("r"), &pipe_stats).await });

        let (_client_rd, mut client_wr) = tokio::io::split(client_near);
        let (mut target_rd, _target_wr) = tokio::io::split(target_far);

        // Well below the flush threshold; only the end-of-pipe flush can
        // account for it.
        client_wr.write_all(b"ping").await.unwrap();
        let mut seen = [0u8; 4];
        target_rd.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen, b"ping");

        client_wr.shutdown().await.unwrap();
        pipe_task.await.unwrap().unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.rule_stats["r"].bytes_out, 4);
        assert_eq!(snapshot.rule_stats["r"].conn_count, 0);
    }
}
