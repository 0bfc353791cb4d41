//! UDP session engine.
//!
//! One listener owns a single unconnected datagram socket and demultiplexes
//! it into per-client sessions. Each session dials its own socket toward the
//! target and runs two tasks: egress (client → target, fed by a bounded
//! queue) and ingress (target → client, written back through the shared
//! listener socket). Accounting is coalesced per session and folded into the
//! stats registry by a periodic maintenance pass, which also expires idle
//! sessions.
//!
//! Lock discipline: the sessions map and each session's pending counters
//! have their own locks, and neither is ever held across an await point.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::IpRule;
use crate::service::stats::StatsRegistry;

/// Datagram receive buffer, large enough for any UDP payload.
const RECV_BUFFER: usize = 64 * 1024;

/// Outbound packet queue per session. When full, packets are dropped the
/// way a congested UDP path would drop them.
const QUEUE_CAPACITY: usize = 256;

/// Pending bytes are folded into the registry as soon as either direction
/// accumulates this much; the maintenance pass picks up the rest.
const PENDING_FLUSH: u64 = 16 * 1024;

/// Cadence of the maintenance task.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Idle expiry runs on every Nth maintenance tick.
const CLEANUP_EVERY_TICKS: u32 = 30;

/// Sessions without traffic in either direction for this long are expired.
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Default)]
struct Pending {
    bytes_in: u64,
    bytes_out: u64,
}

/// One virtual circuit between a client endpoint and the target.
struct UdpSession {
    client_addr: SocketAddr,
    target: Arc<UdpSocket>,
    queue: mpsc::Sender<Vec<u8>>,
    pending: Mutex<Pending>,
    /// Milliseconds since the engine's epoch.
    last_active_ms: AtomicU64,
    closed_tx: watch::Sender<bool>,
}

impl UdpSession {
    fn touch(&self, epoch: Instant) {
        self.last_active_ms
            .store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle(&self, epoch: Instant) -> Duration {
        let now = epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_active_ms.load(Ordering::Relaxed)))
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Terminal; repeated calls are no-ops. Both companion tasks observe the
    /// signal and return, which drops the target socket.
    fn close(&self) {
        self.closed_tx.send_replace(true);
    }

    /// Adds to the session-local pending counters. Returns the amounts to
    /// fold into the registry when a direction crossed the flush threshold,
    /// so the registry call happens outside the session lock.
    fn add_pending(&self, bytes_in: u64, bytes_out: u64) -> Option<(u64, u64)> {
        let mut pending = self.pending.lock();
        pending.bytes_in += bytes_in;
        pending.bytes_out += bytes_out;
        if pending.bytes_in >= PENDING_FLUSH || pending.bytes_out >= PENDING_FLUSH {
            let taken = (pending.bytes_in, pending.bytes_out);
            pending.bytes_in = 0;
            pending.bytes_out = 0;
            Some(taken)
        } else {
            None
        }
    }

    fn take_pending(&self) -> (u64, u64) {
        let mut pending = self.pending.lock();
        let taken = (pending.bytes_in, pending.bytes_out);
        pending.bytes_in = 0;
        pending.bytes_out = 0;
        taken
    }
}

struct UdpEngine {
    listener: Arc<UdpSocket>,
    rule_key: String,
    target_addr: String,
    sessions: Mutex<HashMap<SocketAddr, Arc<UdpSession>>>,
    stats: Arc<StatsRegistry>,
    epoch: Instant,
}

/// Runs one UDP forwarding rule: reader loop plus maintenance task.
pub async fn serve(socket: UdpSocket, rule: IpRule, stats: Arc<StatsRegistry>) {
    let engine = UdpEngine::new(socket, rule, stats);
    tokio::spawn(maintenance(Arc::clone(&engine)));
    reader_loop(engine).await;
}

impl UdpEngine {
    fn new(socket: UdpSocket, rule: IpRule, stats: Arc<StatsRegistry>) -> Arc<Self> {
        Arc::new(UdpEngine {
            listener: Arc::new(socket),
            rule_key: format!("udp:{}->{}", rule.bind_addr, rule.target),
            target_addr: rule.target,
            sessions: Mutex::new(HashMap::new()),
            stats,
            epoch: Instant::now(),
        })
    }

    /// 1 s pass: folds pending bytes into the registry in one shot, refreshes
    /// the active-peer count and drops sessions that closed since last time.
    fn flush_pass(&self) {
        let mut total_in = 0u64;
        let mut total_out = 0u64;
        let mut active = 0i32;
        {
            let mut sessions = self.sessions.lock();
            sessions.retain(|_, session| {
                let (pending_in, pending_out) = session.take_pending();
                total_in += pending_in;
                total_out += pending_out;
                if session.idle(self.epoch) <= IDLE_TIMEOUT {
                    active += 1;
                }
                !session.is_closed()
            });
        }
        if total_in > 0 || total_out > 0 {
            self.stats.add_bytes(&self.rule_key, total_in, total_out);
        }
        self.stats.set_conns(&self.rule_key, active);
    }

    /// 30 s pass: expires sessions idle past the timeout, flushing their
    /// residual bytes on the way out.
    fn cleanup_pass(&self) {
        let mut total_in = 0u64;
        let mut total_out = 0u64;
        let mut expired = Vec::new();
        {
            let mut sessions = self.sessions.lock();
            sessions.retain(|_, session| {
                if session.idle(self.epoch) > IDLE_TIMEOUT {
                    let (pending_in, pending_out) = session.take_pending();
                    total_in += pending_in;
                    total_out += pending_out;
                    expired.push(Arc::clone(session));
                    false
                } else {
                    true
                }
            });
        }
        for session in expired {
            log::info!(
                "[udp] session {} on {} expired after {}s idle",
                session.client_addr,
                self.rule_key,
                IDLE_TIMEOUT.as_secs()
            );
            session.close();
        }
        if total_in > 0 || total_out > 0 {
            self.stats.add_bytes(&self.rule_key, total_in, total_out);
        }
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

async fn maintenance(engine: Arc<UdpEngine>) {
    let mut interval = time::interval(FLUSH_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tick = 0u32;
    loop {
        interval.tick().await;
        tick = tick.wrapping_add(1);
        engine.flush_pass();
        if tick % CLEANUP_EVERY_TICKS == 0 {
            engine.cleanup_pass();
        }
    }
}

/// Single owner of the listener socket's receive side.
async fn reader_loop(engine: Arc<UdpEngine>) {
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        let (len, peer) = match engine.listener.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("[udp] read error on {}: {}", engine.rule_key, e);
                continue;
            }
        };
        let packet = buf[..len].to_vec();

        let session = {
            let sessions = engine.sessions.lock();
            sessions.get(&peer).filter(|s| !s.is_closed()).cloned()
        };
        let session = match session {
            Some(session) => session,
            // First packet from this client (or its old session closed):
            // dial a fresh circuit. On dial failure the packet is dropped
            // and no session exists.
            None => match open_session(&engine, peer).await {
                Ok(session) => session,
                Err(e) => {
                    log::error!(
                        "[udp] failed to dial target {}: {}",
                        engine.target_addr,
                        e
                    );
                    continue;
                }
            },
        };

        session.touch(engine.epoch);
        match session.queue.try_send(packet) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(packet)) => {
                // Dropped, but it is still client traffic the proxy saw;
                // keeping it in pendingOut makes the drop visible as drift.
                if let Some((flush_in, flush_out)) =
                    session.add_pending(0, packet.len() as u64)
                {
                    engine.stats.add_bytes(&engine.rule_key, flush_in, flush_out);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

async fn open_session(
    engine: &Arc<UdpEngine>,
    peer: SocketAddr,
) -> std::io::Result<Arc<UdpSession>> {
    let target_addr = tokio::net::lookup_host(&engine.target_addr)
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "target resolved to no address",
            )
        })?;
    let local: SocketAddr = if target_addr.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    };
    let target = UdpSocket::bind(local).await?;
    target.connect(target_addr).await?;

    let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
    let (closed_tx, closed_rx) = watch::channel(false);
    let session = Arc::new(UdpSession {
        client_addr: peer,
        target: Arc::new(target),
        queue: queue_tx,
        pending: Mutex::new(Pending::default()),
        last_active_ms: AtomicU64::new(engine.epoch.elapsed().as_millis() as u64),
        closed_tx,
    });

    log::info!("[udp] new session from {} on {}", peer, engine.rule_key);
    engine
        .sessions
        .lock()
        .insert(peer, Arc::clone(&session));

    tokio::spawn(egress(
        Arc::clone(engine),
        Arc::clone(&session),
        queue_rx,
        closed_rx.clone(),
    ));
    tokio::spawn(ingress(Arc::clone(engine), Arc::clone(&session), closed_rx));

    Ok(session)
}

/// Drains the write queue toward the target, in order. A write error closes
/// the session.
async fn egress(
    engine: Arc<UdpEngine>,
    session: Arc<UdpSession>,
    mut queue: mpsc::Receiver<Vec<u8>>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let packet = tokio::select! {
            _ = closed.changed() => break,
            packet = queue.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        match session.target.send(&packet).await {
            Ok(written) => {
                if let Some((flush_in, flush_out)) = session.add_pending(0, written as u64) {
                    engine.stats.add_bytes(&engine.rule_key, flush_in, flush_out);
                }
                session.touch(engine.epoch);
            }
            Err(e) => {
                log::warn!(
                    "[udp] write to target failed for {}: {}",
                    session.client_addr,
                    e
                );
                session.close();
                break;
            }
        }
    }
}

/// Forwards target responses back to the client through the shared listener
/// socket. A read error closes the session.
async fn ingress(
    engine: Arc<UdpEngine>,
    session: Arc<UdpSession>,
    mut closed: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        let len = tokio::select! {
            _ = closed.changed() => break,
            res = session.target.recv(&mut buf) => match res {
                Ok(len) => len,
                Err(e) => {
                    log::debug!(
                        "[udp] read from target failed for {}: {}",
                        session.client_addr,
                        e
                    );
                    session.close();
                    break;
                }
            },
        };
        if let Err(e) = engine
            .listener
            .send_to(&buf[..len], session.client_addr)
            .await
        {
            log::debug!(
                "[udp] write to client {} failed: {}",
                session.client_addr,
                e
            );
            session.close();
            break;
        }
        if let Some((flush_in, flush_out)) = session.add_pending(len as u64, 0) {
            engine.stats.add_bytes(&engine.rule_key, flush_in, flush_out);
        }
        session.touch(engine.epoch);
    }
}
