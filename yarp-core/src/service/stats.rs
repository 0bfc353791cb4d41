//! Per-rule traffic accounting.
//!
//! Every traffic class is identified by a rule key, a stable string of the
//! form `<proto>:<bindAddr>-><target>` (TCP/UDP) or
//! `<proto>:<host>-><target>` (HTTP/HTTPS). The registry maps rule keys to
//! counters and produces consistent snapshots for the dashboard.
//!
//! Lock discipline: the key map sits behind a reader/writer lock, while the
//! counters themselves are atomics, so the hot I/O paths only ever take the
//! read lock. The rate sampler is the sole writer of the rate fields and
//! updates them under the write lock; byte counters are only ever written by
//! the data paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::{self, MissedTickBehavior};

/// Cadence of the rate sampler; rates cover the traffic of the most recent
/// sample window.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Running counters for one rule key. Byte counters are monotonic; the rate
/// fields hold the last sampled delta as `f64` bits.
#[derive(Default)]
pub struct RuleCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    conn_count: AtomicI32,
    rate_in_bits: AtomicU64,
    rate_out_bits: AtomicU64,
}

impl RuleCounters {
    fn view(&self) -> RuleStats {
        RuleStats {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            conn_count: self.conn_count.load(Ordering::Relaxed),
            rate_in_kbps: f64::from_bits(self.rate_in_bits.load(Ordering::Relaxed)),
            rate_out_kbps: f64::from_bits(self.rate_out_bits.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of one rule's counters, in the dashboard wire format.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RuleStats {
    #[serde(rename = "BytesIn")]
    pub bytes_in: u64,

    #[serde(rename = "BytesOut")]
    pub bytes_out: u64,

    #[serde(rename = "ConnCount")]
    pub conn_count: i32,

    #[serde(rename = "RateInKBps")]
    pub rate_in_kbps: f64,

    #[serde(rename = "RateOutKBps")]
    pub rate_out_kbps: f64,
}

/// Point-in-time copy of the whole registry.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    #[serde(rename = "ruleStats")]
    pub rule_stats: HashMap<String, RuleStats>,

    #[serde(rename = "lastUpdateTime")]
    pub last_update_time: DateTime<Utc>,
}

/// Concurrent rule-key → counters mapping. Counters are created lazily on
/// first reference and never removed for the lifetime of the process.
#[derive(Default)]
pub struct StatsRegistry {
    rules: RwLock<HashMap<String, Arc<RuleCounters>>>,
}

impl StatsRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Idempotent lazy insertion.
    pub fn get_or_create(&self, key: &str) -> Arc<RuleCounters> {
        if let Some(counters) = self.rules.read().get(key) {
            return Arc::clone(counters);
        }
        let mut rules = self.rules.write();
        Arc::clone(rules.entry(key.to_string()).or_default())
    }

    pub fn add_conn(&self, key: &str) {
        self.get_or_create(key)
            .conn_count
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_conn(&self, key: &str) {
        self.get_or_create(key)
            .conn_count
            .fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, key: &str, bytes_in: u64, bytes_out: u64) {
        let counters = self.get_or_create(key);
        counters.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        counters.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }

    /// Absolute store of the connection count. Used by the UDP engine, whose
    /// notion of "connection" is the number of recently active peers.
    pub fn set_conns(&self, key: &str, count: i32) {
        self.get_or_create(key)
            .conn_count
            .store(count, Ordering::Relaxed);
    }

    /// Captures a consistent copy of every counter.
    pub fn snapshot(&self) -> Snapshot {
        let rules = self.rules.read();
        Snapshot {
            rule_stats: rules
                .iter()
                .map(|(key, counters)| (key.clone(), counters.view()))
                .collect(),
            last_update_time: Utc::now(),
        }
    }

    /// Spawns the periodic rate sampler. One per registry.
    pub fn start_rate_sampler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = time::interval(SAMPLE_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut baseline: HashMap<String, (u64, u64)> = HashMap::new();
            loop {
                interval.tick().await;
                registry.sample_rates(&mut baseline);
            }
        })
    }

    /// One sampler tick: diffs the byte counters against the previous tick
    /// and stores the deltas as KB/s. A key seen for the first time reads as
    /// rate zero on that tick; its current absolute counters become the
    /// baseline for the next one.
    fn sample_rates(&self, baseline: &mut HashMap<String, (u64, u64)>) {
        let rules = self.rules.write();
        for (key, counters) in rules.iter() {
            let current = (
                counters.bytes_in.load(Ordering::Relaxed),
                counters.bytes_out.load(Ordering::Relaxed),
            );
            let (rate_in, rate_out) = match baseline.get(key) {
                Some(&(prev_in, prev_out)) => (
                    (current.0 - prev_in) as f64 / 1024.0,
                    (current.1 - prev_out) as f64 / 1024.0,
                ),
                None => (0.0, 0.0),
            };
            counters
                .rate_in_bits
                .store(rate_in.to_bits(), Ordering::Relaxed);
            counters
                .rate_out_bits
                .store(rate_out.to_bits(), Ordering::Relaxed);
            baseline.insert(key.clone(), current);
        }
    }
}
