//! Per-source connection rate limiting.
//!
//! Admission asks the limiter once per inbound TCP connection, before
//! the handshake starts. A fixed window per source keeps the bookkeeping
//! cheap; precision does not matter here, only pushback.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

#[derive(Debug)]
struct SourceRecord {
    connections: u32,
    window_start: Instant,
}

/// Sliding-window connection limiter keyed by source address.
pub struct ConnectionRateLimiter {
    config: RateLimitConfig,
    sources: Mutex<HashMap<IpAddr, SourceRecord>>,
}

impl ConnectionRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            sources: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.max_per_window > 0
    }

    /// Account for a new connection from `ip` and decide whether it may
    /// proceed.
    pub async fn allow(&self, ip: IpAddr) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let window = Duration::from_secs(self.config.window_secs);
        let mut sources = self.sources.lock().await;
        let record = sources.entry(ip).or_insert_with(|| SourceRecord {
            connections: 0,
            window_start: Instant::now(),
        });
        if record.window_start.elapsed() > window {
            debug!(%ip, "rate limit window reset");
            record.connections = 0;
            record.window_start = Instant::now();
        }
        record.connections += 1;
        let allowed = record.connections <= self.config.max_per_window;
        if !allowed {
            warn!(
                %ip,
                connections = record.connections,
                limit = self.config.max_per_window,
                "connection rate limit exceeded"
            );
        }
        allowed
    }

    /// Drop records whose window has expired.
    pub async fn cleanup_expired(&self) {
        let window = Duration::from_secs(self.config.window_secs);
        let mut sources = self.sources.lock().await;
        sources.retain(|ip, record| {
            let keep = record.window_start.elapsed() <= window;
            if !keep {
                debug!(%ip, "rate limit record expired");
            }
            keep
        });
    }

    pub async fn tracked_sources(&self) -> usize {
        self.sources.lock().await.len()
    }
}
