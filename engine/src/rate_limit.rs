// engine/src/rate_limit.rs
//!
//! Rolling-window admission control keyed by client IP.

use crate::config::{RateLimitConfig, WindowLimit};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u32,
    reset_at: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    limit: u32,
    window: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, limit: u32, window: Duration) -> Self {
        Self {
            name: name.into(),
            limit,
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_limit(name: impl Into<String>, limit: WindowLimit) -> Self {
        Self::new(name, limit.limit, Duration::from_secs(limit.window_secs))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    /// Starts a fresh bucket when none exists or the window has ended;
    /// otherwise counts the request and admits it while within the limit.
    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock();
        match buckets.get_mut(key) {
            Some(bucket) if now < bucket.reset_at => {
                bucket.count = bucket.count.saturating_add(1);
                bucket.count <= self.limit
            }
            _ => {
                buckets.insert(
                    key.to_string(),
                    Bucket {
                        count: 1,
                        reset_at: now + self.window,
                    },
                );
                self.limit >= 1
            }
        }
    }

    pub fn check(&self, key: &str) -> Result<()> {
        if self.allow(key) {
            Ok(())
        } else {
            Err(Error::RateLimited(format!("{} limit reached for {key}", self.name)))
        }
    }

    /// Drops buckets whose window has ended. Returns how many were purged.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, b| now < b.reset_at);
        before - buckets.len()
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Client identity: the first `X-Forwarded-For` hop when present, else the
/// connection's remote address, with any port removed.
pub fn client_key(forwarded_for: Option<&str>, remote_addr: &str) -> String {
    let raw = forwarded_for
        .and_then(|xff| xff.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| remote_addr.trim());
    strip_port(raw)
}

fn strip_port(addr: &str) -> String {
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return socket.ip().to_string();
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return ip.to_string();
    }
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return host.to_string();
        }
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            host.to_string()
        }
        _ => addr.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Search,
    BatchResolution,
}

/// The two guarded routes.
#[derive(Debug, Clone)]
pub struct RateLimits {
    pub search: Arc<RateLimiter>,
    pub batch_resolution: Arc<RateLimiter>,
}

impl RateLimits {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            search: Arc::new(RateLimiter::from_limit("search", config.search)),
            batch_resolution: Arc::new(RateLimiter::from_limit(
                "batch_resolution",
                config.batch_resolution,
            )),
        }
    }

    pub fn limiter(&self, route: Route) -> &RateLimiter {
        match route {
            Route::Search => &self.search,
            Route::BatchResolution => &self.batch_resolution,
        }
    }

    pub fn admit(&self, route: Route, forwarded_for: Option<&str>, remote_addr: &str) -> Result<()> {
        let key = client_key(forwarded_for, remote_addr);
        self.limiter(route).check(&key)
    }

    pub fn sweep(&self) -> usize {
        let purged = self.search.sweep() + self.batch_resolution.sweep();
        if purged > 0 {
            debug!(purged, "expired rate buckets purged");
        }
        purged
    }
}
