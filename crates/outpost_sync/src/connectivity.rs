//! Connectivity monitor for the Portal.

use crate::transport::PortalTransport;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Best-effort Portal reachability monitor.
///
/// Wraps the transport's probe with a short-lived cache so a busy drain
/// loop does not probe on every attempt. Never errors: an unreachable
/// Portal and a timed-out probe both read as `false`.
pub struct ConnectivityMonitor<T: PortalTransport> {
    transport: Arc<T>,
    probe_timeout: Duration,
    cache_ttl: Duration,
    cached: Mutex<Option<(Instant, bool)>>,
}

impl<T: PortalTransport> ConnectivityMonitor<T> {
    /// Creates a monitor over the given transport.
    pub fn new(transport: Arc<T>, probe_timeout: Duration, cache_ttl: Duration) -> Self {
        Self {
            transport,
            probe_timeout,
            cache_ttl,
            cached: Mutex::new(None),
        }
    }

    /// Returns whether the Portal is currently reachable, probing only
    /// if the cached result has expired.
    ///
    /// The probe runs outside the cache lock, so callers are never
    /// blocked behind another caller's in-progress probe. Concurrent
    /// cache misses may probe more than once; each stores its result.
    pub fn is_reachable(&self) -> bool {
        if let Some((at, reachable)) = *self.cached.lock() {
            if at.elapsed() < self.cache_ttl {
                return reachable;
            }
        }
        self.probe_now()
    }

    /// Forces a fresh probe, replacing any cached result.
    pub fn probe_now(&self) -> bool {
        let reachable = self.transport.probe(self.probe_timeout);
        *self.cached.lock() = Some((Instant::now(), reachable));
        reachable
    }

    /// Drops the cached result.
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }
}
