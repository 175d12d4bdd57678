use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::info;

const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Server-wide counters, updated lock-free from the reactor and the workers.
pub struct ServerMetrics {
    active_connections: AtomicU64,
    total_requests: AtomicU64,
    bytes_sent: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            active_connections: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub fn conn_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn conn_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_requests(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the reporter thread: one summary line every five seconds until the
/// shutdown flag flips. Sleeps in short slices so shutdown is prompt.
pub fn spawn_reporter(
    metrics: Arc<ServerMetrics>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("nocturne-metrics".to_string())
        .spawn(move || {
            let slice = Duration::from_millis(250);
            let mut elapsed = Duration::ZERO;
            while !shutdown.load(Ordering::Acquire) {
                thread::sleep(slice);
                elapsed += slice;
                if elapsed < REPORT_INTERVAL {
                    continue;
                }
                elapsed = Duration::ZERO;
                info!(
                    active_connections = metrics.active_connections(),
                    total_requests = metrics.total_requests(),
                    bytes_sent = metrics.bytes_sent(),
                    "server metrics"
                );
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_activity() {
        let metrics = ServerMetrics::new();
        metrics.conn_opened();
        metrics.conn_opened();
        metrics.conn_closed();
        metrics.inc_requests();
        metrics.add_bytes_sent(512);
        metrics.add_bytes_sent(512);

        assert_eq!(metrics.active_connections(), 1);
        assert_eq!(metrics.total_requests(), 1);
        assert_eq!(metrics.bytes_sent(), 1024);
    }
}
