use std::time::Duration;

/// Knobs for the listener, the worker pool, and the connection lifecycle.
///
/// Defaults mirror the standalone-binary behavior: port 8080, four workers,
/// keep-alive off, five-minute idle timeout.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub keep_alive: bool,
    /// Connections idle longer than this are swept and closed.
    pub idle_timeout: Duration,
    pub max_connections: usize,
    /// Cumulative bytes one request cycle may receive before a 413.
    pub max_request_bytes: u64,
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            workers: 4,
            keep_alive: false,
            idle_timeout: Duration::from_secs(300),
            max_connections: 1024,
            max_request_bytes: 1024 * 1024,
            backlog: 128,
        }
    }
}

impl ServerConfig {
    /// Default worker count when the caller asks for zero: one per core.
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.workers, 4);
        assert!(!cfg.keep_alive);
        assert_eq!(cfg.idle_timeout, Duration::from_secs(300));
        assert_eq!(cfg.max_connections, 1024);
        assert_eq!(cfg.max_request_bytes, 1024 * 1024);
    }

    #[test]
    fn zero_workers_falls_back_to_core_count() {
        let cfg = ServerConfig {
            workers: 0,
            ..ServerConfig::default()
        };
        assert!(cfg.effective_workers() >= 1);
    }
}
