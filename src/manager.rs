use crate::conn::ConnectionState;
use crate::parser::HttpParser;
use std::collections::HashMap;
use std::net::IpAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

pub const MAX_CONNECTIONS: usize = 1024;
pub const MAX_REQUEST_BYTES: u64 = 1024 * 1024;
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything the manager tracks per fd: the shared connection state, the
/// connection's exclusive parser, and the cumulative byte counter for the
/// current request cycle.
pub struct ConnectionEntry {
    state: Arc<ConnectionState>,
    parser: Mutex<HttpParser>,
    total_bytes: AtomicU64,
    created: Instant,
}

impl ConnectionEntry {
    fn new(state: Arc<ConnectionState>, max_body: usize) -> Self {
        Self {
            state,
            parser: Mutex::new(HttpParser::with_max_body(max_body)),
            total_bytes: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    pub fn state(&self) -> &Arc<ConnectionState> {
        &self.state
    }

    pub fn created(&self) -> Instant {
        self.created
    }
}

/// Scoped accessor for one entry. Holding a handle keeps the entry alive past
/// table mutations; parser access goes through the entry's own lock, so the
/// table lock is never held across a parse.
pub struct ConnectionHandle {
    entry: Arc<ConnectionEntry>,
}

impl ConnectionHandle {
    pub fn state(&self) -> &Arc<ConnectionState> {
        &self.entry.state
    }

    pub fn with_parser<R>(&self, f: impl FnOnce(&mut HttpParser) -> R) -> R {
        let mut parser = self.entry.parser.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut parser)
    }
}

/// Thread-safe table from fd to connection entry.
///
/// Read-only queries (lookup, count, idle inspection) share the lock;
/// admissions, evictions, byte-count updates, and parser resets take it
/// exclusively.
pub struct ConnectionManager {
    table: RwLock<HashMap<RawFd, Arc<ConnectionEntry>>>,
    max_connections: usize,
    max_request_bytes: u64,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::with_limits(MAX_CONNECTIONS, MAX_REQUEST_BYTES)
    }

    pub fn with_limits(max_connections: usize, max_request_bytes: u64) -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
            max_connections,
            max_request_bytes,
        }
    }

    /// Admit a freshly accepted connection. Refuses once the table is at
    /// capacity; the caller closes the fd in that case.
    pub fn admit(&self, fd: RawFd, ip: IpAddr, port: u16) -> bool {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        if table.len() >= self.max_connections {
            return false;
        }
        let state = Arc::new(ConnectionState::new(fd, ip, port));
        let entry = ConnectionEntry::new(state, self.max_request_bytes as usize);
        table.insert(fd, Arc::new(entry));
        true
    }

    /// Scoped accessor for an fd, or `None` if it is not (or no longer)
    /// present.
    pub fn borrow(&self, fd: RawFd) -> Option<ConnectionHandle> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        table.get(&fd).map(|entry| ConnectionHandle {
            entry: Arc::clone(entry),
        })
    }

    /// Add `n` to the fd's cumulative counter. `false` means the request
    /// cycle went past the per-request cap (or the fd is gone) and the
    /// connection must be terminated.
    pub fn record_bytes(&self, fd: RawFd, n: u64) -> bool {
        let table = self.table.write().unwrap_or_else(|e| e.into_inner());
        match table.get(&fd) {
            Some(entry) => {
                let total = entry.total_bytes.fetch_add(n, Ordering::AcqRel) + n;
                total <= self.max_request_bytes
            }
            None => false,
        }
    }

    /// Prepare the fd for its next request cycle: parser back to the initial
    /// state (buffered leftover preserved), byte counter zeroed.
    pub fn reset_parser(&self, fd: RawFd) {
        let table = self.table.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = table.get(&fd) {
            let mut parser = entry.parser.lock().unwrap_or_else(|e| e.into_inner());
            parser.reset();
            entry.total_bytes.store(0, Ordering::Release);
        }
    }

    /// Remove the entry. Idempotent; returns the entry if it was present.
    pub fn evict(&self, fd: RawFd) -> Option<Arc<ConnectionEntry>> {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        table.remove(&fd)
    }

    /// Fds whose last activity is older than `now - timeout`. Connections
    /// with a task in flight are skipped; their activity stamp advances when
    /// the response goes out. The caller performs the close and removal.
    pub fn sweep_idle(&self, now: Instant, timeout: Duration) -> Vec<RawFd> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        table
            .iter()
            .filter(|(_, entry)| {
                !entry.state.task_in_flight() && entry.state.idle_for(now) > timeout
            })
            .map(|(fd, _)| *fd)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all live fds, for shutdown teardown.
    pub fn fds(&self) -> Vec<RawFd> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        table.keys().copied().collect()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
