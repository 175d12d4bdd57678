use std::net::IpAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

/// Protocol a connection is currently speaking. Flips to WebSocket on
/// handshake detection; no framing exists beyond that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Protocol {
    Http = 0,
    WebSocket = 1,
}

/// Shared identity and liveness of one accepted connection.
///
/// The identity fields (fd, peer address, creation instant) are immutable for
/// the connection's life. Everything mutable is an atomic, because the state
/// is shared between the reactor's read path and the worker holding the
/// connection's task.
pub struct ConnectionState {
    fd: RawFd,
    peer_ip: IpAddr,
    peer_port: u16,
    created: Instant,
    /// Milliseconds since `created`; advanced on reads and response sends.
    last_activity_ms: AtomicU64,
    protocol: AtomicU8,
    handshake_complete: AtomicBool,
    /// Single-reader-per-connection gate: set by the reactor when it submits
    /// a task, cleared by the worker on the keep-alive completion path.
    task_in_flight: AtomicBool,
}

impl ConnectionState {
    pub fn new(fd: RawFd, peer_ip: IpAddr, peer_port: u16) -> Self {
        Self {
            fd,
            peer_ip,
            peer_port,
            created: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            protocol: AtomicU8::new(Protocol::Http as u8),
            handshake_complete: AtomicBool::new(false),
            task_in_flight: AtomicBool::new(false),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer_ip(&self) -> IpAddr {
        self.peer_ip
    }

    pub fn peer_port(&self) -> u16 {
        self.peer_port
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Record activity now. `fetch_max` keeps the timestamp monotonic even if
    /// reactor and worker race.
    pub fn touch(&self) {
        let offset = self.created.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(offset, Ordering::AcqRel);
    }

    /// How long the connection has been idle as of `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire));
        now.saturating_duration_since(self.created + last)
    }

    pub fn protocol(&self) -> Protocol {
        if self.protocol.load(Ordering::Acquire) == Protocol::WebSocket as u8 {
            Protocol::WebSocket
        } else {
            Protocol::Http
        }
    }

    pub fn set_protocol(&self, protocol: Protocol) {
        self.protocol.store(protocol as u8, Ordering::Release);
    }

    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete.load(Ordering::Acquire)
    }

    pub fn set_handshake_complete(&self, done: bool) {
        self.handshake_complete.store(done, Ordering::Release);
    }

    pub fn task_in_flight(&self) -> bool {
        self.task_in_flight.load(Ordering::Acquire)
    }

    pub fn set_task_in_flight(&self, in_flight: bool) {
        self.task_in_flight.store(in_flight, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::thread;

    fn state() -> ConnectionState {
        ConnectionState::new(7, IpAddr::V4(Ipv4Addr::LOCALHOST), 54321)
    }

    #[test]
    fn identity_is_preserved() {
        let conn = state();
        assert_eq!(conn.fd(), 7);
        assert_eq!(conn.peer_ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(conn.peer_port(), 54321);
        assert_eq!(conn.protocol(), Protocol::Http);
        assert!(!conn.handshake_complete());
        assert!(!conn.task_in_flight());
    }

    #[test]
    fn touch_advances_and_idle_shrinks() {
        let conn = state();
        thread::sleep(Duration::from_millis(15));
        let before = conn.idle_for(Instant::now());
        assert!(before >= Duration::from_millis(10));
        conn.touch();
        let after = conn.idle_for(Instant::now());
        assert!(after < before);
    }

    #[test]
    fn last_activity_is_monotonic() {
        let conn = state();
        thread::sleep(Duration::from_millis(5));
        conn.touch();
        let frozen = conn.last_activity_ms.load(Ordering::Acquire);
        // A stale writer storing a smaller offset must not move time backward.
        conn.last_activity_ms
            .fetch_max(frozen.saturating_sub(1), Ordering::AcqRel);
        assert_eq!(conn.last_activity_ms.load(Ordering::Acquire), frozen);
    }

    #[test]
    fn protocol_tag_flips() {
        let conn = state();
        conn.set_protocol(Protocol::WebSocket);
        assert_eq!(conn.protocol(), Protocol::WebSocket);
    }
}
