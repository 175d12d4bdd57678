use crate::config::ServerConfig;
use crate::conn::Protocol;
use crate::error::ServerResult;
use crate::http::Response;
use crate::manager::{ConnectionHandle, ConnectionManager};
use crate::metrics::ServerMetrics;
use crate::notifier::{Event, EventFlags, EventNotifier};
use crate::parser::{ParseErrorKind, ParseStatus};
use crate::pool::WorkerPool;
use crate::router::Router;
use crate::syscalls::{self, PIPE_MSG_LEN};
use crate::task::{HttpRequestTask, Task};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const WAIT_TIMEOUT_MS: i32 = 1000;
pub const READ_BUF_SIZE: usize = 4096;
/// Retry budget for best-effort error responses written from the reactor.
const REJECT_SEND_RETRIES: usize = 50;

/// Notifications that travel from workers and the idle sweeper back to the
/// reactor over the control pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// A keep-alive response went out; re-run the read path so leftover
    /// pipelined bytes get parsed without new kernel readability.
    Rearm(RawFd),
    /// A task finished on the close path; the reactor tears the fd down.
    Close(RawFd),
    /// The sweeper flagged the fd as idle; the reactor re-checks and closes.
    Timeout(RawFd),
}

impl ControlMessage {
    fn encode(self) -> [u8; PIPE_MSG_LEN] {
        let (tag, fd): (u32, RawFd) = match self {
            ControlMessage::Rearm(fd) => (1, fd),
            ControlMessage::Close(fd) => (2, fd),
            ControlMessage::Timeout(fd) => (3, fd),
        };
        let mut buf = [0u8; PIPE_MSG_LEN];
        buf[..4].copy_from_slice(&tag.to_le_bytes());
        buf[4..].copy_from_slice(&fd.to_le_bytes());
        buf
    }

    fn decode(raw: &[u8; PIPE_MSG_LEN]) -> Option<Self> {
        let tag = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let fd = RawFd::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        match tag {
            1 => Some(ControlMessage::Rearm(fd)),
            2 => Some(ControlMessage::Close(fd)),
            3 => Some(ControlMessage::Timeout(fd)),
            _ => None,
        }
    }
}

/// Cheap cloneable sender for the control pipe. Workers and the sweeper hold
/// one; the reactor drains the other end.
#[derive(Clone, Copy)]
pub struct ReactorMail {
    write_fd: RawFd,
}

impl ReactorMail {
    /// A mail that drops everything; used where no reactor exists.
    pub fn disconnected() -> Self {
        Self { write_fd: -1 }
    }

    pub fn rearm(&self, fd: RawFd) {
        self.send(ControlMessage::Rearm(fd));
    }

    pub fn close(&self, fd: RawFd) {
        self.send(ControlMessage::Close(fd));
    }

    pub fn timeout(&self, fd: RawFd) {
        self.send(ControlMessage::Timeout(fd));
    }

    fn send(&self, msg: ControlMessage) {
        if self.write_fd < 0 {
            return;
        }
        if let Err(e) = syscalls::write_pipe_msg(self.write_fd, &msg.encode()) {
            warn!(error = %e, "failed to notify reactor");
        }
    }
}

/// The runloop: owns the listening socket and the notifier, accepts, drains
/// readable fds into per-connection parsers, and turns complete requests into
/// pool tasks. Everything that closes an fd happens on this thread, so
/// descriptor reuse can never cross a notification in flight.
pub struct EventLoop {
    listener_fd: RawFd,
    port: u16,
    notifier: EventNotifier,
    manager: Arc<ConnectionManager>,
    pool: Arc<WorkerPool>,
    router: Arc<Router>,
    metrics: Arc<ServerMetrics>,
    config: ServerConfig,
    stop: Arc<AtomicBool>,
    control_read: RawFd,
    control_write: RawFd,
}

impl EventLoop {
    /// Fatal on bind or notifier failure; the server cannot start.
    pub fn bind(
        config: ServerConfig,
        manager: Arc<ConnectionManager>,
        pool: Arc<WorkerPool>,
        router: Arc<Router>,
        metrics: Arc<ServerMetrics>,
        stop: Arc<AtomicBool>,
    ) -> ServerResult<Self> {
        let listener_fd = syscalls::create_listen_socket(&config.host, config.port, config.backlog)?;
        let port = syscalls::local_port(listener_fd)?;

        let notifier = EventNotifier::new()?;
        notifier.register(listener_fd, EventFlags::READ)?;

        let (control_read, control_write) = syscalls::create_pipe()?;
        notifier.register(control_read, EventFlags::READ)?;

        Ok(Self {
            listener_fd,
            port,
            notifier,
            manager,
            pool,
            router,
            metrics,
            config,
            stop,
            control_read,
            control_write,
        })
    }

    /// The port actually bound; differs from the configured one when that
    /// was 0.
    pub fn local_port(&self) -> u16 {
        self.port
    }

    pub fn mail(&self) -> ReactorMail {
        ReactorMail {
            write_fd: self.control_write,
        }
    }

    pub fn run(&mut self) {
        info!(port = self.port, "event loop started");
        while !self.stop.load(Ordering::Acquire) {
            let events = self.notifier.wait(WAIT_TIMEOUT_MS);
            for event in events {
                self.handle_event(event);
            }
        }
        self.shutdown_cleanup();
        info!("event loop stopped");
    }

    fn handle_event(&mut self, event: Event) {
        if event.fd == self.listener_fd {
            self.accept_loop();
        } else if event.fd == self.control_read {
            self.drain_control();
        } else if event.flags.contains(EventFlags::ERROR)
            || event.flags.contains(EventFlags::HANGUP)
        {
            // A peer may half-close while its response is still being built;
            // the teardown then belongs to the worker's completion path. The
            // EOF is re-observed on the rearm read.
            let in_flight = self
                .manager
                .borrow(event.fd)
                .map(|h| h.state().task_in_flight())
                .unwrap_or(false);
            if !in_flight {
                self.disconnect(event.fd);
            }
        } else if event.flags.contains(EventFlags::READ) {
            self.process_readable(event.fd);
        }
    }

    /// Drain the accept queue until WouldBlock. Each new fd is registered
    /// and then admitted; on admission failure (cap reached) it is closed.
    fn accept_loop(&mut self) {
        loop {
            match syscalls::accept_connection(self.listener_fd) {
                Ok(Some((fd, ip, port))) => {
                    if let Err(e) = self
                        .notifier
                        .register(fd, EventFlags::READ | EventFlags::HANGUP)
                    {
                        warn!(fd, error = %e, "failed to register accepted connection");
                        syscalls::close_fd(fd);
                        continue;
                    }
                    if !self.manager.admit(fd, ip, port) {
                        warn!(fd, "connection limit reached; rejecting");
                        self.notifier.unregister(fd);
                        syscalls::close_fd(fd);
                        continue;
                    }
                    self.metrics.conn_opened();
                    debug!(fd, peer_ip = %ip, peer_port = port, "accepted connection");
                }
                Ok(None) => break,
                Err(e) => {
                    // Transient; the listener stays armed and the loop
                    // continues on the next readiness event.
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn drain_control(&mut self) {
        loop {
            match syscalls::read_pipe_msg(self.control_read) {
                Ok(Some(raw)) => match ControlMessage::decode(&raw) {
                    Some(ControlMessage::Rearm(fd)) => self.process_readable(fd),
                    Some(ControlMessage::Close(fd)) => self.disconnect(fd),
                    Some(ControlMessage::Timeout(fd)) => self.handle_timeout(fd),
                    None => warn!("unknown control message"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "control pipe read failed");
                    break;
                }
            }
        }
    }

    /// Edge-triggered read path: drain the socket, feed the parser, and stop
    /// for this turn once a request dispatches. While a task is in flight the
    /// fd is left untouched; the worker's rearm notification resumes it.
    fn process_readable(&mut self, fd: RawFd) {
        let Some(handle) = self.manager.borrow(fd) else {
            return;
        };
        if handle.state().task_in_flight() {
            return;
        }

        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match syscalls::recv_nonblocking(fd, &mut buf) {
                Err(e) => {
                    debug!(fd, error = %e, "read failed");
                    self.disconnect(fd);
                    return;
                }
                Ok(Some(0)) => {
                    debug!(fd, "peer closed connection");
                    self.disconnect(fd);
                    return;
                }
                Ok(None) => break,
                Ok(Some(n)) => {
                    handle.state().touch();
                    if !self.manager.record_bytes(fd, n as u64) {
                        self.reject(fd, 413, "Request Entity Too Large");
                        return;
                    }
                    match handle.with_parser(|p| p.feed(&buf[..n])) {
                        ParseStatus::Complete => {
                            self.dispatch_request(fd, &handle);
                            return;
                        }
                        ParseStatus::Error(kind) => {
                            self.reject_parse_error(fd, kind);
                            return;
                        }
                        ParseStatus::NeedMore => {}
                    }
                }
            }
        }

        // Socket drained without a dispatch. Leftover from the previous
        // request cycle may already hold a complete request.
        match handle.with_parser(|p| p.feed(&[])) {
            ParseStatus::Complete => self.dispatch_request(fd, &handle),
            ParseStatus::Error(kind) => self.reject_parse_error(fd, kind),
            ParseStatus::NeedMore => {}
        }
    }

    fn dispatch_request(&mut self, fd: RawFd, handle: &ConnectionHandle) {
        let Some(request) = handle.with_parser(|p| p.take_request()) else {
            return;
        };
        let state = handle.state();

        if request.wants_websocket_upgrade() {
            state.set_protocol(Protocol::WebSocket);
            debug!(fd, "websocket handshake detected");
        }

        // No further reads or tasks for this fd until the worker releases it.
        state.set_task_in_flight(true);
        let keep_alive_enabled = self.config.keep_alive && !self.stop.load(Ordering::Acquire);
        let task = HttpRequestTask::new(
            request,
            Arc::clone(state),
            Arc::clone(&self.router),
            keep_alive_enabled,
            self.mail(),
            Arc::clone(&self.metrics),
        );
        self.pool.submit(Task::HttpRequest(task));
        self.manager.reset_parser(fd);
    }

    fn reject_parse_error(&mut self, fd: RawFd, kind: ParseErrorKind) {
        debug!(fd, kind = ?kind, "parse error");
        match kind {
            ParseErrorKind::BufferTooLarge => self.reject(fd, 413, "Request Entity Too Large"),
            _ => self.reject(fd, 400, "Bad Request"),
        }
    }

    /// Best-effort canned error response, then disconnect.
    fn reject(&mut self, fd: RawFd, status: u16, text: &str) {
        let bytes = Response::canned(status, text).to_bytes();
        let mut sent = 0usize;
        let mut retries = 0usize;
        while sent < bytes.len() {
            match syscalls::send_nonblocking(fd, &bytes[sent..]) {
                Ok(Some(n)) if n > 0 => sent += n,
                Ok(Some(_)) => break,
                Ok(None) => {
                    retries += 1;
                    if retries > REJECT_SEND_RETRIES {
                        break;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Err(_) => break,
            }
        }
        self.metrics.add_bytes_sent(sent as u64);
        self.disconnect(fd);
    }

    /// Idle verdicts are re-checked here: between the sweep and this message
    /// the fd may have been closed and reused by a fresh connection.
    fn handle_timeout(&mut self, fd: RawFd) {
        let Some(handle) = self.manager.borrow(fd) else {
            return;
        };
        let state = handle.state();
        if !state.task_in_flight() && state.idle_for(Instant::now()) > self.config.idle_timeout {
            debug!(fd, "closing idle connection");
            self.disconnect(fd);
        }
    }

    /// Tear an fd down: unregister, close, evict. Gated on eviction, so a
    /// second call for the same fd is a no-op.
    fn disconnect(&mut self, fd: RawFd) {
        if self.manager.evict(fd).is_some() {
            self.notifier.unregister(fd);
            syscalls::close_fd(fd);
            self.metrics.conn_closed();
            debug!(fd, "connection closed");
        }
    }

    fn shutdown_cleanup(&mut self) {
        // Late worker notifications first, then whatever is still live.
        self.drain_control();
        for fd in self.manager.fds() {
            self.disconnect(fd);
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        syscalls::close_fd(self.listener_fd);
        syscalls::close_fd(self.control_read);
        syscalls::close_fd(self.control_write);
    }
}
