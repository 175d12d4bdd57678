use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::manager::ConnectionManager;
use crate::metrics::{self, ServerMetrics};
use crate::pool::WorkerPool;
use crate::reactor::{EventLoop, ReactorMail};
use crate::router::Router;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const SWEEP_PERIOD: Duration = Duration::from_secs(30);

/// Server assembly: one reactor thread, N pool workers, one idle sweeper,
/// one metrics reporter, all sharing the connection manager and the router.
pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Convenience constructor: `Server::bind("0.0.0.0:8080")`.
    pub fn bind(host_port: &str) -> Self {
        let mut config = ServerConfig::default();
        let mut parts = host_port.split(':');
        if let Some(host) = parts.next() {
            if !host.is_empty() {
                config.host = host.to_string();
            }
        }
        if let Some(port) = parts.next().and_then(|p| p.parse().ok()) {
            config.port = port;
        }
        Self { config }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.config.keep_alive = enabled;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Spawn all threads and return a handle. Fatal errors (bind failure,
    /// notifier creation failure) abort startup here.
    pub fn start(self, router: Router) -> ServerResult<ServerHandle> {
        let config = self.config;
        let stop = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(ServerMetrics::new());
        let manager = Arc::new(ConnectionManager::with_limits(
            config.max_connections,
            config.max_request_bytes,
        ));
        let pool = Arc::new(WorkerPool::new(config.effective_workers())?);

        let mut event_loop = EventLoop::bind(
            config.clone(),
            Arc::clone(&manager),
            Arc::clone(&pool),
            Arc::new(router),
            Arc::clone(&metrics),
            Arc::clone(&stop),
        )?;
        let port = event_loop.local_port();
        let mail = event_loop.mail();

        let reactor = thread::Builder::new()
            .name("nocturne-reactor".to_string())
            .spawn(move || {
                event_loop.run();
                // Handed back to the joiner so the listener and control pipe
                // outlive every worker still holding a mail.
                event_loop
            })?;

        let sweeper = spawn_sweeper(
            Arc::clone(&manager),
            mail,
            Arc::clone(&stop),
            config.idle_timeout,
        )?;
        let reporter = metrics::spawn_reporter(Arc::clone(&metrics), Arc::clone(&stop))?;

        info!(
            port,
            workers = config.effective_workers(),
            keep_alive = config.keep_alive,
            "server started"
        );

        Ok(ServerHandle {
            port,
            stop,
            reactor: Some(reactor),
            sweeper: Some(sweeper),
            reporter: Some(reporter),
            pool,
            metrics,
        })
    }

    /// Blocking entry point for the binary: wires SIGINT/SIGTERM to the
    /// shutdown flag, then parks until everything drains.
    pub fn serve(self, router: Router) -> ServerResult<()> {
        let handle = self.start(router)?;

        let stop = Arc::clone(&handle.stop);
        if let Err(e) = ctrlc::set_handler(move || {
            info!("shutdown signal received");
            stop.store(true, Ordering::SeqCst);
        }) {
            warn!(error = %e, "could not install signal handler");
        }

        handle.wait();
        info!("server shut down");
        Ok(())
    }
}

/// Running server. Dropping the handle does not stop the server; call
/// [`stop`](ServerHandle::stop) or [`wait`](ServerHandle::wait).
pub struct ServerHandle {
    port: u16,
    stop: Arc<AtomicBool>,
    reactor: Option<JoinHandle<EventLoop>>,
    sweeper: Option<JoinHandle<()>>,
    reporter: Option<JoinHandle<()>>,
    pool: Arc<WorkerPool>,
    metrics: Arc<ServerMetrics>,
}

impl ServerHandle {
    /// The port actually bound; useful when the config asked for port 0.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    /// Request shutdown and join everything.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.join_all();
    }

    /// Park until shutdown is requested elsewhere (e.g. a signal), then join.
    pub fn wait(mut self) {
        self.join_all();
    }

    fn join_all(&mut self) {
        // The reactor returns its EventLoop; keep it alive until the workers
        // have been joined so the control pipe stays writable, then drop it
        // to release the listener and pipe fds.
        let event_loop = self.reactor.take().and_then(|h| h.join().ok());
        if let Some(h) = self.sweeper.take() {
            let _ = h.join();
        }
        if let Some(h) = self.reporter.take() {
            let _ = h.join();
        }
        // The pool joins last: workers may still be finishing tasks for
        // connections the reactor already tore down.
        self.pool.shutdown();
        drop(event_loop);
    }
}

fn spawn_sweeper(
    manager: Arc<ConnectionManager>,
    mail: ReactorMail,
    stop: Arc<AtomicBool>,
    idle_timeout: Duration,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("nocturne-sweeper".to_string())
        .spawn(move || {
            let slice = Duration::from_millis(250);
            let mut elapsed = Duration::ZERO;
            while !stop.load(Ordering::Acquire) {
                thread::sleep(slice);
                elapsed += slice;
                if elapsed < SWEEP_PERIOD {
                    continue;
                }
                elapsed = Duration::ZERO;
                let idle = manager.sweep_idle(Instant::now(), idle_timeout);
                for fd in idle {
                    mail.timeout(fd);
                }
            }
        })
}
