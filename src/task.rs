use crate::conn::ConnectionState;
use crate::http::{Request, Response, SERVER_HEADER};
use crate::metrics::ServerMetrics;
use crate::reactor::ReactorMail;
use crate::router::Router;
use crate::syscalls;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Unit of work drained by the worker pool.
pub enum Task {
    HttpRequest(HttpRequestTask),
    #[cfg(test)]
    Probe(Box<dyn FnOnce(usize) + Send>),
}

impl Task {
    pub fn run(self, worker_id: usize) {
        match self {
            Task::HttpRequest(task) => task.run(worker_id),
            #[cfg(test)]
            Task::Probe(f) => f(worker_id),
        }
    }
}

/// One parsed request bound to its connection, ready for routing and
/// response emission on a worker thread.
pub struct HttpRequestTask {
    request: Request,
    conn: Arc<ConnectionState>,
    router: Arc<Router>,
    keep_alive_enabled: bool,
    mail: ReactorMail,
    metrics: Arc<ServerMetrics>,
}

impl HttpRequestTask {
    pub fn new(
        request: Request,
        conn: Arc<ConnectionState>,
        router: Arc<Router>,
        keep_alive_enabled: bool,
        mail: ReactorMail,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            request,
            conn,
            router,
            keep_alive_enabled,
            mail,
            metrics,
        }
    }

    fn run(self, worker_id: usize) {
        self.metrics.inc_requests();

        let mut response = Response::new(500, "Internal Server Error");
        response.set_header("Content-Type", "text/plain");
        response.set_header("Server", SERVER_HEADER);

        let mut keep_alive = self.determine_keep_alive();
        response.set_header("Connection", if keep_alive { "keep-alive" } else { "close" });

        let routed = panic::catch_unwind(AssertUnwindSafe(|| {
            self.router.route(&self.request, &mut response)
        }));
        match routed {
            Ok(true) => {}
            Ok(false) => {
                response.set_status(404, "Not Found");
                response.set_header("Content-Type", "text/html");
                let page = self.not_found_page();
                response.set_body(page);
            }
            Err(_) => {
                error!(
                    worker = worker_id,
                    method = self.request.method.as_str(),
                    path = %self.request.path,
                    "handler panicked"
                );
                response = Response::new(500, "Internal Server Error");
                response.set_header("Content-Type", "text/plain");
                response.set_header("Server", SERVER_HEADER);
                response.set_header("Connection", "close");
                response.set_body("Internal Server Error");
                keep_alive = false;
            }
        }

        response.set_header("Content-Length", &response.body.len().to_string());

        if !self.send_response(&response, worker_id) {
            keep_alive = false;
        }

        let fd = self.conn.fd();
        if keep_alive {
            self.conn.touch();
            self.conn.set_task_in_flight(false);
            self.mail.rearm(fd);
            debug!(fd, "connection kept alive for next request");
        } else {
            // The in-flight flag stays set: no reads may race the teardown.
            // The reactor owns the actual close so the fd cannot be reused
            // while this notification is still in the pipe.
            self.mail.close(fd);
            debug!(fd, "connection handed to reactor for close");
        }
    }

    /// HTTP/1.1 defaults to keep-alive unless the client sent
    /// `Connection: close`; HTTP/1.0 only keeps alive on an explicit
    /// `Connection: keep-alive`. Both require the server-side switch.
    fn determine_keep_alive(&self) -> bool {
        if !self.keep_alive_enabled {
            return false;
        }
        let conn_header = self
            .request
            .header("connection")
            .map(|v| v.to_ascii_lowercase());
        if self.request.is_http_11() {
            match conn_header {
                Some(value) => value != "close",
                None => true,
            }
        } else {
            match conn_header {
                Some(value) => value == "keep-alive",
                None => false,
            }
        }
    }

    /// Serialize and push the response out with a partial-write loop. Returns
    /// false when the peer is gone and the connection must close.
    fn send_response(&self, response: &Response, worker_id: usize) -> bool {
        let bytes = response.to_bytes();
        let fd = self.conn.fd();
        let mut sent = 0usize;

        while sent < bytes.len() {
            match syscalls::send_nonblocking(fd, &bytes[sent..]) {
                Ok(Some(0)) => {
                    warn!(fd, worker = worker_id, "peer closed during response send");
                    return false;
                }
                Ok(Some(n)) => {
                    sent += n;
                    self.metrics.add_bytes_sent(n as u64);
                }
                Ok(None) => {
                    // Socket buffer full; yield briefly and retry.
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) => {
                    warn!(fd, worker = worker_id, error = %e, "failed to send response");
                    return false;
                }
            }
        }
        true
    }

    fn not_found_page(&self) -> String {
        format!(
            r#"<!DOCTYPE html>
<html>
<head><title>404 Not Found</title></head>
<body>
    <h1>404 - Page Not Found</h1>
    <p>The requested resource was not found on this server.</p>
    <p>Request: {} {}</p>
</body>
</html>"#,
            self.request.method.as_str(),
            self.request.path
        )
    }
}
