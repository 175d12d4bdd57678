use clap::Parser;
use nocturne::{Request, Response, Router, Server, ServerConfig};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nocturne")]
#[command(about = "HTTP/1.x server on a non-blocking reactor and a worker thread pool")]
#[command(version)]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Number of worker threads (0 = one per core)
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Enable HTTP keep-alive
    #[arg(long)]
    keep_alive: bool,

    /// Idle connection timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

fn hello(_req: &Request, res: &mut Response) {
    res.set_status(200, "OK");
    res.set_header("Content-Type", "text/plain");
    res.set_body("Hello");
}

fn echo(req: &Request, res: &mut Response) {
    match req.json::<serde_json::Value>() {
        Some(value) => {
            res.set_status(200, "OK");
            res.set_header("Content-Type", "application/json");
            match serde_json::to_vec(&value) {
                Ok(body) => res.set_body(body),
                Err(_) => {
                    res.set_status(500, "Internal Server Error");
                    res.set_body("serialization failed");
                }
            }
        }
        None => {
            res.set_status(400, "Bad Request");
            res.set_header("Content-Type", "text/plain");
            res.set_body("expected application/json");
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = ServerConfig {
        port: cli.port,
        workers: cli.workers,
        keep_alive: cli.keep_alive,
        idle_timeout: Duration::from_secs(cli.timeout),
        ..ServerConfig::default()
    };

    let mut router = Router::new();
    router.get("/hello", hello);
    router.post("/echo", echo);

    Server::new(config).serve(router)?;
    Ok(())
}
