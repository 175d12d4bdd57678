pub mod body;
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod manager;
pub mod metrics;
pub mod notifier;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod router;
pub mod server;
pub mod syscalls;
pub mod task;

// Re-exports for users
pub use body::ParsedBody;
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use http::{Method, Request, Response};
pub use router::{Handler, Router};
pub use server::{Server, ServerHandle};
