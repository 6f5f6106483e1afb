//! Network entry point and the default HTTP/WebSocket socket layer.

pub mod config;
pub mod entry;
pub mod handlers;
pub mod middleware;
pub mod module;

pub use config::NetworkConfig;
pub use entry::{listen, parse_port_arg, ListenHandle, SocketLayer};
pub use handlers::AppState;
pub use module::HttpSocketLayer;
