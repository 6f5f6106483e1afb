//! Operator console: an authenticated, fixed command set over a Unix
//! socket. There is no code evaluation.

pub mod command;
pub mod server;

pub use command::{execute, Command};
pub use server::{serve_connection, ConsoleService};

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("unknown command `{0}`; try `help`")]
    UnknownCommand(String),
    #[error("authentication failed")]
    Unauthorized,
    #[error("console I/O failed: {0}")]
    Io(#[from] std::io::Error),
}
