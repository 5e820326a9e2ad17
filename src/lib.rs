//! # tcplogd - Minimal TCP Log Collection Daemon
//!
//! tcplogd accepts newline-delimited text records from any number of TCP (or
//! Unix domain socket) clients and appends them, in arrival order per
//! connection, to a size-rotated log file. It is meant for small devices that
//! relay their system log over the network, e.g. an OpenWrt router pointing
//! `logd` at a central box.
//!
//! ## Pipeline
//!
//! ```text
//! client bytes -> Listener -> Connection -> dispatch channel -> Writer -> LogSink
//! ```
//!
//! - **Single writer**: only the [`server::Writer`] ever touches the sink.
//! - **Graceful shutdown**: one [`CancellationToken`](tokio_util::sync::CancellationToken)
//!   stops accepting and reading, then every record already queued is drained
//!   into the sink before it is closed.
//! - **Rotation**: [`server::RotatingFile`] rotates by size, prunes backups by
//!   count and age, and can gzip them.
//!
//! ## Quick Start
//!
//! ```no_run
//! use tcplogd::config::ServerConfig;
//! use tcplogd::server::LogServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::load(None)?;
//!     let server = LogServer::new(config).await?;
//!     server.run_until_signal().await?;
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod server;
pub mod types;

/// Common error types used throughout tcplogd
pub mod error {
    /// tcplogd error types
    #[derive(Debug, thiserror::Error)]
    pub enum TcpLogError {
        /// I/O operation failed
        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),
        /// Configuration error
        #[error("Configuration error: {0}")]
        Config(String),
        /// The listener could not be bound
        #[error("Failed to bind {address}: {source}")]
        Bind {
            /// Address or socket path that was requested
            address: String,
            /// Underlying bind failure
            #[source]
            source: std::io::Error,
        },
        /// Server error
        #[error("Server error: {0}")]
        Server(String),
    }

    impl From<config::ConfigError> for TcpLogError {
        fn from(err: config::ConfigError) -> Self {
            TcpLogError::Config(err.to_string())
        }
    }

    impl From<toml::ser::Error> for TcpLogError {
        fn from(err: toml::ser::Error) -> Self {
            TcpLogError::Config(format!("Failed to render config: {}", err))
        }
    }

    /// Result type alias for tcplogd operations
    pub type Result<T> = std::result::Result<T, TcpLogError>;
}

pub use error::{Result, TcpLogError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Protocol, ServerConfig};
    pub use crate::server::{LogServer, LogSink, RotatingFile, ShutdownCoordinator};
    pub use crate::types::Record;
    pub use crate::{Result, TcpLogError};
}
