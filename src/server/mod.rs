//! tcplogd server implementation

pub mod connection;
pub mod listener;
pub mod rotation;
pub mod shutdown;
pub mod storage;
pub mod writer;

use crate::config::ServerConfig;
use crate::types::Record;
use crate::{Result, TcpLogError};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

pub use connection::{
    handle_connection, Connection, ConnectionCloser, HandlerExit, HandlerReport, LineReader,
    ReadError,
};
pub use listener::{accept_next, AcceptError, Listener};
pub use rotation::RetentionPolicy;
pub use shutdown::{ShutdownCoordinator, ShutdownState};
pub use storage::{LogSink, MemorySink, RotatingFile};
pub use writer::{Writer, WriterReport};

/// Pause after a failed accept before trying again
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Totals for one server run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Connections accepted
    pub connections: u64,
    /// Records handed to the dispatch channel by connection handlers
    pub records_received: u64,
    /// Records the sink accepted
    pub records_written: u64,
    /// Records the sink rejected
    pub write_failures: u64,
}

/// Main tcplogd server: owns the listener and the sink and supervises the
/// accept loop, the connection handlers and the writer
pub struct LogServer<S: LogSink = RotatingFile> {
    listener: Listener,
    sink: S,
    capacity: usize,
    shutdown: ShutdownCoordinator,
}

impl LogServer<RotatingFile> {
    /// Bind the listener and prepare the rotating file sink
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let sink = RotatingFile::new(&config.sink);
        Self::with_sink(&config, sink).await
    }
}

impl<S: LogSink> LogServer<S> {
    /// Bind the listener and use `sink` for storage
    pub async fn with_sink(config: &ServerConfig, sink: S) -> Result<Self> {
        config.validate()?;
        let listener = Listener::bind(&config.listener).await?;
        info!(endpoint = %listener, "listener bound");

        Ok(Self {
            listener,
            sink,
            capacity: config.dispatch.capacity,
            shutdown: ShutdownCoordinator::new(),
        })
    }

    /// Local TCP address, useful when binding port 0
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for triggering or observing shutdown
    pub fn shutdown_handle(&self) -> ShutdownCoordinator {
        self.shutdown.clone()
    }

    /// Run with SIGINT/SIGTERM wired to shutdown
    pub async fn run_until_signal(self) -> Result<RunReport> {
        let signals = self.shutdown.spawn_signal_listener();
        let report = self.run().await;
        signals.abort();
        report
    }

    /// Accept and handle connections until shutdown, then drain.
    ///
    /// Teardown order: stop accepting, close the active connection, wait for
    /// every handler, close the dispatch channel, let the writer drain it,
    /// close the sink.
    pub async fn run(self) -> Result<RunReport> {
        let Self {
            listener,
            sink,
            capacity,
            shutdown,
        } = self;
        let cancel = shutdown.token();

        let (dispatch, records) = mpsc::channel::<Record>(capacity);
        let writer = Writer::new(records, sink).spawn();
        let handlers = TaskTracker::new();
        let received = Arc::new(AtomicU64::new(0));

        let mut active: Option<ConnectionCloser> = None;
        let mut connections = 0u64;

        info!(endpoint = %listener, capacity, "accepting connections");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            match accept_next(&listener, &cancel).await {
                Ok((stream, peer)) => {
                    connections += 1;
                    info!(peer = %peer, "accepted connection");
                    let conn = Connection::new(stream, peer, &cancel);
                    active = Some(conn.closer());
                    let dispatch = dispatch.clone();
                    let received = Arc::clone(&received);
                    handlers.spawn(async move {
                        let peer = conn.peer().to_string();
                        let report = handle_connection(conn, dispatch).await;
                        debug!(
                            peer = %peer,
                            forwarded = report.forwarded,
                            exit = ?report.exit,
                            "handler finished"
                        );
                        received.fetch_add(report.forwarded, Ordering::Relaxed);
                    });
                }
                Err(AcceptError::Cancelled) => continue,
                Err(AcceptError::Listener(e)) => back_off_after_accept_error(&e, &cancel).await,
            }
        }

        shutdown.advance(ShutdownState::SignalReceived);
        shutdown.advance(ShutdownState::Draining);
        info!("shutting down, no longer accepting");
        drop(listener);

        if let Some(closer) = active.take() {
            info!(peer = %closer.peer(), "closing current connection");
            closer.close();
        }

        handlers.close();
        handlers.wait().await;
        debug!("all connection handlers finished");

        info!("closing dispatch channel");
        drop(dispatch);

        let outcome = match writer.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "writer task failed, sink was not closed");
                shutdown.advance(ShutdownState::Closed);
                return Err(TcpLogError::Server(format!("Writer task failed: {}", e)));
            }
        };

        let mut sink = outcome.sink;
        info!("closing sink");
        if let Err(e) = sink.close() {
            error!(error = %e, "error closing sink");
        }
        shutdown.advance(ShutdownState::Closed);

        let report = RunReport {
            connections,
            records_received: received.load(Ordering::Relaxed),
            records_written: outcome.report.written,
            write_failures: outcome.report.failed,
        };
        info!(
            connections = report.connections,
            received = report.records_received,
            records = report.records_written,
            failures = report.write_failures,
            "server stopped"
        );
        Ok(report)
    }
}

/// Log a failed accept and pause before the next one. Cancellation cuts the
/// pause short.
async fn back_off_after_accept_error(error: &io::Error, cancel: &CancellationToken) {
    error!(error = %error, "failed to accept connection");
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
    }
}
