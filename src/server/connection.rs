//! Per-connection line reading and forwarding

use crate::types::record::{Record, DELIMITER};
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Why [`LineReader::read_next`] did not produce a record
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// Shutdown was signalled, or the connection was closed from outside
    #[error("read cancelled")]
    Cancelled,
    /// The peer closed the stream
    #[error("end of stream")]
    EndOfStream,
    /// Any other I/O error; terminal for the connection
    #[error("read failed: {0}")]
    Failure(#[source] io::Error),
}

impl ReadError {
    /// Whether this is the shutdown control signal rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReadError::Cancelled)
    }
}

/// Buffered newline-delimited reader over a byte stream
#[derive(Debug)]
pub struct LineReader<S> {
    inner: BufReader<S>,
}

impl<S: AsyncRead + Unpin> LineReader<S> {
    /// Wrap a stream
    pub fn new(stream: S) -> Self {
        Self {
            inner: BufReader::new(stream),
        }
    }

    /// Read the next newline-terminated record, racing the read against
    /// `cancel`.
    ///
    /// Bytes left over when the stream ends without a final newline are not
    /// a record and are discarded; the call reports `EndOfStream`.
    pub async fn read_next(&mut self, cancel: &CancellationToken) -> Result<Record, ReadError> {
        let mut buf = Vec::new();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReadError::Cancelled),
            result = self.inner.read_until(DELIMITER, &mut buf) => result,
        };

        match result {
            Ok(_) if buf.last() == Some(&DELIMITER) => {
                Record::new(buf).ok_or(ReadError::EndOfStream)
            }
            Ok(0) => Err(ReadError::EndOfStream),
            Ok(n) => {
                debug!(bytes = n, "stream ended mid-line, discarding partial record");
                Err(ReadError::EndOfStream)
            }
            Err(e) => Err(ReadError::Failure(e)),
        }
    }
}

/// Handle that closes a connection from outside its handler.
///
/// Closing is idempotent; closing a connection whose handler already exited
/// does nothing.
#[derive(Debug, Clone)]
pub struct ConnectionCloser {
    peer: String,
    token: CancellationToken,
}

impl ConnectionCloser {
    /// Ask the owning handler to stop reading and drop the stream
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Whether close has been requested, directly or through shutdown
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Peer the connection belongs to
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

/// An accepted connection owned by its handler
#[derive(Debug)]
pub struct Connection<S> {
    reader: LineReader<S>,
    peer: String,
    token: CancellationToken,
}

impl<S: AsyncRead + Unpin> Connection<S> {
    /// Wrap an accepted stream. The connection is cancelled together with
    /// `shutdown` and can also be closed on its own through [`Self::closer`].
    pub fn new(stream: S, peer: impl Into<String>, shutdown: &CancellationToken) -> Self {
        Self {
            reader: LineReader::new(stream),
            peer: peer.into(),
            token: shutdown.child_token(),
        }
    }

    /// Peer address for logging
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// A handle that can close this connection from another task
    pub fn closer(&self) -> ConnectionCloser {
        ConnectionCloser {
            peer: self.peer.clone(),
            token: self.token.clone(),
        }
    }

    /// Read the next record, stopping early on shutdown or close
    pub async fn read_next(&mut self) -> Result<Record, ReadError> {
        self.reader.read_next(&self.token).await
    }

    /// Close the connection, dropping the underlying stream
    pub fn close(self) {
        self.token.cancel();
        debug!(peer = %self.peer, "connection closed");
    }
}

/// Why a connection handler returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerExit {
    /// Peer closed the stream
    EndOfStream,
    /// Shutdown or an outside close
    Cancelled,
    /// Terminal read error
    ReadFailure,
    /// The dispatch channel is gone
    DispatchClosed,
}

/// Outcome of one [`handle_connection`] run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerReport {
    /// Records forwarded to the dispatch channel
    pub forwarded: u64,
    /// Reason the handler stopped
    pub exit: HandlerExit,
}

/// Pull records off `conn` and forward them to `dispatch` until the peer
/// closes, the connection is cancelled, or a read fails.
///
/// Sending blocks while the channel is full; that is the only backpressure a
/// client sees. The send does not watch for cancellation, since the writer
/// keeps draining until every sender is gone.
pub async fn handle_connection<S>(
    mut conn: Connection<S>,
    dispatch: mpsc::Sender<Record>,
) -> HandlerReport
where
    S: AsyncRead + Unpin,
{
    debug!(peer = %conn.peer(), "handling connection");
    let mut forwarded = 0u64;

    let exit = loop {
        match conn.read_next().await {
            Ok(record) => {
                if dispatch.send(record).await.is_err() {
                    error!(peer = %conn.peer(), "dispatch channel closed, dropping connection");
                    break HandlerExit::DispatchClosed;
                }
                forwarded += 1;
            }
            Err(ReadError::EndOfStream) => {
                info!(peer = %conn.peer(), forwarded, "peer closed connection");
                break HandlerExit::EndOfStream;
            }
            Err(ReadError::Cancelled) => {
                info!(peer = %conn.peer(), forwarded, "connection cancelled");
                break HandlerExit::Cancelled;
            }
            Err(ReadError::Failure(e)) => {
                error!(peer = %conn.peer(), error = %e, "read failed, closing connection");
                break HandlerExit::ReadFailure;
            }
        }
    };

    conn.close();
    HandlerReport { forwarded, exit }
}
