//! Listening socket and cancellable accept for tcplogd

use crate::config::{ListenerSettings, Protocol};
use crate::{Result, TcpLogError};
use std::fmt;
use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::net::{lookup_host, TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why [`accept_next`] did not produce a connection
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    /// Shutdown was signalled before a client connected
    #[error("accept cancelled by shutdown")]
    Cancelled,
    /// The underlying accept call failed
    #[error("accept failed: {0}")]
    Listener(#[source] io::Error),
}

impl AcceptError {
    /// Whether this is the shutdown control signal rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AcceptError::Cancelled)
    }
}

/// A bound listening socket
#[derive(Debug)]
pub enum Listener {
    /// TCP listener
    Tcp(TcpListener),
    /// Unix domain socket listener; the socket file is removed on drop
    #[cfg(unix)]
    Unix {
        /// Bound listener
        listener: UnixListener,
        /// Socket file path
        path: PathBuf,
    },
}

/// An accepted byte stream
#[derive(Debug)]
pub enum Stream {
    /// TCP connection
    Tcp(TcpStream),
    /// Unix domain socket connection
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Listener {
    /// Bind according to the listener settings
    pub async fn bind(settings: &ListenerSettings) -> Result<Self> {
        match settings.protocol {
            Protocol::Tcp | Protocol::Tcp4 | Protocol::Tcp6 => {
                Ok(Listener::Tcp(bind_tcp(settings).await?))
            }
            #[cfg(unix)]
            Protocol::Unix => bind_unix(Path::new(&settings.address)),
            #[cfg(not(unix))]
            Protocol::Unix => Err(TcpLogError::Config(
                "Unix domain sockets are not supported on this platform".to_string(),
            )),
        }
    }

    /// Local TCP address, if this is a TCP listener
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix { .. } => None,
        }
    }

    /// Accept one connection, returning it with a printable peer name
    pub async fn accept(&self) -> io::Result<(Stream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
                }
                Ok((Stream::Tcp(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                Ok((Stream::Unix(stream), format!("unix:{}", path.display())))
            }
        }
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Listener::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => write!(f, "tcp://{}", addr),
                Err(_) => f.write_str("tcp://<unknown>"),
            },
            #[cfg(unix)]
            Listener::Unix { path, .. } => write!(f, "unix://{}", path.display()),
        }
    }
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            if let Err(e) = std::fs::remove_file(&*path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove socket file");
                }
            }
        }
    }
}

/// Accept the next connection unless cancellation fires first.
///
/// A token that is already cancelled always wins, so no connection is ever
/// returned after shutdown has been observed. A pending accept that loses the
/// race is dropped; a client that connected in that window sits in the
/// kernel backlog until the listener itself is closed.
pub async fn accept_next(
    listener: &Listener,
    cancel: &CancellationToken,
) -> std::result::Result<(Stream, String), AcceptError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AcceptError::Cancelled),
        result = listener.accept() => result.map_err(AcceptError::Listener),
    }
}

async fn bind_tcp(settings: &ListenerSettings) -> Result<TcpListener> {
    let host = if settings.address.is_empty() {
        match settings.protocol {
            Protocol::Tcp6 => "::",
            _ => "0.0.0.0",
        }
    } else {
        settings.address.as_str()
    };
    let address = format!("{}:{}", host, settings.port);

    let resolved = lookup_host((host, settings.port))
        .await
        .map_err(|e| TcpLogError::Bind {
            address: address.clone(),
            source: e,
        })?;

    let mut last_err = None;
    for addr in resolved.filter(|addr| family_allowed(settings.protocol, addr)) {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                debug!(addr = %addr, error = %e, "bind attempt failed");
                last_err = Some(e);
            }
        }
    }

    Err(TcpLogError::Bind {
        address,
        source: last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {} address to bind", settings.protocol),
            )
        }),
    })
}

fn family_allowed(protocol: Protocol, addr: &SocketAddr) -> bool {
    match protocol {
        Protocol::Tcp4 => addr.is_ipv4(),
        Protocol::Tcp6 => addr.is_ipv6(),
        _ => true,
    }
}

#[cfg(unix)]
fn bind_unix(path: &Path) -> Result<Listener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }

    let listener = UnixListener::bind(path).map_err(|e| TcpLogError::Bind {
        address: path.display().to_string(),
        source: e,
    })?;

    Ok(Listener::Unix {
        listener,
        path: path.to_path_buf(),
    })
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}
