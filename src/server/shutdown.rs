//! Signal handling and shutdown sequencing

use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Shutdown progress. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShutdownState {
    /// Accepting and reading normally
    Running,
    /// Cancellation has fired
    SignalReceived,
    /// Connections are being closed and the channel drained
    Draining,
    /// The writer has finished and the sink is closed
    Closed,
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownState::Running => "running",
            ShutdownState::SignalReceived => "signal-received",
            ShutdownState::Draining => "draining",
            ShutdownState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Owns the cancellation token every component watches, and tracks how far
/// shutdown has progressed.
///
/// Clones share the same token and state.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    state: Arc<watch::Sender<ShutdownState>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    /// Create a coordinator in the `Running` state
    pub fn new() -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            token: CancellationToken::new(),
            state: Arc::new(state),
        }
    }

    /// The shared cancellation token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether cancellation has fired
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Current state
    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    /// Request shutdown. Only the first request fires the token; later ones
    /// are ignored. Returns whether this call was the one that fired.
    pub fn trigger(&self, cause: &str) -> bool {
        let fired = self.state.send_if_modified(|state| {
            if *state == ShutdownState::Running {
                *state = ShutdownState::SignalReceived;
                true
            } else {
                false
            }
        });

        if fired {
            info!(cause, "shutdown requested, cancelling");
            self.token.cancel();
        } else {
            debug!(cause, state = %self.state(), "shutdown already in progress, ignoring");
        }
        fired
    }

    /// Move to `next` if it is later than the current state
    pub(crate) fn advance(&self, next: ShutdownState) {
        let moved = self.state.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        });
        if moved {
            debug!(state = %next, "shutdown state changed");
        }
    }

    /// Wait until `state` has been reached
    pub async fn wait_for(&self, state: ShutdownState) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so this only errors if it was dropped.
        let _ = rx.wait_for(|current| *current >= state).await;
    }

    /// Listen for SIGINT/SIGTERM and trigger shutdown on the first one.
    /// Further signals are logged and ignored.
    ///
    /// The handlers are installed before this returns, so a signal sent
    /// right after the call is already caught. Must be called from within a
    /// tokio runtime.
    pub fn spawn_signal_listener(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        let registered = TerminationSignals::register();
        tokio::spawn(async move {
            let mut signals = match registered {
                Ok(signals) => signals,
                Err(e) => {
                    error!(error = %e, "failed to install signal handlers");
                    return;
                }
            };

            loop {
                match signals.recv().await {
                    Some(name) => {
                        coordinator.trigger(name);
                    }
                    None => {
                        debug!("signal stream ended");
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(unix)]
struct TerminationSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl TerminationSignals {
    fn register() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> Option<&'static str> {
        tokio::select! {
            sig = self.interrupt.recv() => sig.map(|_| "SIGINT"),
            sig = self.terminate.recv() => sig.map(|_| "SIGTERM"),
        }
    }
}

#[cfg(not(unix))]
struct TerminationSignals;

#[cfg(not(unix))]
impl TerminationSignals {
    fn register() -> io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> Option<&'static str> {
        tokio::signal::ctrl_c().await.ok().map(|_| "ctrl-c")
    }
}
