use std::fmt;
use std::net::SocketAddr;

use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    Created { local_port: u16, remote: String },
    Stopped { local_port: u16 },
    Restarted { local_port: u16, remote: String },
    /// A terminal accept error; the tunnel stays listed with a failed status
    AcceptFailed { local_port: u16, error: String },
    /// Dialing the destination for one inbound connection failed
    DialFailed {
        local_port: u16,
        remote: String,
        error: String,
    },
    ConnectionOpened { local_port: u16, peer: SocketAddr },
    ConnectionClosed {
        local_port: u16,
        peer: SocketAddr,
        bytes_out: u64,
        bytes_in: u64,
    },
}

impl TunnelEvent {
    /// Whether the event reports a failure the user should see
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            TunnelEvent::AcceptFailed { .. } | TunnelEvent::DialFailed { .. }
        )
    }
}

impl fmt::Display for TunnelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelEvent::Created { local_port, remote } => {
                write!(f, "tunnel {} -> {} created", local_port, remote)
            }
            TunnelEvent::Stopped { local_port } => write!(f, "tunnel {} stopped", local_port),
            TunnelEvent::Restarted { local_port, remote } => {
                write!(f, "tunnel {} -> {} restarted", local_port, remote)
            }
            TunnelEvent::AcceptFailed { local_port, error } => {
                write!(f, "tunnel {} stopped accepting: {}", local_port, error)
            }
            TunnelEvent::DialFailed {
                local_port,
                remote,
                error,
            } => write!(
                f,
                "tunnel {}: remote connection to {} failed: {}",
                local_port, remote, error
            ),
            TunnelEvent::ConnectionOpened { local_port, peer } => {
                write!(f, "tunnel {}: connection from {}", local_port, peer)
            }
            TunnelEvent::ConnectionClosed {
                local_port,
                peer,
                bytes_out,
                bytes_in,
            } => write!(
                f,
                "tunnel {}: connection from {} closed ({} bytes out, {} bytes in)",
                local_port, peer, bytes_out, bytes_in
            ),
        }
    }
}

/// Cloneable sender side of the event channels.
///
/// Failures are also published on a channel of their own, so per-connection
/// events on a busy tunnel cannot push them out of a slow receiver's window.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<TunnelEvent>,
    errors_tx: broadcast::Sender<TunnelEvent>,
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (errors_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx, errors_tx }
    }

    /// Publish an event; having no subscribers is fine
    pub fn emit(&self, event: TunnelEvent) {
        if event.is_error() {
            let _ = self.errors_tx.send(event.clone());
        }
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }

    /// Only the events for which [`TunnelEvent::is_error`] holds
    pub fn subscribe_errors(&self) -> broadcast::Receiver<TunnelEvent> {
        self.errors_tx.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}
