use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dialer::{BoxedStream, Dialer};
use crate::error::TunnelError;
use crate::events::{EventSink, TunnelEvent};
use crate::listener::{Binder, Listener};
use crate::relay::relay;

/// Last known state of a tunnel's listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelStatus {
    Running,
    /// The listener hit an accept error and no longer accepts connections
    Failed(String),
}

impl TunnelStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, TunnelStatus::Running)
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelStatus::Running => f.write_str("running"),
            TunnelStatus::Failed(e) => write!(f, "error: {}", e),
        }
    }
}

/// Connection counters for a tunnel
#[derive(Debug, Default)]
struct TunnelStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    bytes_out: AtomicU64,
    bytes_in: AtomicU64,
    dial_failures: AtomicU64,
}

impl TunnelStats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Connections accepted since the tunnel started
    pub total_connections: u64,
    /// Connections currently being dialed or relayed
    pub active_connections: u64,
    /// Bytes sent from local clients to the remote destination
    pub bytes_out: u64,
    /// Bytes sent from the remote destination to local clients
    pub bytes_in: u64,
    pub dial_failures: u64,
}

/// Point-in-time view of a tunnel
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    pub local_port: u16,
    pub local_addr: SocketAddr,
    pub remote: String,
    pub status: TunnelStatus,
    pub started_at: DateTime<Local>,
    pub uptime: Duration,
    pub stats: StatsSnapshot,
}

/// State shared by the acceptor loop and its connection handlers
struct ForwardContext {
    local_port: u16,
    remote: String,
    dialer: Arc<dyn Dialer>,
    events: EventSink,
    stats: Arc<TunnelStats>,
}

/// A running local forward: one listening port bound to one remote destination
pub(crate) struct Tunnel {
    local_addr: SocketAddr,
    remote: String,
    started_at: DateTime<Local>,
    started: Instant,
    status: watch::Receiver<TunnelStatus>,
    stats: Arc<TunnelStats>,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl Tunnel {
    /// Bind `bind_addr` and start accepting connections for `remote`.
    ///
    /// Returns as soon as the listener is bound; the acceptor loop runs in its
    /// own task until [`Tunnel::shutdown`] is called or the tunnel is dropped.
    pub(crate) async fn start(
        binder: &dyn Binder,
        bind_addr: SocketAddr,
        remote: String,
        dialer: Arc<dyn Dialer>,
        events: EventSink,
    ) -> Result<Self, TunnelError> {
        let listener = binder
            .bind(bind_addr)
            .await
            .map_err(|source| TunnelError::Bind {
                addr: bind_addr,
                source,
            })?;

        let local_addr = listener
            .local_addr()
            .map_err(|source| TunnelError::Bind {
                addr: bind_addr,
                source,
            })?;

        info!("Forwarding {} -> {}", local_addr, remote);

        let stats = Arc::new(TunnelStats::default());
        let (status_tx, status_rx) = watch::channel(TunnelStatus::Running);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let ctx = Arc::new(ForwardContext {
            local_port: local_addr.port(),
            remote: remote.clone(),
            dialer,
            events,
            stats: stats.clone(),
        });
        let handle = tokio::spawn(accept_loop(listener, ctx, status_tx, shutdown_rx));

        Ok(Tunnel {
            local_addr,
            remote,
            started_at: Local::now(),
            started: Instant::now(),
            status: status_rx,
            stats,
            shutdown_tx,
            handle,
        })
    }

    pub(crate) fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn remote(&self) -> &str {
        &self.remote
    }

    pub(crate) fn status(&self) -> TunnelStatus {
        self.status.borrow().clone()
    }

    pub(crate) fn info(&self) -> TunnelInfo {
        TunnelInfo {
            local_port: self.local_port(),
            local_addr: self.local_addr,
            remote: self.remote.clone(),
            status: self.status(),
            started_at: self.started_at,
            uptime: self.started.elapsed(),
            stats: self.stats.snapshot(),
        }
    }

    /// Stop accepting and wait until the listener has been released.
    ///
    /// Connections that are already being relayed keep running.
    pub(crate) async fn shutdown(self) {
        let port = self.local_port();
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            warn!("Acceptor for port {} ended abnormally: {}", port, e);
        }
        debug!("Listener on port {} released", port);
    }
}

async fn accept_loop(
    mut listener: Box<dyn Listener>,
    ctx: Arc<ForwardContext>,
    status_tx: watch::Sender<TunnelStatus>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            // A send or a dropped Tunnel both mean stop
            _ = shutdown_rx.recv() => {
                info!("Tunnel on port {} stopped", ctx.local_port);
                break;
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        ctx.stats.total_connections.fetch_add(1, Ordering::Relaxed);
                        let guard = ActiveConnection::new(ctx.stats.clone());
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            handle_connection(ctx, stream, peer).await;
                            drop(guard);
                        });
                    }
                    Err(e) => {
                        error!("Tunnel on port {} failed to accept: {}", ctx.local_port, e);
                        status_tx.send_replace(TunnelStatus::Failed(e.to_string()));
                        ctx.events.emit(TunnelEvent::AcceptFailed {
                            local_port: ctx.local_port,
                            error: e.to_string(),
                        });
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_connection(ctx: Arc<ForwardContext>, local: BoxedStream, peer: SocketAddr) {
    debug!("Connection from {} on port {}", peer, ctx.local_port);

    let remote = match ctx.dialer.dial(&ctx.remote).await {
        Ok(stream) => stream,
        Err(e) => {
            ctx.stats.dial_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Tunnel on port {}: failed to reach {}: {}",
                ctx.local_port, ctx.remote, e
            );
            ctx.events.emit(TunnelEvent::DialFailed {
                local_port: ctx.local_port,
                remote: ctx.remote.clone(),
                error: e.to_string(),
            });
            return;
        }
    };

    ctx.events.emit(TunnelEvent::ConnectionOpened {
        local_port: ctx.local_port,
        peer,
    });

    let outcome = relay(local, remote).await;
    let bytes_out = outcome.bytes_a_to_b();
    let bytes_in = outcome.bytes_b_to_a();
    ctx.stats.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    ctx.stats.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);

    debug!(
        "Connection from {} on port {} closed ({} out, {} in)",
        peer, ctx.local_port, bytes_out, bytes_in
    );
    ctx.events.emit(TunnelEvent::ConnectionClosed {
        local_port: ctx.local_port,
        peer,
        bytes_out,
        bytes_in,
    });
}

/// Counts a connection as active for as long as it is alive
struct ActiveConnection(Arc<TunnelStats>);

impl ActiveConnection {
    fn new(stats: Arc<TunnelStats>) -> Self {
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        Self(stats)
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}
