use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info};

use crate::dialer::Dialer;
use crate::error::TunnelError;
use crate::events::{EventSink, TunnelEvent};
use crate::listener::{Binder, TcpBinder};
use crate::tunnel::{Tunnel, TunnelInfo};

/// Address tunnels listen on unless configured otherwise
pub const DEFAULT_BIND_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Owns every tunnel of one gateway session.
///
/// Create, stop and restart are serialised against each other; listing only
/// takes a short read lock on the tunnel map.
pub struct TunnelManager {
    dialer: Arc<dyn Dialer>,
    binder: Arc<dyn Binder>,
    bind_addr: IpAddr,
    tunnels: RwLock<HashMap<u16, Tunnel>>,
    lifecycle: Mutex<()>,
    events: EventSink,
    closed: AtomicBool,
}

impl TunnelManager {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self::with_bind_addr(dialer, DEFAULT_BIND_ADDR)
    }

    pub fn with_bind_addr(dialer: Arc<dyn Dialer>, bind_addr: IpAddr) -> Self {
        Self {
            dialer,
            binder: Arc::new(TcpBinder),
            bind_addr,
            tunnels: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(()),
            events: EventSink::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Open tunnel listeners through `binder` instead of plain TCP
    pub fn with_binder(mut self, binder: Arc<dyn Binder>) -> Self {
        self.binder = binder;
        self
    }

    /// Receive events for all tunnels, including background failures
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// Receive only failures: accept errors and failed dials
    pub fn subscribe_errors(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe_errors()
    }

    /// Start forwarding `local_port` to `remote`.
    ///
    /// Returns the port actually bound, which differs from `local_port` only
    /// when an ephemeral port (0) was requested.
    pub async fn create_tunnel(
        &self,
        local_port: u16,
        remote: impl Into<String>,
    ) -> Result<u16, TunnelError> {
        let remote = remote.into();
        let _guard = self.lifecycle.lock().await;
        let port = self.create_locked(local_port, remote.clone()).await?;
        self.events.emit(TunnelEvent::Created {
            local_port: port,
            remote,
        });
        Ok(port)
    }

    /// Close the listener on `local_port` and forget the tunnel.
    ///
    /// Connections already relayed through the tunnel run until they close
    /// on their own.
    pub async fn stop_tunnel(&self, local_port: u16) -> Result<(), TunnelError> {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked(local_port).await?;
        self.events.emit(TunnelEvent::Stopped { local_port });
        Ok(())
    }

    /// Stop the tunnel and create it again with the same destination.
    ///
    /// If binding fails the second time the tunnel stays removed.
    pub async fn restart_tunnel(&self, local_port: u16) -> Result<u16, TunnelError> {
        let _guard = self.lifecycle.lock().await;

        let remote = self
            .tunnels
            .read()
            .await
            .get(&local_port)
            .map(|t| t.remote().to_string())
            .ok_or(TunnelError::NotFound(local_port))?;

        self.stop_locked(local_port).await?;
        let port = self.create_locked(local_port, remote.clone()).await?;

        info!("Restarted tunnel {} -> {}", port, remote);
        self.events.emit(TunnelEvent::Restarted {
            local_port: port,
            remote,
        });
        Ok(port)
    }

    /// Snapshot of every tunnel, ordered by local port
    pub async fn list_tunnels(&self) -> Vec<TunnelInfo> {
        let tunnels = self.tunnels.read().await;
        let mut infos: Vec<TunnelInfo> = tunnels.values().map(Tunnel::info).collect();
        infos.sort_by_key(|info| info.local_port);
        infos
    }

    pub async fn get_tunnel(&self, local_port: u16) -> Option<TunnelInfo> {
        self.tunnels.read().await.get(&local_port).map(Tunnel::info)
    }

    pub async fn len(&self) -> usize {
        self.tunnels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop every tunnel, returning how many were stopped
    pub async fn stop_all(&self) -> usize {
        let _guard = self.lifecycle.lock().await;

        let ports: Vec<u16> = self.tunnels.read().await.keys().copied().collect();
        let mut stopped = 0;
        for port in ports {
            if self.stop_locked(port).await.is_ok() {
                self.events.emit(TunnelEvent::Stopped { local_port: port });
                stopped += 1;
            }
        }
        stopped
    }

    /// Stop all tunnels and close the transport.
    ///
    /// Only the first call does anything; later creates fail with
    /// [`TunnelError::Closed`].
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let stopped = self.stop_all().await;
        info!("Stopped {} tunnel(s), closing transport", stopped);
        self.dialer.close().await;
    }

    async fn create_locked(&self, local_port: u16, remote: String) -> Result<u16, TunnelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TunnelError::Closed);
        }
        if local_port != 0 && self.tunnels.read().await.contains_key(&local_port) {
            return Err(TunnelError::DuplicatePort(local_port));
        }

        let tunnel = Tunnel::start(
            self.binder.as_ref(),
            SocketAddr::new(self.bind_addr, local_port),
            remote,
            self.dialer.clone(),
            self.events.clone(),
        )
        .await?;

        let port = tunnel.local_port();
        debug!("Registered tunnel on {}", tunnel.local_addr());
        self.tunnels.write().await.insert(port, tunnel);
        Ok(port)
    }

    async fn stop_locked(&self, local_port: u16) -> Result<(), TunnelError> {
        let tunnel = self
            .tunnels
            .write()
            .await
            .remove(&local_port)
            .ok_or(TunnelError::NotFound(local_port))?;

        tunnel.shutdown().await;
        Ok(())
    }
}
