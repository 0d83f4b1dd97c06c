use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::warn;

use crate::dialer::BoxedStream;

/// Accepts local clients for one tunnel
#[async_trait]
pub trait Listener: Send + 'static {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    async fn accept(&mut self) -> io::Result<(BoxedStream, SocketAddr)>;
}

/// Opens the listening side of new tunnels
#[async_trait]
pub trait Binder: Send + Sync + 'static {
    async fn bind(&self, addr: SocketAddr) -> io::Result<Box<dyn Listener>>;
}

/// Plain TCP listeners
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpBinder;

#[async_trait]
impl Binder for TcpBinder {
    async fn bind(&self, addr: SocketAddr) -> io::Result<Box<dyn Listener>> {
        Ok(Box::new(TcpListener::bind(addr).await?))
    }
}

#[async_trait]
impl Listener for TcpListener {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }

    async fn accept(&mut self) -> io::Result<(BoxedStream, SocketAddr)> {
        let (stream, peer) = TcpListener::accept(self).await?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        Ok((Box::new(stream), peer))
    }
}
