use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::dialer::BoxedStream;
use crate::listener::{Binder, Listener, TcpBinder};

/// Start a TCP server that echoes everything back until the client closes
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

/// Send `payload` to `addr`, close the write half and expect it echoed back
pub async fn echo_roundtrip(addr: SocketAddr, payload: &[u8]) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(payload).await.unwrap();
    stream.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    stream.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, payload);
}

/// A loopback port that was free a moment ago
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Binds without a socket; every accept fails as if the process ran out of fds
pub struct FailingBinder;

struct FailingListener {
    addr: SocketAddr,
}

#[async_trait]
impl Binder for FailingBinder {
    async fn bind(&self, addr: SocketAddr) -> io::Result<Box<dyn Listener>> {
        Ok(Box::new(FailingListener { addr }))
    }
}

#[async_trait]
impl Listener for FailingListener {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }

    async fn accept(&mut self) -> io::Result<(BoxedStream, SocketAddr)> {
        Err(io::Error::new(io::ErrorKind::Other, "too many open files"))
    }
}

/// Real TCP for the first `binds` calls, address in use after that
pub struct LimitedBinder {
    remaining: AtomicUsize,
}

impl LimitedBinder {
    pub fn new(binds: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(binds),
        }
    }
}

#[async_trait]
impl Binder for LimitedBinder {
    async fn bind(&self, addr: SocketAddr) -> io::Result<Box<dyn Listener>> {
        let allowed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "address in use"));
        }
        TcpBinder.bind(addr).await
    }
}
