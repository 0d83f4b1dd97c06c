use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::DialError;

/// A duplex byte stream returned by a [`Dialer`]
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn Stream>;

/// Opens streams to remote destinations through an established transport.
///
/// Implementations must allow any number of concurrent `dial` calls.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Open a new stream to `destination` ("host:port")
    async fn dial(&self, destination: &str) -> Result<BoxedStream, DialError>;

    /// Release the underlying transport
    async fn close(&self) {}
}

/// Split "host:port" or "[v6]:port" into its parts
pub fn split_host_port(destination: &str) -> Result<(&str, u16), DialError> {
    let invalid = || DialError::InvalidDestination(destination.to_string());

    let (host, port) = destination.rsplit_once(':').ok_or_else(invalid)?;
    let host = match host.strip_prefix('[') {
        Some(inner) => inner.strip_suffix(']').ok_or_else(invalid)?,
        None if host.contains(':') => return Err(invalid()),
        None => host,
    };
    if host.is_empty() {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if port == 0 {
        return Err(invalid());
    }

    Ok((host, port))
}

/// Dials destinations directly from this host, without a gateway
#[derive(Debug, Default, Clone)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, destination: &str) -> Result<BoxedStream, DialError> {
        let (host, port) = split_host_port(destination)?;

        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| DialError::Connect {
                destination: destination.to_string(),
                source,
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        debug!("Connected directly to {}", destination);
        Ok(Box::new(stream))
    }
}
