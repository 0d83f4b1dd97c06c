use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const COPY_BUF_SIZE: usize = 8 * 1024;

/// What one direction of a relay carried before it ended
#[derive(Debug, Default)]
pub struct Transfer {
    /// Bytes written to the destination, including those before an error
    pub bytes: u64,
    /// Set when the direction ended with a read or write error instead of EOF
    pub error: Option<io::Error>,
}

/// Result of one relay, per direction
#[derive(Debug)]
pub struct RelayOutcome {
    /// From the first stream into the second
    pub a_to_b: Transfer,
    /// From the second stream into the first
    pub b_to_a: Transfer,
}

impl RelayOutcome {
    pub fn bytes_a_to_b(&self) -> u64 {
        self.a_to_b.bytes
    }

    pub fn bytes_b_to_a(&self) -> u64 {
        self.b_to_a.bytes
    }
}

/// Copy bytes between two duplex streams until both directions are done.
///
/// Each direction runs until its source reaches EOF or fails, then shuts down
/// the write side of its destination so the peer sees end-of-data. A failure
/// in one direction leaves the other one running. Both streams are dropped
/// (closed) once both directions have finished.
pub async fn relay<A, B>(a: A, b: B) -> RelayOutcome
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let (a_to_b, b_to_a) = tokio::join!(
        pipe(&mut a_read, &mut b_write),
        pipe(&mut b_read, &mut a_write),
    );

    match &a_to_b.error {
        None => debug!("a -> b: {} bytes", a_to_b.bytes),
        Some(e) => debug!("a -> b error after {} bytes: {}", a_to_b.bytes, e),
    }
    match &b_to_a.error {
        None => debug!("b -> a: {} bytes", b_to_a.bytes),
        Some(e) => debug!("b -> a error after {} bytes: {}", b_to_a.bytes, e),
    }

    RelayOutcome { a_to_b, b_to_a }
}

async fn pipe<R, W>(reader: &mut R, writer: &mut W) -> Transfer
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut transfer = Transfer::default();

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                transfer.error = Some(e);
                break;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            transfer.error = Some(e);
            break;
        }
        transfer.bytes += n as u64;
    }

    // The peer may already be gone; a failed shutdown changes nothing here.
    let _ = writer.shutdown().await;
    transfer
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, ReadBuf};

    /// Stream whose reads always fail and whose writes are discarded
    struct Broken;

    impl AsyncRead for Broken {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "reset by peer",
            )))
        }
    }

    impl AsyncWrite for Broken {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Yields `data` once, then fails like a reset connection
    struct ResetAfter {
        data: Option<Vec<u8>>,
    }

    impl AsyncRead for ResetAfter {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.data.take() {
                Some(data) => {
                    buf.put_slice(&data);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "reset by peer",
                ))),
            }
        }
    }

    impl AsyncWrite for ResetAfter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_counts_bytes_before_reset() {
        let (b, mut b_peer) = tokio::io::duplex(16 * 1024);
        let source = ResetAfter {
            data: Some(b"partial".to_vec()),
        };

        let relay = tokio::spawn(relay(source, b));

        let mut received = [0u8; 7];
        b_peer.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"partial");
        b_peer.shutdown().await.unwrap();

        let outcome = relay.await.unwrap();
        assert!(outcome.a_to_b.error.is_some());
        assert_eq!(outcome.bytes_a_to_b(), 7);
        assert_eq!(outcome.bytes_b_to_a(), 0);
    }

    #[tokio::test]
    async fn test_waits_for_both_directions() {
        let (a, mut a_peer) = tokio::io::duplex(16 * 1024);
        let (b, mut b_peer) = tokio::io::duplex(16 * 1024);

        let relay = tokio::spawn(relay(a, b));

        let request: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let response: Vec<u8> = (0..3000u32).map(|i| (i % 253) as u8).collect();

        // a side sends everything and closes its write half first
        a_peer.write_all(&request).await.unwrap();
        a_peer.shutdown().await.unwrap();

        let mut received = vec![0u8; request.len()];
        b_peer.read_exact(&mut received).await.unwrap();
        assert_eq!(received, request);

        // b has seen EOF from a, but the relay must still be running
        let mut eof = [0u8; 1];
        assert_eq!(b_peer.read(&mut eof).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!relay.is_finished());

        b_peer.write_all(&response).await.unwrap();
        b_peer.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        a_peer.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, response);

        let outcome = relay.await.unwrap();
        assert_eq!(outcome.bytes_a_to_b(), request.len() as u64);
        assert_eq!(outcome.bytes_b_to_a(), response.len() as u64);
    }

    #[tokio::test]
    async fn test_error_does_not_cancel_other_direction() {
        let (b, mut b_peer) = tokio::io::duplex(16 * 1024);

        let relay = tokio::spawn(relay(Broken, b));

        // Broken -> b fails immediately; b -> Broken must keep copying
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!relay.is_finished());

        b_peer.write_all(b"still flowing").await.unwrap();
        b_peer.shutdown().await.unwrap();

        let outcome = relay.await.unwrap();
        assert!(outcome.a_to_b.error.is_some());
        assert!(outcome.b_to_a.error.is_none());
        assert_eq!(outcome.bytes_b_to_a(), 13);
    }

    #[tokio::test]
    async fn test_closes_both_streams() {
        let (a, mut a_peer) = tokio::io::duplex(16 * 1024);
        let (b, mut b_peer) = tokio::io::duplex(16 * 1024);

        a_peer.shutdown().await.unwrap();
        b_peer.shutdown().await.unwrap();

        relay(a, b).await;

        let mut buf = [0u8; 8];
        assert_eq!(a_peer.read(&mut buf).await.unwrap(), 0);
        assert_eq!(b_peer.read(&mut buf).await.unwrap(), 0);
        assert!(a_peer.write_all(b"x").await.is_err());
        assert!(b_peer.write_all(b"x").await.is_err());
    }
}
