use std::io::{self, Read};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

const READ_CHUNK: usize = 1024;

/// Async reader over a blocking source that is read on its own thread.
///
/// `tokio::io::stdin` reads on the blocking pool, and the runtime waits for
/// that read when it shuts down. This thread is never waited for, so a user
/// sitting at a prompt does not keep the process alive after Ctrl+C.
pub struct ThreadedReader {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl ThreadedReader {
    pub fn spawn<R>(mut source: R) -> Self
    where
        R: Read + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(1);

        std::thread::spawn(move || {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                let chunk = match source.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => Ok(buf[..n].to_vec()),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => Err(e),
                };
                let failed = chunk.is_err();
                // The receiver is gone once the reader is dropped
                if tx.blocking_send(chunk).is_err() || failed {
                    break;
                }
            }
        });

        Self {
            rx,
            chunk: Vec::new(),
            pos: 0,
        }
    }

    pub fn stdin() -> Self {
        Self::spawn(io::stdin())
    }
}

impl AsyncRead for ThreadedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if this.pos == this.chunk.len() {
            match ready!(this.rx.poll_recv(cx)) {
                Some(Ok(chunk)) => {
                    this.chunk = chunk;
                    this.pos = 0;
                }
                Some(Err(e)) => return Poll::Ready(Err(e)),
                // EOF
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = (this.chunk.len() - this.pos).min(buf.remaining());
        buf.put_slice(&this.chunk[this.pos..this.pos + n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}
