//! Virtual interface plumbing.
//!
//! The engine reads datagrams from any `AsyncRead` that yields exactly one
//! datagram per read, and writes through a single writer task that owns an
//! `AsyncWrite` accepting one datagram per write. Three adapters are provided:
//! a raw TUN file descriptor, a queue the host pushes inbound packets into,
//! and a writer that hands outbound packets to a host callback.

use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, oneshot};

#[cfg(unix)]
pub use self::tun_fd::TunFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("interface writer has stopped")]
pub struct DeviceClosed;

/// Cloneable handle for queueing datagrams toward the interface.
#[derive(Clone, Debug)]
pub struct DeviceWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl DeviceWriter {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queues a datagram, waiting for room if the writer is behind.
    pub async fn send(&self, datagram: Vec<u8>) -> Result<(), DeviceClosed> {
        self.tx.send(datagram).await.map_err(|_| DeviceClosed)
    }

    /// Queues a datagram without waiting. Used from the dispatcher, which
    /// must never block on the writer.
    pub fn try_send(&self, datagram: Vec<u8>) -> bool {
        match self.tx.try_send(datagram) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                logger::rate_limited_error(
                    ErrorCategory::DeviceBackpressure,
                    "interface writer queue full; dropping datagram",
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Owns the interface write half. Writes whole datagrams in queue order
/// until every [`DeviceWriter`] is dropped or `stop` fires, then drains
/// whatever is already queued. Returns the number of datagrams written.
pub async fn write_loop<W>(
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut sink: W,
    mut stop: oneshot::Receiver<()>,
) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            next = rx.recv() => match next {
                Some(datagram) => {
                    write_datagram(&mut sink, &datagram).await?;
                    written += 1;
                }
                None => break,
            },
        }
    }
    rx.close();
    while let Ok(datagram) = rx.try_recv() {
        write_datagram(&mut sink, &datagram).await?;
        written += 1;
    }
    sink.flush().await?;
    logger::breadcrumb(
        BreadcrumbFlags::DEVICE,
        format!("interface writer stopped after {written} datagrams"),
    );
    Ok(written)
}

async fn write_datagram<W: AsyncWrite + Unpin>(sink: &mut W, datagram: &[u8]) -> io::Result<()> {
    let written = sink.write(datagram).await?;
    if written != datagram.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short datagram write ({written} of {})", datagram.len()),
        ));
    }
    Ok(())
}

/// Creates an inbound queue for hosts that deliver packets by calling in
/// rather than handing over a file descriptor.
pub fn packet_queue(mtu: usize, capacity: usize) -> (QueueHandle, PacketQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(16));
    (QueueHandle { tx, mtu }, PacketQueue { rx })
}

/// Producer side of a [`PacketQueue`].
#[derive(Clone, Debug)]
pub struct QueueHandle {
    tx: mpsc::Sender<Vec<u8>>,
    mtu: usize,
}

impl QueueHandle {
    /// Pushes a copy of `packet`, truncated to the MTU. Returns `false` if
    /// the queue is full or the engine has stopped reading.
    pub fn push_inbound(&self, packet: &[u8]) -> bool {
        if packet.is_empty() {
            return true;
        }
        let capped = packet.len().min(self.mtu);
        match self.tx.try_send(packet[..capped].to_vec()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                logger::rate_limited_error(
                    ErrorCategory::DeviceBackpressure,
                    "inbound packet queue full; dropping packet",
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Reader side: each read returns one pushed datagram. Reads return EOF once
/// every [`QueueHandle`] is dropped.
#[derive(Debug)]
pub struct PacketQueue {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl AsyncRead for PacketQueue {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().rx.poll_recv(cx) {
            Poll::Ready(Some(packet)) => {
                let len = packet.len().min(buf.remaining());
                buf.put_slice(&packet[..len]);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// `AsyncWrite` that passes every datagram to a host callback.
pub struct EmitWriter<F> {
    emit: F,
}

impl<F> EmitWriter<F>
where
    F: FnMut(&[u8]) -> io::Result<()>,
{
    pub fn new(emit: F) -> Self {
        Self { emit }
    }
}

impl<F> AsyncWrite for EmitWriter<F>
where
    F: FnMut(&[u8]) -> io::Result<()> + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        Poll::Ready((this.emit)(buf).map(|()| buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(unix)]
mod tun_fd {
    use std::io;
    use std::os::fd::{AsRawFd, OwnedFd, RawFd};
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{ready, Context, Poll};
    use tokio::io::unix::AsyncFd;
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    /// Non-blocking TUN descriptor. Clones share the descriptor so one task
    /// can read while the writer task writes.
    #[derive(Clone, Debug)]
    pub struct TunFd {
        inner: Arc<AsyncFd<OwnedFd>>,
    }

    impl TunFd {
        /// Takes ownership of `fd` and switches it to non-blocking mode.
        /// Must be called inside a tokio runtime.
        pub fn new(fd: OwnedFd) -> io::Result<Self> {
            set_nonblocking(fd.as_raw_fd())?;
            Ok(Self {
                inner: Arc::new(AsyncFd::new(fd)?),
            })
        }
    }

    fn set_nonblocking(fd: RawFd) -> io::Result<()> {
        // Safety: fcntl on a descriptor we hold has no memory effects.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn cvt(result: isize) -> io::Result<usize> {
        if result < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(result as usize)
        }
    }

    impl AsyncRead for TunFd {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            loop {
                let mut guard = ready!(self.inner.poll_read_ready(cx))?;
                let unfilled = buf.initialize_unfilled();
                let result = guard.try_io(|inner| {
                    // Safety: `unfilled` is a valid writable region of the given length.
                    cvt(unsafe {
                        libc::read(
                            inner.as_raw_fd(),
                            unfilled.as_mut_ptr().cast(),
                            unfilled.len(),
                        )
                    })
                });
                match result {
                    Ok(Ok(read)) => {
                        buf.advance(read);
                        return Poll::Ready(Ok(()));
                    }
                    Ok(Err(error)) => return Poll::Ready(Err(error)),
                    Err(_would_block) => continue,
                }
            }
        }
    }

    impl AsyncWrite for TunFd {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            loop {
                let mut guard = ready!(self.inner.poll_write_ready(cx))?;
                let result = guard.try_io(|inner| {
                    // Safety: `buf` is a valid readable region of the given length.
                    cvt(unsafe { libc::write(inner.as_raw_fd(), buf.as_ptr().cast(), buf.len()) })
                });
                match result {
                    Ok(result) => return Poll::Ready(result),
                    Err(_would_block) => continue,
                }
            }
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }
}
