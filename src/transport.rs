//! # Multiplexed Transport Seam
//!
//! A session runs over exactly one physical connection, split into named
//! logical channels by a multiplexer. This module defines that capability
//! as the [`Transport`] trait and ships [`MemoryTransport`], an in-process
//! implementation used by tests and the demo binary.
//!
//! ## Channel Semantics
//!
//! - Opening the same name on both ends yields the two halves of one duplex
//!   stream, regardless of which end opens first.
//! - Opening a name that this end already has pending is a collision and
//!   fails with `AddrInUse`. A pending half that was dropped before the
//!   other end joined releases its name.
//! - Distinct names flow independently: a stalled channel does not block
//!   any other.
//! - Closing the transport tears down every open channel: reads drain
//!   already buffered bytes and then see end-of-stream, writes fail with
//!   `BrokenPipe`.
//!
//! ## Channel Wrapper
//!
//! [`Channel`] wraps a raw stream with its name and an optional end hook.
//! The hook fires exactly once, either when a read observes end-of-stream
//! or when the channel is dropped. Sessions use it to release a network
//! slot when its data channel ends.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::watch;
use tracing::{debug, trace};

/// Per-direction buffer of an in-memory channel.
pub const MEMORY_CHANNEL_BUFFER: usize = 64 * 1024;

/// A bidirectional byte stream.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Duplex for T {}

/// Raw stream as produced by a transport or a relay connector.
pub type BoxedDuplex = Box<dyn Duplex>;

/// Named logical channels over one physical connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open (or join) the logical channel called `name`.
    async fn open_channel(&self, name: &str) -> io::Result<BoxedDuplex>;

    /// Watch that flips to `true` once the physical connection is gone.
    fn closed(&self) -> watch::Receiver<bool>;

    /// Tear down the physical connection. Idempotent.
    async fn close(&self);
}

type EndHook = Box<dyn FnOnce() + Send>;

/// A logical channel handed to the application.
pub struct Channel {
    name: String,
    inner: BoxedDuplex,
    on_end: Option<EndHook>,
}

impl Channel {
    pub fn new(name: impl Into<String>, inner: BoxedDuplex) -> Self {
        Self {
            name: name.into(),
            inner,
            on_end: None,
        }
    }

    /// Attach a callback fired once at end-of-stream or drop.
    pub fn with_end_hook<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_end = Some(Box::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn fire_end(&mut self) {
        if let Some(hook) = self.on_end.take() {
            trace!(channel = %self.name, "channel ended");
            hook();
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("ended", &self.on_end.is_none())
            .finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.fire_end();
    }
}

impl AsyncRead for Channel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll
            && buf.filled().len() == before
            && buf.remaining() > 0
        {
            this.fire_end();
        }
        poll
    }
}

impl AsyncWrite for Channel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

// ============================================================================
// MemoryTransport
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    A,
    B,
}

/// A half waiting for the other end to join.
struct PendingHalf {
    opener: Side,
    half: DuplexStream,
    opener_alive: Weak<()>,
}

#[derive(Default)]
struct Shared {
    /// Halves waiting for the other end, keyed by channel name.
    pending: HashMap<String, PendingHalf>,
    closed: bool,
}

type Teardown = Pin<Box<dyn Future<Output = ()> + Send>>;

fn teardown_signal(mut closed: watch::Receiver<bool>) -> Teardown {
    Box::pin(async move {
        let outcome = closed.wait_for(|closed| *closed).await.map(|_| ());
        if outcome.is_err() {
            // Both transport ends dropped without closing: the stream lives on.
            std::future::pending::<()>().await;
        }
    })
}

/// One half of an in-memory channel, torn down with its transport.
struct MemoryStream {
    inner: DuplexStream,
    teardown: Teardown,
    torn_down: bool,
    alive: Arc<()>,
}

impl MemoryStream {
    fn new(inner: DuplexStream, closed: watch::Receiver<bool>) -> Self {
        Self {
            inner,
            teardown: teardown_signal(closed),
            torn_down: false,
            alive: Arc::new(()),
        }
    }

    fn poll_torn_down(&mut self, cx: &mut Context<'_>) -> bool {
        if !self.torn_down && self.teardown.as_mut().poll(cx).is_ready() {
            self.torn_down = true;
        }
        self.torn_down
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Pending if this.poll_torn_down(cx) => Poll::Ready(Ok(())),
            poll => poll,
        }
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_torn_down(cx) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transport is closed",
            )));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_torn_down(cx) {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// One end of an in-process multiplexed connection.
pub struct MemoryTransport {
    side: Side,
    shared: Arc<Mutex<Shared>>,
    closed_tx: Arc<watch::Sender<bool>>,
    buffer: usize,
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("side", &self.side)
            .field("closed", &*self.closed_tx.borrow())
            .finish()
    }
}

impl MemoryTransport {
    /// Create both ends of a connection.
    pub fn pair() -> (Self, Self) {
        Self::pair_with_buffer(MEMORY_CHANNEL_BUFFER)
    }

    pub fn pair_with_buffer(buffer: usize) -> (Self, Self) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let (closed_tx, _) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        let a = Self {
            side: Side::A,
            shared: shared.clone(),
            closed_tx: closed_tx.clone(),
            buffer,
        };
        let b = Self {
            side: Side::B,
            shared,
            closed_tx,
            buffer,
        };
        (a, b)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open_channel(&self, name: &str) -> io::Result<BoxedDuplex> {
        let mut shared = self
            .shared
            .lock()
            .map_err(|_| io::Error::other("memory transport lock poisoned"))?;
        if shared.closed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport is closed",
            ));
        }

        let waiting = shared
            .pending
            .remove(name)
            .filter(|pending| pending.opener_alive.strong_count() > 0);
        match waiting {
            Some(pending) if pending.opener != self.side => {
                trace!(channel = name, side = ?self.side, "joined channel");
                Ok(Box::new(MemoryStream::new(pending.half, self.closed_tx.subscribe())))
            }
            Some(pending) => {
                shared.pending.insert(name.to_string(), pending);
                Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("channel \"{name}\" is already open"),
                ))
            }
            None => {
                let (ours, theirs) = tokio::io::duplex(self.buffer);
                let stream = MemoryStream::new(ours, self.closed_tx.subscribe());
                shared.pending.insert(
                    name.to_string(),
                    PendingHalf {
                        opener: self.side,
                        half: theirs,
                        opener_alive: Arc::downgrade(&stream.alive),
                    },
                );
                trace!(channel = name, side = ?self.side, "opened channel");
                Ok(Box::new(stream))
            }
        }
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    async fn close(&self) {
        let dropped = match self.shared.lock() {
            Ok(mut shared) => {
                if shared.closed {
                    return;
                }
                shared.closed = true;
                std::mem::take(&mut shared.pending).len()
            }
            Err(_) => 0,
        };
        debug!(side = ?self.side, pending_dropped = dropped, "memory transport closed");
        self.closed_tx.send_replace(true);
    }
}
