//! Logical streams carried over a physical connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::physical::PhysicalConn;
use super::MuxError;

/// State of one stream shared between its handle and the physical
/// connection's stream map.
pub(crate) struct StreamShared {
    id: u32,
    cancel: CancellationToken,
    error: Mutex<Option<MuxError>>,
    inbound: mpsc::UnboundedSender<Bytes>,
}

impl StreamShared {
    pub(crate) fn new(id: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (inbound, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Self {
            id,
            cancel: CancellationToken::new(),
            error: Mutex::new(None),
            inbound,
        });
        (shared, rx)
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    /// Cancel the stream, keeping the first error recorded
    pub(crate) fn cancel_with(&self, err: MuxError) {
        {
            let mut slot = self.error.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.cancel.cancel();
    }

    pub(crate) fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn error(&self) -> MuxError {
        self.error.lock().clone().unwrap_or(MuxError::StreamClosed)
    }

    /// Hand an inbound frame to the stream's FIFO
    pub(crate) fn deliver(&self, frame: Bytes) -> bool {
        !self.cancel.is_cancelled() && self.inbound.send(frame).is_ok()
    }
}

/// A logical stream multiplexed over a shared physical connection.
///
/// Frames written here must already carry the stream id in the form the
/// endpoint's [`FrameParser`](crate::codec::FrameParser) expects; replies are
/// routed back by that id. Dropping the handle closes the stream.
pub struct VirtualConnection {
    shared: Arc<StreamShared>,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    conn: Arc<PhysicalConn>,
    closed: AtomicBool,
}

impl VirtualConnection {
    pub(crate) fn new(
        shared: Arc<StreamShared>,
        inbound: mpsc::UnboundedReceiver<Bytes>,
        conn: Arc<PhysicalConn>,
    ) -> Self {
        Self {
            shared,
            inbound,
            conn,
            closed: AtomicBool::new(false),
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.shared.id
    }

    /// Queue one framed message on the physical connection.
    ///
    /// Waits for queue space unless the pool is configured to drop when
    /// full. Fails with the stream's error once it has been cancelled.
    pub async fn write(&self, frame: impl Into<Bytes>) -> Result<(), MuxError> {
        if self.shared.is_cancelled() {
            return Err(self.shared.error());
        }
        self.conn.enqueue(frame.into(), &self.shared).await
    }

    /// Wait for the next inbound frame.
    ///
    /// Frames already received are returned before a cancellation error.
    pub async fn read(&mut self) -> Result<Bytes, MuxError> {
        tokio::select! {
            biased;
            frame = self.inbound.recv() => frame.ok_or_else(|| self.shared.error()),
            _ = self.shared.cancel.cancelled() => {
                match self.inbound.try_recv() {
                    Ok(frame) => Ok(frame),
                    Err(_) => Err(self.shared.error()),
                }
            }
        }
    }

    /// Close the stream. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.cancel_with(MuxError::StreamClosed);
        self.conn.remove_stream(&self.shared);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.shared.is_cancelled()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.conn.local_addr()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.conn.remote_addr()
    }
}

impl Drop for VirtualConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for VirtualConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualConnection")
            .field("stream_id", &self.shared.id)
            .field("conn", &self.conn.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_cancel_error_wins() {
        let (shared, _rx) = StreamShared::new(3);
        shared.cancel_with(MuxError::DuplicateStreamId(3));
        shared.cancel_with(MuxError::StreamClosed);
        assert!(shared.is_cancelled());
        assert!(matches!(shared.error(), MuxError::DuplicateStreamId(3)));
    }

    #[test]
    fn test_deliver_after_cancel_is_dropped() {
        let (shared, mut rx) = StreamShared::new(1);
        assert!(shared.deliver(Bytes::from_static(b"a")));
        shared.cancel_with(MuxError::ConnClosed);
        assert!(!shared.deliver(Bytes::from_static(b"b")));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"a"));
        assert!(rx.try_recv().is_err());
    }
}
