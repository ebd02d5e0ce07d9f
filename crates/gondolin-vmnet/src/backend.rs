#![forbid(unsafe_code)]

use std::future::Future;
use std::io;
use std::pin::Pin;
use tokio::sync::mpsc;

pub type FrameFuture<'a> = Pin<Box<dyn Future<Output = Option<Vec<u8>>> + Send + 'a>>;
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>>;

/// The virtio-net boundary: a bidirectional stream of opaque Ethernet
/// frames. Nothing about queue structure is assumed beyond "write frame,
/// await frame"; `recv` returning `None` means the guest NIC is gone.
pub trait FrameBackend: Send {
    fn recv(&mut self) -> FrameFuture<'_>;
    fn send(&mut self, frame: Vec<u8>) -> SendFuture<'_>;
}

/// In-process backend over a pair of bounded channels. Used by tests and
/// by embeddings that already own the virtio queue pumping.
pub struct ChannelBackend {
    rx: mpsc::Receiver<Vec<u8>>,
    tx: mpsc::Sender<Vec<u8>>,
}

impl ChannelBackend {
    /// Returns the backend plus the guest-side handles: a sender for
    /// frames from the guest NIC and a receiver for frames to it.
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        let (guest_tx, rx) = mpsc::channel(capacity);
        let (tx, host_rx) = mpsc::channel(capacity);
        (Self { rx, tx }, guest_tx, host_rx)
    }
}

impl FrameBackend for ChannelBackend {
    fn recv(&mut self) -> FrameFuture<'_> {
        Box::pin(async move { self.rx.recv().await })
    }

    fn send(&mut self, frame: Vec<u8>) -> SendFuture<'_> {
        Box::pin(async move {
            self.tx
                .send(frame)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "backend closed"))
        })
    }
}
