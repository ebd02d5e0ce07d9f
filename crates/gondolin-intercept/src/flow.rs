#![forbid(unsafe_code)]

use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

/// Ordered bytes (and lifecycle events) arriving from the guest side of
/// one TCP flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestInput {
    Data(Vec<u8>),
    /// Guest sent FIN: no more input.
    Fin,
    /// Connection died underneath us.
    Reset,
}

/// What the flow task asks the session driver to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowOutput {
    /// Queue bytes toward the guest.
    Data(Vec<u8>),
    /// Delivered bytes were consumed; reopens the TCP receive window.
    Consumed(usize),
    /// Graceful FIN toward the guest.
    Shutdown,
    /// Abort with RST.
    Abort,
}

/// The flow task's handle on one guest TCP connection.
///
/// Reading implicitly acknowledges consumption (the channel is the
/// receive buffer; once a chunk is pulled it is being processed), which
/// keeps the advertised TCP window honest. Writing acquires byte credits
/// that the driver releases as the guest ACKs, so a stalled guest stalls
/// the producer instead of growing a queue.
pub struct FlowChannel {
    rx: mpsc::UnboundedReceiver<GuestInput>,
    tx: mpsc::UnboundedSender<FlowOutput>,
    credit: Arc<Semaphore>,
    eof: bool,
    reset: bool,
}

impl FlowChannel {
    pub fn new(
        rx: mpsc::UnboundedReceiver<GuestInput>,
        tx: mpsc::UnboundedSender<FlowOutput>,
        credit: Arc<Semaphore>,
    ) -> Self {
        Self {
            rx,
            tx,
            credit,
            eof: false,
            reset: false,
        }
    }

    pub fn is_reset(&self) -> bool {
        self.reset
    }

    /// Next chunk of guest bytes; `None` on EOF (FIN or reset).
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        if self.eof {
            return None;
        }
        match self.rx.recv().await {
            Some(GuestInput::Data(data)) => {
                let _ = self.tx.send(FlowOutput::Consumed(data.len()));
                Some(data)
            }
            Some(GuestInput::Fin) | None => {
                self.eof = true;
                None
            }
            Some(GuestInput::Reset) => {
                self.eof = true;
                self.reset = true;
                None
            }
        }
    }

    /// Send bytes toward the guest, waiting for send credit.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), crate::InterceptError> {
        if data.is_empty() {
            return Ok(());
        }
        // Credits are repaid by the driver on ACK via `add_permits`; a
        // closed semaphore means the connection is gone.
        let permits = u32::try_from(data.len()).unwrap_or(u32::MAX);
        let permit = self
            .credit
            .acquire_many(permits)
            .await
            .map_err(|_| crate::InterceptError::GuestClosed)?;
        permit.forget();
        self.tx
            .send(FlowOutput::Data(data))
            .map_err(|_| crate::InterceptError::GuestClosed)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(FlowOutput::Shutdown);
    }

    pub fn abort(&self) {
        let _ = self.tx.send(FlowOutput::Abort);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_reports_consumption() {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let mut chan = FlowChannel::new(in_rx, out_tx, Arc::new(Semaphore::new(1024)));

        in_tx.send(GuestInput::Data(b"abc".to_vec())).unwrap();
        assert_eq!(chan.read().await, Some(b"abc".to_vec()));
        assert_eq!(out_rx.recv().await, Some(FlowOutput::Consumed(3)));

        in_tx.send(GuestInput::Fin).unwrap();
        assert_eq!(chan.read().await, None);
        assert!(!chan.is_reset());
    }

    #[tokio::test]
    async fn write_blocks_until_credit_is_released() {
        let (_in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let credit = Arc::new(Semaphore::new(4));
        let chan = FlowChannel::new(in_rx, out_tx, credit.clone());

        chan.write(b"1234".to_vec()).await.unwrap();
        assert_eq!(out_rx.recv().await, Some(FlowOutput::Data(b"1234".to_vec())));

        // Credit exhausted: the next write parks until an ACK repays it.
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            chan.write(b"5".to_vec()),
        )
        .await;
        assert!(pending.is_err(), "write must stall without credit");

        credit.add_permits(4);
        chan.write(b"5".to_vec()).await.unwrap();
        assert_eq!(out_rx.recv().await, Some(FlowOutput::Data(b"5".to_vec())));
    }
}
