//! In-memory transport used by tests and embedding harnesses.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{RawTransport, TransportConnector};
use crate::error::TransportError;

/// One end of an in-memory transport pair.
pub struct MockTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    connected: Arc<AtomicBool>,
}

impl MockTransport {
    /// Create a connected pair; bytes sent on one end arrive on the other.
    pub fn pair() -> (MockTransport, MockTransport) {
        let (tx_a, rx_b) = mpsc::unbounded_channel();
        let (tx_b, rx_a) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        (
            MockTransport {
                tx: tx_a,
                rx: rx_a,
                connected: connected.clone(),
            },
            MockTransport {
                tx: tx_b,
                rx: rx_b,
                connected,
            },
        )
    }

    /// Handle that can sever the pair from outside, simulating a drop.
    pub fn kill_switch(&self) -> KillSwitch {
        KillSwitch {
            connected: self.connected.clone(),
        }
    }
}

#[derive(Clone)]
pub struct KillSwitch {
    connected: Arc<AtomicBool>,
}

impl KillSwitch {
    pub fn kill(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl RawTransport for MockTransport {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        self.tx
            .send(data.to_vec())
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            if !self.connected.load(Ordering::SeqCst) {
                return None;
            }
            tokio::select! {
                data = self.rx.recv() => return data,
                _ = tokio::time::sleep(std::time::Duration::from_millis(10)) => {}
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Connector handing out pre-seeded transports, one per connect call.
#[derive(Default)]
pub struct MockConnector {
    outcomes: Mutex<VecDeque<Result<MockTransport, TransportError>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_transport(&self, transport: MockTransport) {
        self.outcomes.lock().push_back(Ok(transport));
    }

    pub fn push_error(&self, err: TransportError) {
        self.outcomes.lock().push_back(Err(err));
    }

    pub fn pending(&self) -> usize {
        self.outcomes.lock().len()
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn RawTransport>, TransportError> {
        match self.outcomes.lock().pop_front() {
            Some(Ok(transport)) => Ok(Box::new(transport)),
            Some(Err(err)) => Err(err),
            None => Err(TransportError::Socket("no scripted transport".into())),
        }
    }
}
