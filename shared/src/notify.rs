use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::protocol::ClientMessage;

/// Fan-out of status messages to every page context subscribed right now.
/// Late subscribers see nothing sent before they joined.
#[derive(Clone, Debug)]
pub struct ClientNotifier {
    tx: broadcast::Sender<ClientMessage>,
}

impl ClientNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> PageSubscription {
        PageSubscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Returns how many page contexts received the message.
    pub fn broadcast(&self, message: ClientMessage) -> usize {
        match self.tx.send(message) {
            Ok(delivered) => delivered,
            Err(_) => {
                debug!("No page contexts subscribed, status message dropped");
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One page context's view of the broadcast stream.
#[derive(Debug)]
pub struct PageSubscription {
    rx: broadcast::Receiver<ClientMessage>,
}

impl PageSubscription {
    /// Next message, skipping over anything lost to lag. `None` once the
    /// notifier is gone.
    pub async fn recv(&mut self) -> Option<ClientMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Page subscription lagged, status messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<ClientMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(message) => return Some(message),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Page subscription lagged, status messages dropped");
                }
                Err(_) => return None,
            }
        }
    }
}
