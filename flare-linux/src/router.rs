//! Delivery of accepted messages: one listener slot for the application, plus a
//! post-delivery queue the mesh service drains for persistence and relaying.

use flare_core::{DeviceId, MessageEnvelope};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub envelope: MessageEnvelope,
    /// Neighbour the message arrived from.
    pub via: Option<DeviceId>,
}

pub struct Router {
    listener: Mutex<Option<mpsc::UnboundedSender<MessageEnvelope>>>,
    post: mpsc::UnboundedSender<Delivered>,
}

impl Router {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivered>) {
        let (post, rx) = mpsc::unbounded_channel();
        (
            Self {
                listener: Mutex::new(None),
                post,
            },
            rx,
        )
    }

    /// Replace the application listener. There is at most one.
    pub async fn set_listener(&self) -> mpsc::UnboundedReceiver<MessageEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.listener.lock().await = Some(tx);
        rx
    }

    pub async fn clear_listener(&self) {
        self.listener.lock().await.take();
    }

    pub async fn route(&self, envelope: MessageEnvelope, via: Option<DeviceId>) {
        {
            let mut slot = self.listener.lock().await;
            if let Some(tx) = slot.as_ref() {
                if tx.send(envelope.clone()).is_err() {
                    debug!("message listener went away");
                    *slot = None;
                }
            }
        }
        let _ = self.post.send(Delivered { envelope, via });
    }
}
