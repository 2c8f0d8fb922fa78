//! Transport layer for host ↔ sandbox relay communication.
//!
//! One long-lived websocket per session carries binary frames produced by
//! [`codec`]. Each endpoint owns its socket through a single writer task;
//! everything else sends through an [`Outbound`] handle, which serializes
//! sends and drops (with a log line) anything sent after the socket closed.

pub mod codec;
pub mod protocol;

pub use codec::{decode, encode, encode_kind, CodecError, PROTOCOL_VERSION};
pub use protocol::{Message, MessageKind};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Maximum frame size (10 MiB), enforced on both sides before decoding.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Sending half of a connection's writer task.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl Outbound {
    /// Create a handle plus the receiver its writer task drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Encode and queue a message for the socket.
    ///
    /// Returns `false` when the message could not be encoded or the socket
    /// is gone. Nothing is retried.
    pub fn send(&self, msg: &Message) -> bool {
        let frame = match codec::encode(msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = %msg.kind(), error = %e, "Failed to encode outgoing message");
                return false;
            }
        };
        if self.tx.send(frame).is_err() {
            debug!(kind = %msg.kind(), "Not connected, dropping message");
            return false;
        }
        true
    }

    /// Queue a frame that was already encoded.
    pub fn send_frame(&self, frame: Bytes) -> bool {
        if self.tx.send(frame).is_err() {
            debug!("Not connected, dropping frame");
            return false;
        }
        true
    }

    /// Whether the writer task is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outbound_encodes_frames() {
        let (outbound, mut rx) = Outbound::channel();
        assert!(outbound.send(&Message::Ping { id: "p1".into() }));

        let frame = rx.recv().await.unwrap();
        assert_eq!(decode(&frame).unwrap(), Message::Ping { id: "p1".into() });
    }

    #[tokio::test]
    async fn outbound_drops_after_close() {
        let (outbound, rx) = Outbound::channel();
        drop(rx);
        assert!(outbound.is_closed());
        assert!(!outbound.send(&Message::Ping { id: "p1".into() }));
    }

    #[tokio::test]
    async fn outbound_refuses_invalid_messages() {
        let (outbound, mut rx) = Outbound::channel();
        assert!(!outbound.send(&Message::Ping { id: String::new() }));
        assert!(rx.try_recv().is_err());
    }
}
