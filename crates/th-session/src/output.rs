use tracing::debug;

use crate::message::ServerMessage;

/// Outbound half of a session.
///
/// Every producer (the receive loop, the output pump, the exit waiter) pushes
/// into the same FIFO channel and a single consumer owns the socket, so frames
/// are totally ordered and never interleaved.
#[derive(Debug, Clone)]
pub struct OutputWriter {
    tx: flume::Sender<ServerMessage>,
}

impl OutputWriter {
    /// Create a writer and the receiver the transport drains.
    pub fn channel() -> (Self, flume::Receiver<ServerMessage>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }

    /// Queue one `{"output": ...}` frame. Returns `false` once the transport
    /// has gone away.
    pub fn send(&self, text: impl Into<String>) -> bool {
        let text = text.into();
        if text.is_empty() {
            return true;
        }
        if self.tx.send(ServerMessage::output(text)).is_err() {
            debug!("output dropped, transport closed");
            return false;
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_disconnected()
    }
}
