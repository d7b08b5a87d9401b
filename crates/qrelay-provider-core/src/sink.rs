use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Write side of the client byte channel.
///
/// Adapters write every client-facing byte through this, including SSE
/// framing. The channel is bounded so client back-pressure propagates to the
/// upstream read loop. A disconnected client turns writes into no-ops: the
/// adapter keeps draining the upstream so the terminal usage event can still
/// be captured and settled.
#[derive(Debug)]
pub struct ClientSink {
    tx: mpsc::Sender<Bytes>,
    closed: AtomicBool,
}

impl ClientSink {
    /// Create a sink plus the receiver the HTTP layer turns into the
    /// response body. Capacity is small on purpose: at most one chunk is
    /// buffered beyond the one in flight.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }

    pub async fn send_bytes(&self, bytes: Bytes) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        if self.tx.send(bytes).await.is_err() {
            self.closed.store(true, Ordering::Relaxed);
        }
    }

    /// Write one SSE chunk: `data: {json}\n\n`.
    pub async fn send_event<T: Serialize>(&self, value: &T) {
        let Ok(payload) = serde_json::to_vec(value) else {
            return;
        };
        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(b"data: ");
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(b"\n\n");
        self.send_bytes(Bytes::from(frame)).await;
    }

    /// Write the terminal `data: [DONE]\n\n` marker.
    pub async fn send_done(&self) {
        self.send_bytes(Bytes::from_static(DONE_FRAME)).await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_events_and_done() {
        let (sink, mut rx) = ClientSink::channel(8);
        sink.send_event(&serde_json::json!({"a": 1})).await;
        sink.send_done().await;
        assert_eq!(rx.recv().await.unwrap(), Bytes::from("data: {\"a\":1}\n\n"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(DONE_FRAME));
    }

    #[tokio::test]
    async fn disconnected_client_is_tolerated() {
        let (sink, rx) = ClientSink::channel(1);
        drop(rx);
        sink.send_event(&serde_json::json!({"a": 1})).await;
        assert!(sink.is_closed());
        // further writes are silent no-ops
        sink.send_done().await;
    }
}
