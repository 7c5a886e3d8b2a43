//! Keep-alive output for streaming callers held in the admission wait.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{Error, Result};

/// Default SSE comment used as a ping.
pub const DEFAULT_PING_FRAME: &str = ": ping\n\n";

/// Headers that switch a response into an event stream.
pub const SSE_HEADERS: [(&str, &str); 4] = [
    ("Content-Type", "text/event-stream"),
    ("Cache-Control", "no-cache"),
    ("Connection", "keep-alive"),
    ("X-Accel-Buffering", "no"),
];

/// Receives periodic ticks while a caller waits for admission.
#[async_trait]
pub trait KeepAlive: Send {
    /// Called on every ping interval. An error aborts the wait.
    async fn on_wait_tick(&mut self) -> Result<()>;
}

/// A frame written to the caller's response stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    Headers(Vec<(&'static str, &'static str)>),
    Data(String),
}

/// Writes SSE pings into a channel drained by the transport layer.
///
/// Headers go out once, before the first ping. A caller that already started
/// the stream (e.g. in an earlier wait on the same connection) passes
/// `started = true` to suppress them.
pub struct SseKeepAlive {
    tx: mpsc::Sender<StreamFrame>,
    ping: String,
    started: bool,
}

impl SseKeepAlive {
    pub fn new(tx: mpsc::Sender<StreamFrame>) -> Self {
        Self {
            tx,
            ping: DEFAULT_PING_FRAME.to_string(),
            started: false,
        }
    }

    pub fn with_ping_frame(mut self, ping: impl Into<String>) -> Self {
        self.ping = ping.into();
        self
    }

    pub fn with_started(mut self, started: bool) -> Self {
        self.started = started;
        self
    }

    /// Whether the stream headers have been written.
    pub fn is_started(&self) -> bool {
        self.started
    }

    async fn send(&self, frame: StreamFrame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| Error::KeepAlive("stream receiver dropped".to_string()))
    }
}

#[async_trait]
impl KeepAlive for SseKeepAlive {
    async fn on_wait_tick(&mut self) -> Result<()> {
        if !self.started {
            self.send(StreamFrame::Headers(SSE_HEADERS.to_vec())).await?;
            self.started = true;
        }
        self.send(StreamFrame::Data(self.ping.clone())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_headers_sent_once() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut keep_alive = SseKeepAlive::new(tx);
        assert!(!keep_alive.is_started());

        keep_alive.on_wait_tick().await.unwrap();
        keep_alive.on_wait_tick().await.unwrap();
        assert!(keep_alive.is_started());

        assert!(matches!(rx.recv().await, Some(StreamFrame::Headers(h)) if h.len() == 4));
        assert_eq!(
            rx.recv().await,
            Some(StreamFrame::Data(DEFAULT_PING_FRAME.to_string()))
        );
        assert_eq!(
            rx.recv().await,
            Some(StreamFrame::Data(DEFAULT_PING_FRAME.to_string()))
        );
    }

    #[tokio::test]
    async fn test_started_stream_skips_headers() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut keep_alive = SseKeepAlive::new(tx)
            .with_started(true)
            .with_ping_frame("data: {}\n\n");
        keep_alive.on_wait_tick().await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(StreamFrame::Data("data: {}\n\n".to_string()))
        );
    }

    #[tokio::test]
    async fn test_closed_receiver_errors() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut keep_alive = SseKeepAlive::new(tx);
        assert!(matches!(
            keep_alive.on_wait_tick().await,
            Err(Error::KeepAlive(_))
        ));
    }
}
