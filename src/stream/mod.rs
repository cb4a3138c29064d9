//! 流式输出：把后端逐 token 的回调转换成有序的异步事件流。
//!
//! Streaming support. A backend generating tokens pushes them through a
//! [`TokenSink`]; the [`StreamMultiplexer`] owns the other end of the channel and
//! turns it into an ordered [`EventStream`] of deltas followed by one terminal marker.
//! [`compute_choices`] covers the non-streaming N-completion case.

mod choices;
mod multiplexer;

pub use choices::{compute_choices, Generation};
pub use multiplexer::{EventStream, StreamMultiplexer};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Message travelling from the generation worker to the consumer.
#[derive(Debug)]
pub(crate) enum Frame {
    Token(String),
    Finished(crate::Result<()>),
}

/// Producer handle given to a backend for one streaming request.
///
/// Both emit methods return `false` once the consumer is gone or the request was
/// cancelled; the backend must stop generating when that happens.
#[derive(Debug, Clone)]
pub struct TokenSink {
    tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
}

impl TokenSink {
    pub(crate) fn new(tx: mpsc::Sender<Frame>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// Send from a blocking thread (native engine callbacks).
    ///
    /// Must not be called from inside the async runtime.
    pub fn emit_blocking(&self, token: impl Into<String>) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.tx.blocking_send(Frame::Token(token.into())).is_ok()
    }

    /// Send from async code (remote backends).
    pub async fn emit(&self, token: impl Into<String>) -> bool {
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(Frame::Token(token.into())) => sent.is_ok(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_stops_after_receiver_drops() {
        let (tx, rx) = mpsc::channel(1);
        let sink = TokenSink::new(tx, CancellationToken::new());
        drop(rx);
        assert!(!sink.emit("a").await);
        assert!(sink.is_cancelled());
    }

    #[tokio::test]
    async fn emit_stops_after_cancel() {
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let sink = TokenSink::new(tx, cancel.clone());
        assert!(sink.emit("a").await);
        assert!(matches!(rx.recv().await, Some(Frame::Token(t)) if t == "a"));
        cancel.cancel();
        assert!(!sink.emit("b").await);
    }

    #[tokio::test]
    async fn blocking_emit_from_worker_thread() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = TokenSink::new(tx, CancellationToken::new());
        let handle = tokio::task::spawn_blocking(move || {
            let first = sink.emit_blocking("x");
            let second = sink.emit_blocking("y");
            (first, second)
        });
        let mut got = Vec::new();
        while let Some(Frame::Token(t)) = rx.recv().await {
            got.push(t);
        }
        assert_eq!(handle.await.unwrap(), (true, true));
        assert_eq!(got, vec!["x", "y"]);
    }
}
