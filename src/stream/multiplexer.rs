use super::{Frame, TokenSink};
use crate::types::events::StreamEvent;
use crate::Result;
use futures::stream::{self, BoxStream};
use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

/// Ordered stream of deltas ending with exactly one [`StreamEvent::Terminal`].
pub type EventStream = BoxStream<'static, StreamEvent>;

/// Bridges a backend's per-token emission to an asynchronous consumer.
///
/// Each request gets its own capacity-1 channel and its own worker task, so a slow
/// consumer applies backpressure straight to the generating backend.
pub struct StreamMultiplexer;

struct Consumer {
    rx: mpsc::Receiver<Frame>,
    // Dropping the stream cancels generation.
    _guard: DropGuard,
    pending: Option<Frame>,
    emitted: usize,
    done: bool,
}

impl StreamMultiplexer {
    /// Run `generate` on a worker task and return the consumer side.
    ///
    /// `generate` receives the [`TokenSink`] to install into the backend request.
    /// Resolves once the first frame is available: a failure before any token is
    /// returned as the error, while a failure after emission began is logged and the
    /// stream still ends normally.
    ///
    /// `cancel` is only observed. The stream cancels a child token when dropped, so
    /// the caller's token survives the request.
    pub async fn spawn<F, Fut>(cancel: CancellationToken, generate: F) -> Result<EventStream>
    where
        F: FnOnce(TokenSink) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let request = cancel.child_token();
        let (tx, mut rx) = mpsc::channel(1);
        let sink = TokenSink::new(tx.clone(), request.clone());

        // Held from here on so dropping the pending future also stops the worker.
        let guard = request.drop_guard();

        tokio::spawn(async move {
            let outcome = generate(sink).await;
            let _ = tx.send(Frame::Finished(outcome)).await;
        });

        let first = match rx.recv().await {
            Some(Frame::Finished(Err(e))) => {
                debug!(error = %e, "generation failed before first token");
                return Err(e);
            }
            other => other,
        };

        let consumer = Consumer {
            rx,
            _guard: guard,
            pending: first,
            emitted: 0,
            done: false,
        };

        Ok(Box::pin(stream::unfold(consumer, |mut st| async move {
            if st.done {
                return None;
            }
            let frame = match st.pending.take() {
                Some(frame) => Some(frame),
                None => st.rx.recv().await,
            };
            match frame {
                Some(Frame::Token(token)) => {
                    st.emitted += 1;
                    Some((StreamEvent::token(token), st))
                }
                Some(Frame::Finished(outcome)) => {
                    match outcome {
                        Ok(()) => debug!(tokens = st.emitted, "stream finished"),
                        Err(e) => {
                            warn!(tokens = st.emitted, error = %e, "generation failed mid-stream")
                        }
                    }
                    st.done = true;
                    Some((StreamEvent::Terminal, st))
                }
                None => {
                    warn!(tokens = st.emitted, "stream worker exited without reporting");
                    st.done = true;
                    Some((StreamEvent::Terminal, st))
                }
            }
        })))
    }
}
