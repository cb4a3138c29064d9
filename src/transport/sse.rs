//! Server-Sent Events framing.
//!
//! [`SseDecoder`] reads upstream OpenAI-style streams (`data: {...}` frames closed by
//! `[DONE]`); [`encode_event`] writes the frames this gateway sends to its own clients.

use crate::types::events::ChatChunk;
use crate::{BoxStream, Result};
use bytes::{Buf, Bytes, BytesMut};
use futures::{stream, StreamExt};
use serde_json::Value;

/// Upstream event-stream reader.
///
/// Bytes are buffered until a whole frame (ended by `delimiter`) is present, and only
/// then decoded as UTF-8, so a multi-byte character split across network chunks
/// survives intact.
#[derive(Debug, Clone)]
pub struct SseDecoder {
    delimiter: Bytes,
    prefix: String,
    done_signal: String,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new(None, None, None)
    }
}

struct DecodeState {
    input: BoxStream<'static, Bytes>,
    buf: BytesMut,
    eof: bool,
}

impl SseDecoder {
    /// Defaults: frames end at a blank line, payloads follow `data: `, `[DONE]` ends
    /// the stream.
    pub fn new(
        delimiter: Option<String>,
        prefix: Option<String>,
        done_signal: Option<String>,
    ) -> Self {
        Self {
            delimiter: Bytes::from(
                delimiter
                    .filter(|d| !d.is_empty())
                    .unwrap_or_else(|| "\n\n".to_string()),
            ),
            prefix: prefix.unwrap_or_else(|| "data: ".to_string()),
            done_signal: done_signal.unwrap_or_else(|| "[DONE]".to_string()),
        }
    }

    /// Turn a byte stream into a stream of JSON payloads.
    ///
    /// Non-JSON frames (comments, `event:` lines) are skipped. The stream ends at the
    /// done signal or at EOF.
    pub fn decode(&self, input: BoxStream<'static, Bytes>) -> BoxStream<'static, Value> {
        let decoder = self.clone();
        let state = DecodeState {
            input,
            buf: BytesMut::new(),
            eof: false,
        };

        Box::pin(stream::unfold(state, move |mut st| {
            let decoder = decoder.clone();
            async move {
                loop {
                    let frame = match decoder.next_frame(&mut st.buf) {
                        Some(frame) => frame,
                        None if st.eof => {
                            if st.buf.is_empty() {
                                return None;
                            }
                            st.buf.split().freeze()
                        }
                        None => {
                            match st.input.next().await {
                                Some(Ok(bytes)) => st.buf.extend_from_slice(&bytes),
                                Some(Err(e)) => return Some((Err(e), st)),
                                None => st.eof = true,
                            }
                            continue;
                        }
                    };

                    let text = String::from_utf8_lossy(&frame);
                    if decoder.is_done(&text) {
                        return None;
                    }
                    if let Some(v) = decoder.parse_payload(&text) {
                        return Some((Ok(v), st));
                    }
                }
            }
        }))
    }

    /// Split one complete frame off the front of `buf`, dropping its delimiter.
    fn next_frame(&self, buf: &mut BytesMut) -> Option<Bytes> {
        let idx = buf
            .windows(self.delimiter.len())
            .position(|w| w == &self.delimiter[..])?;
        let frame = buf.split_to(idx).freeze();
        buf.advance(self.delimiter.len());
        Some(frame)
    }

    fn is_done(&self, frame: &str) -> bool {
        let t = frame.trim();
        t == self.done_signal
            || t.strip_prefix("data:")
                .map_or(false, |rest| rest.trim() == self.done_signal)
    }

    fn parse_payload(&self, frame: &str) -> Option<Value> {
        // A frame may carry an `event:` line before its `data:` line.
        let line = frame
            .lines()
            .map(str::trim)
            .find(|l| l.starts_with("data:"))
            .unwrap_or_else(|| frame.trim());
        if line.is_empty() || line.starts_with(':') || self.is_done(line) {
            return None;
        }

        let payload = if let Some(rest) = line.strip_prefix(self.prefix.as_str()) {
            rest
        } else if let Some(rest) = line.strip_prefix("data:") {
            rest.trim_start()
        } else {
            line
        };
        serde_json::from_str(payload).ok()
    }
}

/// Frame one chunk the way gateway clients expect it:
/// an `event: data` line, a blank line, then the `data:` line and a blank line.
pub fn encode_event(chunk: &ChatChunk) -> Result<Bytes> {
    let json = serde_json::to_string(chunk)?;
    Ok(Bytes::from(format!("event: data\n\ndata: {}\n\n", json)))
}
