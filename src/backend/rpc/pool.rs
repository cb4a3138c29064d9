//! Idle channel pool, one list per endpoint.

use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

/// Upper bound for one JSON frame.
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

pub(crate) type Channel = Framed<TcpStream, LinesCodec>;

pub(crate) struct ChannelPool {
    idle: Mutex<HashMap<String, Vec<Channel>>>,
    connect_timeout: Duration,
    max_idle_per_host: usize,
}

impl ChannelPool {
    pub(crate) fn new(connect_timeout: Duration, max_idle_per_host: usize) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            connect_timeout,
            max_idle_per_host,
        }
    }

    /// Reuse an idle channel to `host` or dial a new one.
    pub(crate) async fn checkout(&self, host: &str) -> io::Result<Channel> {
        if let Some(channel) = self.take_idle(host) {
            return Ok(channel);
        }
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(host))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        Ok(Framed::new(
            stream,
            LinesCodec::new_with_max_length(MAX_FRAME_BYTES),
        ))
    }

    /// Return a channel whose last exchange completed cleanly.
    pub(crate) fn checkin(&self, host: &str, channel: Channel) {
        let mut idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
        let list = idle.entry(host.to_string()).or_default();
        if list.len() < self.max_idle_per_host {
            list.push(channel);
        }
    }

    pub(crate) fn idle_count(&self, host: &str) -> usize {
        let idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
        idle.get(host).map(Vec::len).unwrap_or(0)
    }

    pub(crate) fn clear(&self) {
        self.idle.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    fn take_idle(&self, host: &str) -> Option<Channel> {
        let mut idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
        let list = idle.get_mut(host)?;
        while let Some(mut channel) = list.pop() {
            // An idle channel must have nothing to read; EOF or stray data means it is stale.
            if channel.next().now_or_never().is_none() {
                return Some(channel);
            }
        }
        None
    }
}
