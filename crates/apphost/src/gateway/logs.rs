//! Log tail for one container of one instance.
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::{task::JoinHandle, time::{interval_at, Instant}};
use tracing::warn;
use crate::config::{CONTAINER_CHECK_INTERVAL, DEFAULT_TAIL_LINES};
use super::{protocol::ServerFrame, session::FrameSink, source::ClusterFeeds, InstanceTarget};

pub const INVALID_TAIL: &str = "Invalid tail_lines parameter";
pub const NEGATIVE_TAIL: &str = "tail_lines must be a positive integer";
pub const CONTAINER_TERMINATED: &str = "Container has been terminated";

/// Parses a `{"tail_lines": N}` client message.
pub fn parse_tail_lines(text: &str) -> Result<i64, &'static str> {
    let v: Value = serde_json::from_str(text).map_err(|_| INVALID_TAIL)?;
    let n = v.get("tail_lines").and_then(Value::as_i64).ok_or(INVALID_TAIL)?;
    if n < 0 { return Err(NEGATIVE_TAIL); }
    Ok(n)
}

pub struct LogSession {
    feeds: Arc<dyn ClusterFeeds>,
    target: InstanceTarget,
    sink: FrameSink,
    tail_lines: i64,
    stream: Option<JoinHandle<()>>,
}

impl LogSession {
    /// Starts streaming with the default tail.
    pub fn open(feeds: Arc<dyn ClusterFeeds>, target: InstanceTarget, sink: FrameSink) -> Self {
        let mut s = Self { feeds, target, sink, tail_lines: DEFAULT_TAIL_LINES, stream: None };
        s.start();
        s
    }

    pub fn tail_lines(&self) -> i64 { self.tail_lines }

    /// Bad input is answered with an error frame; the current stream keeps going.
    pub async fn handle_text(&mut self, text: &str) {
        match parse_tail_lines(text) {
            Ok(n) if n == self.tail_lines => {}
            Ok(n) => {
                self.tail_lines = n;
                self.stop().await;
                self.start();
            }
            Err(msg) => { self.sink.send_error(msg).await; }
        }
    }

    pub async fn close(&mut self) { self.stop().await; }

    fn start(&mut self) {
        let task = stream_logs(self.feeds.clone(), self.target.clone(), self.tail_lines, self.sink.clone());
        self.stream = Some(tokio::spawn(task));
    }

    async fn stop(&mut self) {
        if let Some(h) = self.stream.take() {
            h.abort();
            let _ = h.await;
        }
    }
}

impl Drop for LogSession {
    fn drop(&mut self) { if let Some(h) = self.stream.take() { h.abort(); } }
}

async fn stream_logs(feeds: Arc<dyn ClusterFeeds>, t: InstanceTarget, tail_lines: i64, sink: FrameSink) {
    let mut lines = match feeds.log_lines(&t.namespace, &t.instance, &t.container, tail_lines).await {
        Ok(s) => s,
        Err(e) => {
            warn!(error=%e, instance=%t.instance, container=%t.container, "log_stream_open_failed");
            let msg = if e.is_gone() { "Container does not exist or has been terminated" } else { "Failed to stream logs" };
            sink.close_with(msg).await;
            return;
        }
    };
    let mut check = interval_at(Instant::now() + CONTAINER_CHECK_INTERVAL, CONTAINER_CHECK_INTERVAL);
    let mut drained = false;
    loop {
        tokio::select! {
            line = lines.next(), if !drained => match line {
                Some(Ok(l)) => { if !sink.send_frame(&ServerFrame::Log(l)).await { return; } }
                Some(Err(e)) => { warn!(error=%e, instance=%t.instance, "log_stream_interrupted"); drained = true; }
                None => drained = true,
            },
            _ = check.tick() => match feeds.container_exists(&t.namespace, &t.instance, &t.container).await {
                Ok(false) => {
                    sink.close_with(CONTAINER_TERMINATED).await;
                    return;
                }
                Ok(true) => {}
                Err(e) => warn!(error=%e, instance=%t.instance, "container_check_failed"),
            },
        }
    }
}
