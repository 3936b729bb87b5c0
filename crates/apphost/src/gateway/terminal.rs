//! Remote shell bridge.
//!
//! Remote frames carry a one-byte channel tag. Client frames are plain text:
//! `resize:<cols>:<rows>` or base64 stdin. Server frames are `stdout:<b64>`,
//! `stderr:<b64>` or `msg:<text>`.
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::{sync::{mpsc, watch}, task::JoinHandle};
use tracing::{info, warn};
use crate::cluster::ClusterError;
use super::{backoff_retry, session::FrameSink, source::{ClusterFeeds, ResizeMessage}, InstanceTarget};

pub const STDIN_CHANNEL: u8 = 0;
pub const STDOUT_CHANNEL: u8 = 1;
pub const STDERR_CHANNEL: u8 = 2;
pub const ERROR_CHANNEL: u8 = 3;
pub const RESIZE_CHANNEL: u8 = 4;

/// Interactive bash under `script` when available, bare sh otherwise.
pub const SHELL_COMMAND: [&str; 3] = [
    "/bin/sh",
    "-c",
    "TERM=xterm-256color; export TERM; [ -x /bin/bash ] && ([ -x /usr/bin/script ] && /usr/bin/script -q -c \"/bin/bash\" /dev/null || exec /bin/bash) || exec /bin/sh",
];

pub const NO_SHELL: &str = "Container does not support shell or is not running";
const RESIZE_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame { Stdin(Vec<u8>), Resize { cols: u16, rows: u16 } }

pub fn parse_client_frame(text: &str) -> Result<ClientFrame, &'static str> {
    if let Some(rest) = text.strip_prefix("resize:") {
        let (cols, rows) = rest.split_once(':').ok_or("Invalid terminal resize message")?;
        return match (cols.trim().parse(), rows.trim().parse()) {
            (Ok(cols), Ok(rows)) => Ok(ClientFrame::Resize { cols, rows }),
            _ => Err("Invalid terminal resize message"),
        };
    }
    STANDARD.decode(text.trim()).map(ClientFrame::Stdin).map_err(|_| "Error decoding input")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteAction { Send(String), Close(String), Ignore }

pub fn translate_remote_frame(frame: &[u8]) -> RemoteAction {
    let Some((&channel, payload)) = frame.split_first() else { return RemoteAction::Ignore };
    if payload.is_empty() { return RemoteAction::Ignore; }
    match channel {
        STDOUT_CHANNEL => RemoteAction::Send(format!("stdout:{}", STANDARD.encode(payload))),
        STDERR_CHANNEL => RemoteAction::Send(format!("stderr:{}", STANDARD.encode(payload))),
        ERROR_CHANNEL => {
            let status: Option<Value> = serde_json::from_slice(payload).ok();
            if status.as_ref().and_then(|s| s["status"].as_str()) == Some("Failure") {
                RemoteAction::Close(format!("msg:{NO_SHELL}"))
            } else {
                warn!(payload = %String::from_utf8_lossy(payload), "exec_error_channel");
                RemoteAction::Ignore
            }
        }
        _ => RemoteAction::Ignore,
    }
}

fn open_failure_message(e: &ClusterError) -> &'static str {
    match e {
        ClusterError::NotFound(_) => NO_SHELL,
        ClusterError::BadRequest(_) => "Failed to initialize shell",
        _ => "Internal server error",
    }
}

type InputSlot = watch::Receiver<Option<mpsc::Sender<Vec<u8>>>>;

pub struct TerminalSession {
    sink: FrameSink,
    input: InputSlot,
    bridge: Option<JoinHandle<()>>,
    resize: Option<JoinHandle<()>>,
}

impl TerminalSession {
    pub fn open(feeds: Arc<dyn ClusterFeeds>, target: InstanceTarget, sink: FrameSink) -> Self {
        let (ready_tx, input) = watch::channel(None);
        let bridge = tokio::spawn(run_bridge(feeds, target, sink.clone(), ready_tx));
        Self { sink, input, bridge: Some(bridge), resize: None }
    }

    pub async fn handle_text(&mut self, text: &str) {
        match parse_client_frame(text) {
            Ok(ClientFrame::Stdin(bytes)) => {
                // Keystrokes wait for the remote side; a bridge that never opens drops them.
                let tx = {
                    let Ok(slot) = self.input.wait_for(Option::is_some).await else { return };
                    slot.clone()
                };
                let Some(tx) = tx else { return };
                let mut frame = Vec::with_capacity(bytes.len() + 1);
                frame.push(STDIN_CHANNEL);
                frame.extend(bytes);
                let _ = tx.send(frame).await;
            }
            Ok(ClientFrame::Resize { cols, rows }) => {
                if let Some(prev) = self.resize.take() { prev.abort(); }
                self.resize = Some(tokio::spawn(send_resize(self.input.clone(), self.sink.clone(), cols, rows)));
            }
            Err(msg) => { self.sink.send_text(format!("msg:{msg}")).await; }
        }
    }

    /// Ends the bridge; the remote exec session goes with it.
    pub async fn close(&mut self) {
        for h in [self.resize.take(), self.bridge.take()].into_iter().flatten() {
            h.abort();
            let _ = h.await;
        }
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        for h in [self.resize.take(), self.bridge.take()].into_iter().flatten() { h.abort(); }
    }
}

async fn send_resize(input: InputSlot, sink: FrameSink, cols: u16, rows: u16) {
    let mut frame = vec![RESIZE_CHANNEL];
    frame.extend(serde_json::to_vec(&ResizeMessage { width: cols, height: rows }).unwrap_or_default());
    for attempt in 1..=RESIZE_ATTEMPTS {
        let tx = input.borrow().clone();
        if let Some(tx) = tx {
            if tx.send(frame).await.is_err() { warn!("exec_resize_after_close"); }
            return;
        }
        // Bridge gave up before opening; it has already told the client.
        if input.has_changed().is_err() { return; }
        backoff_retry(attempt, Duration::from_millis(50), Duration::from_secs(1)).await;
    }
    sink.send_text("msg:stty error. Terminal may not work as expected".into()).await;
}

async fn run_bridge(feeds: Arc<dyn ClusterFeeds>, t: InstanceTarget, sink: FrameSink, ready: watch::Sender<Option<mpsc::Sender<Vec<u8>>>>) {
    let mut exec = match feeds.open_exec(&t.namespace, &t.instance, &t.container, &SHELL_COMMAND).await {
        Ok(e) => e,
        Err(e) => {
            warn!(error=%e, instance=%t.instance, container=%t.container, "exec_open_failed");
            sink.send_text(format!("msg:{}", open_failure_message(&e))).await;
            sink.close().await;
            return;
        }
    };
    info!(instance=%t.instance, container=%t.container, "exec_opened");
    ready.send_replace(Some(exec.input.clone()));
    while let Some(frame) = exec.frames.recv().await {
        match translate_remote_frame(&frame) {
            RemoteAction::Send(text) => { if !sink.send_text(text).await { return; } }
            RemoteAction::Close(text) => {
                sink.send_text(text).await;
                sink.close().await;
                return;
            }
            RemoteAction::Ignore => {}
        }
    }
    sink.send_text("msg:Closing shell".into()).await;
    sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames() {
        assert_eq!(parse_client_frame("resize:120:40"), Ok(ClientFrame::Resize { cols: 120, rows: 40 }));
        assert!(parse_client_frame("resize:wide").is_err());
        assert_eq!(parse_client_frame("bHM="), Ok(ClientFrame::Stdin(b"ls".to_vec())));
        assert_eq!(parse_client_frame("%%%"), Err("Error decoding input"));
    }

    #[test]
    fn remote_frames() {
        assert_eq!(translate_remote_frame(&[STDOUT_CHANNEL, b'h', b'i']), RemoteAction::Send("stdout:aGk=".into()));
        assert_eq!(translate_remote_frame(&[STDERR_CHANNEL, b'!']), RemoteAction::Send("stderr:IQ==".into()));
        assert_eq!(translate_remote_frame(&[STDOUT_CHANNEL]), RemoteAction::Ignore);
        let mut failure = vec![ERROR_CHANNEL];
        failure.extend(br#"{"status":"Failure","message":"exec failed"}"#);
        assert_eq!(translate_remote_frame(&failure), RemoteAction::Close(format!("msg:{NO_SHELL}")));
        let mut ok = vec![ERROR_CHANNEL];
        ok.extend(br#"{"status":"Success"}"#);
        assert_eq!(translate_remote_frame(&ok), RemoteAction::Ignore);
    }

    #[test]
    fn open_failures_map_to_messages() {
        assert_eq!(open_failure_message(&ClusterError::BadRequest("x".into())), "Failed to initialize shell");
        assert_eq!(open_failure_message(&ClusterError::Transport("x".into())), "Internal server error");
    }
}
