//! Client wire protocol for the realtime channel.
//!
//! App feeds exchange JSON text frames; the terminal uses plain text frames
//! (see [`super::terminal`]).
use serde::{Deserialize, Serialize};
use crate::error::ErrorFrame;
use super::podinfo::{EventSummary, InstanceSummary, StatusSummary};

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind { Instances, Stat, Events, Usage }

impl FeedKind {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Instances => "instances", Self::Stat => "stat", Self::Events => "events", Self::Usage => "usage" }
    }
}

/// `{"watch": "instances" | "stat" | "events" | "usage"}`
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscribe { pub watch: FeedKind }

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceEvent { Add, Modify, Delete, Error }

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum InstanceData {
    Instance(InstanceSummary),
    Error { message: String },
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct InstanceUpdate { pub event: InstanceEvent, pub data: InstanceData }

impl InstanceUpdate {
    pub fn new(event: InstanceEvent, summary: InstanceSummary) -> Self { Self { event, data: InstanceData::Instance(summary) } }
    pub fn error(message: impl Into<String>) -> Self { Self { event: InstanceEvent::Error, data: InstanceData::Error { message: message.into() } } }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct UsageSnapshot {
    pub response_bytes: f64,
    pub request_bytes: f64,
    pub request_count: f64,
    /// Cores across all instances.
    pub cpu: f64,
    /// MiB across all instances.
    pub memory: f64,
}

/// One server-to-client update, tagged by feed.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ServerFrame {
    Instance(InstanceUpdate),
    Stat(StatusSummary),
    Events(Vec<EventSummary>),
    Usage(UsageSnapshot),
    Log(String),
}

impl ServerFrame {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| encode_error(&format!("encode: {e}")))
    }
}

pub fn encode_error(message: &str) -> String {
    serde_json::to_string(&ErrorFrame::new(message)).unwrap_or_else(|_| r#"{"status":"error","message":"Internal server error"}"#.into())
}
