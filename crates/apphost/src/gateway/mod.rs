//! Realtime gateway: per-connection sessions streaming cluster state to clients.
pub mod feeds;
pub mod logs;
pub mod podinfo;
pub mod protocol;
pub mod session;
pub mod source;
pub mod terminal;

use std::time::Duration;
use tokio::time::sleep;

pub use session::{ConnectionState, FeedContext, FrameSink, Outbound, Session};
pub use source::{ClusterFeeds, KubeFeeds};

/// Final message when the watched application disappears.
pub const APP_DELETED: &str = "App has been deleted";

/// Log and terminal connections address one container of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceTarget { pub namespace: String, pub instance: String, pub container: String }

// Exponential backoff with jitter; attempt starts at 1
pub(crate) async fn backoff_retry(attempt: u32, base: Duration, max: Duration) {
    let exp = base * 2u32.saturating_pow(attempt.min(10));
    let capped = if exp > max { max } else { exp };
    let jitter = fastrand::u64(..(capped.as_millis() as u64 / 3 + 1));
    sleep(capped + Duration::from_millis(jitter)).await;
}
