//! Per-connection subscription state.
//!
//! A connection moves `Connecting -> Authenticated -> Subscribed(feed)* -> Closed`.
//! At most one feed task writes to the outbound channel at a time: selecting a
//! feed aborts the previous task and awaits it before the replacement starts.
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use crate::{auth::{self, Identity}, error::{Error, Result}, store::AppStore, telemetry::GATEWAY_FRAMES};
use super::{feeds, protocol::{encode_error, FeedKind, ServerFrame, Subscribe}, source::ClusterFeeds};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState { Connecting, Authenticated, Subscribed(FeedKind), Closed }

/// What the socket writer task sends next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound { Text(String), Close }

/// Cloneable handle onto a connection's outbound channel. Every send reports
/// whether the connection is still writable.
#[derive(Clone)]
pub struct FrameSink { tx: mpsc::Sender<Outbound>, feed: &'static str }

impl FrameSink {
    pub fn new(tx: mpsc::Sender<Outbound>, feed: &'static str) -> Self { Self { tx, feed } }

    pub fn for_feed(&self, feed: &'static str) -> Self { Self { tx: self.tx.clone(), feed } }

    pub async fn send_frame(&self, frame: &ServerFrame) -> bool { self.send_text(frame.encode()).await }

    pub async fn send_text(&self, text: String) -> bool {
        let ok = self.tx.send(Outbound::Text(text)).await.is_ok();
        if ok { GATEWAY_FRAMES.with_label_values(&[self.feed]).inc(); }
        ok
    }

    pub async fn send_error(&self, message: &str) -> bool { self.send_text(encode_error(message)).await }

    pub async fn close(&self) { let _ = self.tx.send(Outbound::Close).await; }

    /// One error frame, then close.
    pub async fn close_with(&self, message: &str) {
        self.send_error(message).await;
        self.close().await;
    }

    /// Resolves once the writer side has gone away.
    pub async fn closed(&self) { self.tx.closed().await }
}

/// Everything a feed task needs about its target.
#[derive(Clone)]
pub struct FeedContext { pub feeds: Arc<dyn ClusterFeeds>, pub namespace: String, pub appid: String }

struct ActiveFeed { kind: FeedKind, handle: JoinHandle<()> }

pub struct Session {
    feeds: Arc<dyn ClusterFeeds>,
    sink: FrameSink,
    state: ConnectionState,
    target: Option<FeedContext>,
    active: Option<ActiveFeed>,
}

impl Session {
    pub fn new(feeds: Arc<dyn ClusterFeeds>, sink: FrameSink) -> Self {
        Self { feeds, sink, state: ConnectionState::Connecting, target: None, active: None }
    }

    pub fn state(&self) -> ConnectionState { self.state }

    /// Verifies the pre-resolved identity against the application. Failure
    /// sends one error frame and closes the connection.
    pub async fn authenticate(&mut self, store: &dyn AppStore, identity: &Identity, nsid: &str, appid: &str) -> Result<()> {
        match auth::authorize_app(store, identity, nsid, appid).await {
            Ok((app, _role)) => {
                self.target = Some(FeedContext { feeds: self.feeds.clone(), namespace: app.namespace, appid: app.appid });
                self.state = ConnectionState::Authenticated;
                Ok(())
            }
            Err(e) => {
                tracing::info!(nsid, appid, error=%e, "gateway_auth_rejected");
                self.sink.close_with(&e.client_message()).await;
                self.state = ConnectionState::Closed;
                Err(e)
            }
        }
    }

    pub async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<Subscribe>(text) {
            Ok(s) => { if let Err(e) = self.subscribe(s.watch).await { self.sink.send_error(&e.client_message()).await; } }
            Err(_) => { self.sink.send_error("Invalid subscription request").await; }
        }
    }

    /// Replaces whatever feed is running with `kind`. Re-selecting the current
    /// feed restarts it.
    pub async fn subscribe(&mut self, kind: FeedKind) -> Result<()> {
        let Some(ctx) = self.target.clone() else { return Err(Error::permission("Unauthenticated")) };
        if self.state == ConnectionState::Closed { return Err(Error::Connection("session closed".into())); }
        self.cancel_active().await;
        let sink = self.sink.for_feed(kind.as_str());
        let handle = tokio::spawn(feeds::run(kind, ctx, sink));
        tracing::debug!(feed = kind.as_str(), "feed_started");
        self.active = Some(ActiveFeed { kind, handle });
        self.state = ConnectionState::Subscribed(kind);
        Ok(())
    }

    pub fn active_feed(&self) -> Option<FeedKind> { self.active.as_ref().map(|a| a.kind) }

    /// Cancels every outstanding task; awaits them so nothing writes after this returns.
    pub async fn close(&mut self) {
        self.cancel_active().await;
        self.state = ConnectionState::Closed;
    }

    async fn cancel_active(&mut self) {
        if let Some(active) = self.active.take() {
            active.handle.abort();
            let _ = active.handle.await;
            tracing::debug!(feed = active.kind.as_str(), "feed_cancelled");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() { active.handle.abort(); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Role};
    use crate::test_support::{fixture_app, ScriptedFeeds};

    fn identity(subject: &str) -> Identity { Identity { subject: Some(subject.into()), scopes: None } }

    #[tokio::test]
    async fn rejected_identity_gets_one_error_and_close() {
        let store = MemoryStore::new();
        store.insert_app(fixture_app("a1"));
        let (tx, mut rx) = mpsc::channel(8);
        let mut s = Session::new(Arc::new(ScriptedFeeds::default()), FrameSink::new(tx, "app"));
        assert!(s.authenticate(&store, &identity("mallory"), "ns-test", "a1").await.is_err());
        assert_eq!(s.state(), ConnectionState::Closed);
        match rx.recv().await { Some(Outbound::Text(t)) => assert!(t.contains("Namespace not found")), other => panic!("{other:?}") }
        assert_eq!(rx.recv().await, Some(Outbound::Close));
    }

    #[tokio::test]
    async fn invalid_request_keeps_connection() {
        let store = MemoryStore::new();
        store.insert_app(fixture_app("a1"));
        store.grant("ns-test", "alice", Role::User);
        let (tx, mut rx) = mpsc::channel(8);
        let mut s = Session::new(Arc::new(ScriptedFeeds::default()), FrameSink::new(tx, "app"));
        s.authenticate(&store, &identity("alice"), "ns-test", "a1").await.unwrap();
        s.handle_text(r#"{"watch":"nope"}"#).await;
        match rx.recv().await { Some(Outbound::Text(t)) => assert!(t.contains("Invalid subscription request")), other => panic!("{other:?}") }
        assert_eq!(s.state(), ConnectionState::Authenticated);
        s.subscribe(FeedKind::Stat).await.unwrap();
        assert_eq!(s.state(), ConnectionState::Subscribed(FeedKind::Stat));
        s.close().await;
        assert_eq!(s.active_feed(), None);
    }
}
