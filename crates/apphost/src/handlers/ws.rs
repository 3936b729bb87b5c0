//! WebSocket endpoints. Each connection gets one writer task fed through an
//! mpsc channel; sessions only ever hold the sending side.
use axum::{extract::{ws::{Message, WebSocket, WebSocketUpgrade}, Path, State}, http::HeaderMap, response::Response};
use futures_util::{stream::SplitStream, SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::info;
use uuid::Uuid;
use crate::{AppState, auth::{authorize_app, authorize_instance, Identity}, error::Result, telemetry::GATEWAY_CONNECTIONS};
use crate::gateway::{logs::LogSession, terminal::TerminalSession, FrameSink, InstanceTarget, Outbound, Session};

const OUTBOUND_BUFFER: usize = 64;

struct Connection { id: Uuid, sink: FrameSink, incoming: SplitStream<WebSocket>, writer: JoinHandle<()> }

fn connect(socket: WebSocket, label: &'static str) -> Connection {
    let (mut ws_tx, incoming) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let msg = match out {
                Outbound::Text(t) => Message::Text(t),
                Outbound::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            };
            if ws_tx.send(msg).await.is_err() { break; }
        }
    });
    GATEWAY_CONNECTIONS.inc();
    let id = Uuid::new_v4();
    tracing::debug!(conn_id=%id, label, "ws_connected");
    Connection { id, sink: FrameSink::new(tx, label), incoming, writer }
}

impl Connection {
    /// Next client text frame; `None` once either side has closed.
    async fn next_text(&mut self) -> Option<String> {
        loop {
            tokio::select! {
                msg = self.incoming.next() => match msg {
                    Some(Ok(Message::Text(t))) => return Some(t),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                    Some(Ok(_)) => continue,
                },
                _ = self.sink.closed() => return None,
            }
        }
    }

    /// Callers must have dropped every other sink clone first.
    async fn finish(self) {
        let Connection { id, sink, incoming, writer } = self;
        drop(sink);
        drop(incoming);
        let _ = writer.await;
        GATEWAY_CONNECTIONS.dec();
        tracing::debug!(conn_id=%id, "ws_closed");
    }
}

async fn authorize_target(state: &AppState, identity: &Identity, nsid: &str, appid: &str, iref: &str, cref: &str) -> Result<InstanceTarget> {
    let (app, _role) = authorize_app(state.store.as_ref(), identity, nsid, appid).await?;
    authorize_instance(&app.appid, iref, cref)?;
    Ok(InstanceTarget { namespace: app.namespace, instance: iref.to_string(), container: cref.to_string() })
}

pub async fn app_socket(ws: WebSocketUpgrade, State(state): State<AppState>, Path((nsid, appid)): Path<(String, String)>, headers: HeaderMap) -> Response {
    let identity = Identity::from_headers(&headers);
    ws.on_upgrade(move |socket| serve_app(socket, state, identity, nsid, appid))
}

async fn serve_app(socket: WebSocket, state: AppState, identity: Identity, nsid: String, appid: String) {
    let mut conn = connect(socket, "app");
    let mut session = Session::new(state.feeds.clone(), conn.sink.clone());
    if session.authenticate(state.store.as_ref(), &identity, &nsid, &appid).await.is_ok() {
        info!(conn_id=%conn.id, %nsid, %appid, "app_socket_open");
        while let Some(text) = conn.next_text().await { session.handle_text(&text).await; }
    }
    session.close().await;
    drop(session);
    conn.finish().await;
}

pub async fn logs_socket(ws: WebSocketUpgrade, State(state): State<AppState>, Path((nsid, appid, iref, cref)): Path<(String, String, String, String)>, headers: HeaderMap) -> Response {
    let identity = Identity::from_headers(&headers);
    ws.on_upgrade(move |socket| async move {
        let mut conn = connect(socket, "logs");
        match authorize_target(&state, &identity, &nsid, &appid, &iref, &cref).await {
            Ok(target) => {
                info!(conn_id=%conn.id, %nsid, %appid, %iref, %cref, "logs_socket_open");
                let mut logs = LogSession::open(state.feeds.clone(), target, conn.sink.clone());
                while let Some(text) = conn.next_text().await { logs.handle_text(&text).await; }
                logs.close().await;
            }
            Err(e) => conn.sink.close_with(&e.client_message()).await,
        }
        conn.finish().await;
    })
}

pub async fn terminal_socket(ws: WebSocketUpgrade, State(state): State<AppState>, Path((nsid, appid, iref, cref)): Path<(String, String, String, String)>, headers: HeaderMap) -> Response {
    let identity = Identity::from_headers(&headers);
    ws.on_upgrade(move |socket| async move {
        let mut conn = connect(socket, "terminal");
        match authorize_target(&state, &identity, &nsid, &appid, &iref, &cref).await {
            Ok(target) => {
                info!(conn_id=%conn.id, %nsid, %appid, %iref, %cref, "terminal_socket_open");
                let mut term = TerminalSession::open(state.feeds.clone(), target, conn.sink.clone());
                while let Some(text) = conn.next_text().await { term.handle_text(&text).await; }
                term.close().await;
            }
            Err(e) => {
                conn.sink.send_text(format!("msg:{}", e.client_message())).await;
                conn.sink.close().await;
            }
        }
        conn.finish().await;
    })
}
