//! WebSocket stream of voice notifications

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

use super::ApiState;
use crate::voice::{Notification, Snapshot};

/// Build events router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/events", get(ws_upgrade))
        .with_state(state)
}

/// Outgoing frame: a full snapshot on connect or resync, then notifications
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Outgoing {
    Snapshot(SnapshotFrame),
    Notification(Notification),
}

#[derive(Debug, Serialize)]
struct SnapshotFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    snapshot: Snapshot,
}

impl Outgoing {
    fn snapshot(snapshot: Snapshot) -> Self {
        Self::Snapshot(SnapshotFrame {
            kind: "snapshot",
            snapshot,
        })
    }
}

async fn ws_upgrade(State(state): State<Arc<ApiState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<ApiState>) {
    let (mut sender, mut receiver) = socket.split();
    // Subscribe before the snapshot so nothing falls between them
    let mut notifications = state.voice.subscribe();

    tracing::debug!("voice events client connected");

    let mut send_task = tokio::spawn(async move {
        let Ok(snapshot) = state.voice.snapshot().await else {
            return;
        };
        if send_json(&mut sender, &Outgoing::snapshot(snapshot)).await.is_err() {
            return;
        }

        loop {
            let outgoing = match notifications.recv().await {
                Ok(notification) => Outgoing::Notification(notification),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "events client lagging, resyncing");
                    match state.voice.snapshot().await {
                        Ok(snapshot) => Outgoing::snapshot(snapshot),
                        Err(_) => break,
                    }
                }
                Err(RecvError::Closed) => break,
            };
            if send_json(&mut sender, &outgoing).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Close(_) => break,
                Message::Ping(data) => tracing::trace!(len = data.len(), "received ping"),
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    tracing::debug!("voice events client disconnected");
}

async fn send_json<S>(sender: &mut S, outgoing: &Outgoing) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let Ok(text) = serde_json::to_string(outgoing) else {
        return Ok(());
    };
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}
