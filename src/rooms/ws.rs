use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::rooms::{
    msg::{ClientEvent, ServerEvent},
    registry::{ConnId, RelayError, RoomRegistry},
};

#[debug_handler(state = crate::AppState)]
pub async fn chat_ws(
    State(registry): State<Arc<RoomRegistry>>,

    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(async move |stream| handle_channel(registry, stream).await)
}

async fn handle_channel(registry: Arc<RoomRegistry>, stream: WebSocket) {
    let (mut sender, mut receiver) = stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = registry.register(tx.clone());
    tracing::debug!(%conn, "channel open");

    let mut write_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(payload) = serde_json::to_string(&event) else {
                continue;
            };
            if sender.send(payload.into()).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut write_task => break,
            frame = receiver.next() => {
                let Some(Ok(frame)) = frame else { break };
                let Message::Text(text) = frame else { continue };
                dispatch(&registry, conn, &tx, text.as_str());
            }
        }
    }

    registry.remove(conn);
    write_task.abort();
    tracing::debug!(%conn, "channel closed");
}

fn dispatch(
    registry: &RoomRegistry,
    conn: ConnId,
    tx: &mpsc::UnboundedSender<ServerEvent>,
    text: &str,
) {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(err) => {
            tracing::debug!(%conn, %err, "unparseable frame");
            let _ = tx.send(ServerEvent::Error {
                message: format!("bad payload: {err}"),
            });
            return;
        }
    };

    match event {
        ClientEvent::Authenticate(identity) => {
            tracing::debug!(%conn, id = %identity.id, "authenticate");
            let _ = registry.authenticate(conn, identity);
        }
        ClientEvent::JoinRoom(room_id) => match registry.join(conn, &room_id) {
            Ok(history) => {
                tracing::debug!(%conn, room_id, "joined");
                let _ = tx.send(ServerEvent::RoomHistory(history));
            }
            // rejected without a reply, only logged
            Err(err) => tracing::debug!(%conn, room_id, %err, "join rejected"),
        },
        ClientEvent::LeaveRoom(room_id) => {
            tracing::debug!(%conn, room_id, "left");
            registry.leave(conn, &room_id);
        }
        ClientEvent::SendMessage(draft) => {
            match registry.send(conn, &draft.room_id, draft.content) {
                Ok(_) => {}
                Err(err @ RelayError::NotAMember { .. }) => {
                    let _ = tx.send(ServerEvent::Error {
                        message: err.to_string(),
                    });
                }
                Err(err) => tracing::debug!(%conn, %err, "send rejected"),
            }
        }
    }
}
