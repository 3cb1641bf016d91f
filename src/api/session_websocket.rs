use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};

use crate::session::{ClientMessage, ConnectionId, Outbound, SessionHub};

pub async fn handle_session_websocket(websocket: WebSocket, hub: SessionHub) {
    let (mut ws_sender, mut ws_receiver) = websocket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let handle = hub.open(tx);
    let id = handle.id();
    tracing::info!(connection = %id, "New session WebSocket connection established");

    // Spawn task to send messages to client
    let mut sender_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let closing = outbound == Outbound::Close;
            let frame = match outbound {
                Outbound::Message(message) => match message.encode() {
                    Ok(text) => Message::text(text),
                    Err(e) => {
                        tracing::error!(connection = %id, error = %e, "Failed to encode message");
                        continue;
                    }
                },
                Outbound::Ping => Message::ping(Vec::new()),
                Outbound::Close => Message::close(),
            };

            if let Err(e) = ws_sender.send(frame).await {
                tracing::debug!(connection = %id, error = %e, "Failed to send WebSocket message");
                break;
            }
            if closing {
                let _ = ws_sender.close().await;
                break;
            }
        }
    });

    let reader = async {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(message) => {
                    if message.is_close() {
                        break;
                    }
                    handle_websocket_message(&hub, id, message);
                }
                Err(e) => {
                    tracing::warn!(connection = %id, error = %e, "WebSocket error");
                    break;
                }
            }
        }
    };

    // a server-side close (heartbeat eviction) ends the writer first
    tokio::select! {
        _ = reader => {}
        _ = &mut sender_task => {}
    }

    hub.closed(id);
    sender_task.abort();
    tracing::info!(connection = %id, "Session WebSocket connection closed");
}

fn handle_websocket_message(hub: &SessionHub, id: ConnectionId, message: Message) {
    if message.is_pong() {
        hub.alive(id);
        return;
    }

    let Ok(text) = message.to_str() else {
        return;
    };
    tracing::debug!(connection = %id, "Received session message: {}", text);

    match ClientMessage::decode(text) {
        Ok(client_message) => hub.inbound(id, client_message),
        Err(e) => {
            tracing::warn!(
                connection = %id,
                error = %e,
                raw_message = %text,
                "Failed to parse session message"
            );
        }
    }
}
