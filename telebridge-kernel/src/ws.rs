use crate::bridge::Bridge;
use crate::contracts::{ClientMessage, ErrorKind, ServerMessage};
use crate::http::AppState;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info};

// GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    if app.bridge.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "bridge is shutting down").into_response();
    }
    let bridge = app.bridge.clone();
    ws.on_upgrade(move |socket| {
        let tracked = bridge.clone();
        tracked.track_session(run_session(socket, bridge))
    })
}

/// Une connexion dashboard : un writer qui vide la file du client et un
/// reader qui route les frames de contrôle. La première moitié terminée arrête l'autre.
pub async fn run_session(socket: WebSocket, bridge: Arc<Bridge>) {
    let Some((client, mut outbound)) = bridge.clients().connect() else {
        debug!("refusing websocket session, registry closed");
        return;
    };
    let send_timeout = bridge.config().clients.send_timeout();
    let router = bridge.router().clone();
    let (mut sink, mut stream) = socket.split();

    let writer = async {
        loop {
            tokio::select! {
                biased;
                msg = outbound.recv() => {
                    let Some(msg) = msg else { break };
                    let json = match serde_json::to_string(&msg) {
                        Ok(json) => json,
                        Err(e) => {
                            debug!(client = %client.id, error = %e, "unserializable message skipped");
                            continue;
                        }
                    };
                    match tokio::time::timeout(send_timeout, sink.send(Message::Text(json.into()))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!(client = %client.id, error = %e, "socket write failed");
                            break;
                        }
                        Err(_) => {
                            debug!(client = %client.id, "socket write timed out");
                            break;
                        }
                    }
                }
                _ = client.closed() => {
                    let frame = CloseFrame { code: close_code::AWAY, reason: "bridge closing connection".into() };
                    let _ = tokio::time::timeout(send_timeout, sink.send(Message::Close(Some(frame)))).await;
                    break;
                }
            }
        }
    };

    let reader = async {
        while let Some(frame) = stream.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(client = %client.id, error = %e, "socket read failed");
                    break;
                }
            };
            client.touch();

            let sent = match frame {
                Message::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(ClientMessage::Control(cmd)) => router.handle(&client, cmd).await,
                    Err(e) => {
                        client
                            .reply(ServerMessage::error(ErrorKind::InvalidMessage, e.to_string(), None))
                            .await
                    }
                },
                Message::Binary(_) => {
                    client
                        .reply(ServerMessage::error(ErrorKind::InvalidMessage, "binary frames are not supported", None))
                        .await
                }
                Message::Close(_) => break,
                // ping/pong gérés par le socket
                _ => Ok(()),
            };
            if sent.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }

    bridge.clients().unregister(client.id);
    info!(
        client = %client.id,
        connected_for = (time::OffsetDateTime::now_utc() - client.connected_at).whole_seconds(),
        "websocket session ended"
    );
}
