use agent_gateway_core::Gateway;
use agent_gateway_core::InboundFrame;
use agent_gateway_core::OutboundFrame;
use agent_gateway_core::SessionHandle;
use axum::extract::State;
use axum::extract::ws::CloseFrame;
use axum::extract::ws::Message as WsMessage;
use axum::extract::ws::WebSocket;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use tracing::debug;
use tracing::warn;

pub(crate) async fn upgrade(ws: WebSocketUpgrade, State(gateway): State<Gateway>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| bridge(socket, gateway))
}

/// Pumps frames between the WebSocket and a gateway session until either side
/// goes away.
async fn bridge(socket: WebSocket, gateway: Gateway) {
    let SessionHandle {
        inbound,
        mut outbound,
        task,
    } = gateway.spawn_session();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let reader = tokio::spawn(async move {
        while let Some(message) = ws_rx.next().await {
            let frame = match message {
                Ok(WsMessage::Text(text)) => InboundFrame::Text(text.as_str().to_owned()),
                Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => InboundFrame::Text(text),
                    Err(_) => {
                        debug!("ignoring non-utf8 binary frame");
                        continue;
                    }
                },
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => continue,
                Err(err) => {
                    debug!("websocket read failed: {err}");
                    break;
                }
            };
            if inbound.send(frame).await.is_err() {
                return;
            }
        }
        let _ = inbound.send(InboundFrame::Close).await;
    });

    while let Some(frame) = outbound.recv().await {
        let message = match frame {
            OutboundFrame::Message(message) => match message.to_json() {
                Ok(payload) => WsMessage::Text(payload.into()),
                Err(err) => {
                    warn!("failed to serialize server message: {err}");
                    continue;
                }
            },
            OutboundFrame::Close { code, reason } => {
                let close = CloseFrame {
                    code,
                    reason: reason.into(),
                };
                let _ = ws_tx.send(WsMessage::Close(Some(close))).await;
                let _ = ws_tx.flush().await;
                break;
            }
        };
        if ws_tx.send(message).await.is_err() {
            break;
        }
    }

    reader.abort();
    drop(outbound);
    if let Err(err) = task.await {
        warn!("session task failed: {err}");
    }
}
