// WebSocket telegram stream
//
// One subscription per connected client. The broadcaster drops us when the
// buffer overflows, so a stalled client disconnects itself instead of
// backpressuring the bus.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use tracing::debug;

use super::AppState;

const CLIENT_BUFFER: usize = 256;

pub async fn telegram_stream(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let client_id = uuid::Uuid::new_v4();
    let mut telegrams = state.bus.broadcaster().subscribe(CLIENT_BUFFER);
    debug!(client = %client_id, "telegram stream client connected");

    loop {
        tokio::select! {
            telegram = telegrams.recv() => {
                let Some(telegram) = telegram else {
                    // dropped by the broadcaster for falling behind
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                let Ok(text) = serde_json::to_string(&telegram) else {
                    continue;
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {} // pings and stray client messages are ignored
                }
            }
        }
    }
    debug!(client = %client_id, "telegram stream client disconnected");
}
