mod connection;
mod models;
mod registry;
mod service;

pub use connection::{Connection, ConnectionId, Outbox, SendError, WsConnection, OUTBOX_CAPACITY};
pub use models::*;
pub use registry::{RoomRegistry, RunGate, RunGuard, SEND_TIMEOUT};
pub use service::{
    RoomService, BUSY_MESSAGE, EMPTY_CODE_CHUNK, FAILURE_EXIT_CODE, SERVER_ERROR_CHUNK,
    UNSUPPORTED_LANGUAGE_CHUNK,
};

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::Path;
use axum::response::Response;
use axum::routing::get;
use axum::{Extension, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info};

/// Build the room protocol router.
pub fn routes() -> Router {
    Router::new().route("/ws/rooms/:room_id", get(room_socket))
}

async fn room_socket(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    Extension(service): Extension<Arc<RoomService>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, room_id, service))
}

/// Bound on the closing handshake with a client that stopped reading.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

async fn handle_socket(socket: WebSocket, room_id: String, service: Arc<RoomService>) {
    let (sink, mut stream) = socket.split();
    let (connection, outbox) = WsConnection::new(OUTBOX_CAPACITY);
    let connection: Arc<dyn Connection> = connection;
    let connection_id = connection.id().clone();
    info!(room = %room_id, connection = %connection_id, "room socket connected");

    let mut writer = tokio::spawn(write_frames(sink, outbox));
    let mut writer_done = false;

    service.connect(&room_id, &connection).await;

    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = &mut writer => {
                debug!(room = %room_id, connection = %connection_id, "room socket writer stopped");
                writer_done = true;
                break;
            }
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                // Runs are detached, so a close arriving mid-run is still read here.
                let _ = service.dispatch_text(&room_id, &connection, &text).await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(Message::Binary(_))) => {
                debug!(room = %room_id, connection = %connection_id, "ignoring binary frame");
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                debug!(room = %room_id, connection = %connection_id, error = %err, "room socket read failed");
                break;
            }
        }
    }

    service.disconnect(&room_id, &connection_id).await;
    drop(connection);
    if !writer_done {
        let _ = writer.await;
    }
    info!(room = %room_id, connection = %connection_id, "room socket closed");
}

/// Writes queued frames until the connection is dropped or closed, or the socket rejects one.
async fn write_frames(mut sink: SplitSink<WebSocket, Message>, mut outbox: Outbox) {
    while let Some(text) = outbox.recv().await {
        let sent = tokio::select! {
            biased;
            _ = outbox.closed() => break,
            sent = sink.send(Message::Text(text)) => sent,
        };
        if sent.is_err() {
            break;
        }
    }
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
}
