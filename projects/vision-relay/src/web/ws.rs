// Output socket: streams a client's analysis messages as JSON text frames
//
// The socket is attached to the output router under the client id given in
// the query string. Inbound messages are ignored; the socket stays open until
// the client disconnects or the router drops the channel.

use crate::pipeline::orchestrator::SessionManager;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct OutputQuery {
    pub client_id: Option<String>,
}

pub async fn ws_output_handler(
    ws: WebSocketUpgrade,
    State(manager): State<Arc<SessionManager>>,
    Query(query): Query<OutputQuery>,
) -> Response {
    let client_id = match query.client_id.filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => return (StatusCode::BAD_REQUEST, "Missing clientId").into_response(),
    };

    ws.on_upgrade(move |socket| serve_output_channel(socket, client_id, manager))
}

async fn serve_output_channel(socket: WebSocket, client_id: String, manager: Arc<SessionManager>) {
    let (tx, mut rx) = mpsc::channel::<String>(manager.config().output_capacity);
    let generation = manager.router().register_channel(&client_id, tx);
    info!("Output socket connected for client {}", client_id);

    let (mut sink, mut inbound) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let inbound_client = client_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = inbound.next().await {
            match message {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => debug!("Ignoring inbound message from client {}", inbound_client),
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    manager.router().release_channel(&client_id, generation);
    info!("Output socket closed for client {}", client_id);
}
