//! `/ws/tasks` bridge: fans the queue's `task:update` pub/sub channel out to
//! many subscriber sockets, each filtered and bounded independently so one
//! slow client can't stall the broker or its peers.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::dispatch::TASK_UPDATE_CHANNEL;
use crate::rpc::AppState;

const LAG_CLOSE_CODE: u16 = 4008;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new().route("/ws/tasks", get(ws_upgrade)).with_state(state)
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeFilter {
    task_id: Option<Uuid>,
    pool: Option<String>,
}

impl SubscribeFilter {
    fn matches(&self, message: &Value) -> bool {
        if let Some(task_id) = self.task_id {
            if message.get("task_id").and_then(Value::as_str) != Some(task_id.to_string()).as_deref() {
                return false;
            }
        }
        if let Some(pool) = &self.pool {
            if message.get("pool").and_then(Value::as_str) != Some(pool.as_str()) {
                return false;
            }
        }
        true
    }
}

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<SubscribeFilter>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, filter, socket))
}

async fn handle_socket(state: Arc<AppState>, filter: SubscribeFilter, mut socket: WebSocket) {
    let updates = match state.queue.subscribe(TASK_UPDATE_CHANNEL).await {
        Ok(rx) => rx,
        Err(err) => {
            tracing::warn!(error = %err, "ws subscribe to task:update failed");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    // Re-pump the queue's subscription through a connection-local bounded
    // channel sized by `ws_subscriber_buffer`. `try_send` never blocks: a
    // slow reader fills this buffer, the pump breaks, and the main loop
    // below observes the closed channel and drops the connection with a
    // `lag` close code instead of letting it stall the broker.
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Value>(state.cfg.ws_subscriber_buffer.max(1));
    let overflowed = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let pump = tokio::spawn(pump_updates(updates, tx, overflowed.clone()));

    loop {
        tokio::select! {
            biased;

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }

            message = rx.recv() => {
                let Some(message) = message else { break };

                if !filter.matches(&message) {
                    continue;
                }

                let Ok(text) = serde_json::to_string(&message) else { continue };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    }

    pump.abort();

    if overflowed.load(std::sync::atomic::Ordering::Acquire) {
        let frame = CloseFrame {
            code: LAG_CLOSE_CODE,
            reason: "subscriber buffer overflow; resync via Task.get".into(),
        };
        let _ = socket.send(Message::Close(Some(frame))).await;
    }
}

async fn pump_updates(
    mut updates: tokio::sync::mpsc::Receiver<Value>,
    tx: tokio::sync::mpsc::Sender<Value>,
    overflowed: Arc<std::sync::atomic::AtomicBool>,
) {
    while let Some(message) = updates.recv().await {
        if tx.try_send(message).is_err() {
            overflowed.store(true, std::sync::atomic::Ordering::Release);
            return;
        }
    }
}
