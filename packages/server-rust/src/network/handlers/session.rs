//! WebSocket sessions.
//!
//! Every session is admitted through the lockdown controller and holds its
//! `SessionGuard` for as long as the socket is open, which is what a
//! lockdown drain waits on. Message handling belongs to the chat engine;
//! here frames are only acknowledged.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::debug;

use super::AppState;
use crate::crash::{AdmissionError, LockdownController, SessionGuard};

/// Admits a session or produces the refusal response.
///
/// # Errors
///
/// 503 with the admission error as body.
pub fn admit(lockdown: &LockdownController) -> Result<SessionGuard, Response> {
    lockdown.admit_session().map_err(|err: AdmissionError| {
        (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()
    })
}

/// Upgrades an HTTP connection to a WebSocket session.
pub async fn ws_upgrade_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let guard = match admit(&state.lockdown) {
        Ok(guard) => guard,
        Err(refusal) => return refusal,
    };
    let stop = state.lockdown.shutdown_receiver();
    ws.on_upgrade(move |socket| run_session(socket, guard, stop))
}

async fn run_session(
    mut socket: WebSocket,
    guard: SessionGuard,
    mut stop: tokio::sync::watch::Receiver<bool>,
) {
    debug!("session opened");
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            }
            message = socket.recv() => match message {
                Some(Ok(Message::Text(text))) => {
                    let ack = json!({ "type": "ack", "bytes": text.as_str().len() }).to_string();
                    if socket.send(Message::Text(ack.into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    drop(guard);
    debug!("session closed");
}
