//! `WebSocket` event channel.
//!
//! Clients connect to `GET /socket?session=<id>`. The connection becomes the
//! session's event channel: every [`ChannelEvent`] the engine emits for the
//! session is forwarded as a JSON text frame, and inbound text frames are
//! parsed as [`ClientMessage`]s.
//!
//! A newer connection for the same session replaces this one. Closing the
//! socket unbinds the channel but leaves any active run going; the session
//! itself is dropped once it is idle.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use driftline_core::Engine;
use driftline_core::registry;
use driftline_types::{ChannelEvent, ClientMessage, SessionId};
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::session::parse_session;
use crate::state::AppState;

/// Query parameters for `GET /socket`.
#[derive(Debug, serde::Deserialize)]
pub struct SocketQuery {
    /// The session this channel belongs to.
    pub session: String,
}

/// Upgrade an HTTP request to the session's event channel.
///
/// # Route
///
/// `GET /socket?session=<id>`
pub async fn socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<SocketQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let session = parse_session(&query.session)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, session)))
}

/// Handle the channel lifecycle: bind, pump events both ways, unbind.
async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, session: SessionId) {
    let (sender, mut rx) = registry::channel();
    let channel = state.engine.connect(session, sender);
    debug!(%session, %channel, "event channel connected");

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    break;
                };
                let Some(frame) = encode_event(&event) else {
                    continue;
                };
                if socket.send(frame).await.is_err() {
                    debug!(%session, "event channel send failed");
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(message) => apply_client_message(&state.engine, session, message),
                            Err(e) => warn!(%session, error = %e, "ignoring malformed client message"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.engine.disconnect(session, channel);
    debug!(%session, %channel, "event channel disconnected");
}

/// Serialize an event as a text frame.
fn encode_event(event: &ChannelEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            warn!(event = event.name(), error = %e, "failed to serialize event");
            None
        }
    }
}

/// Apply one inbound client message to the session.
pub fn apply_client_message(engine: &Engine, session: SessionId, message: ClientMessage) {
    match message {
        ClientMessage::Ack => engine.acknowledge(session),
        ClientMessage::Kill => {
            if !engine.kill(session) {
                debug!(%session, "kill requested with no active run");
            }
        }
        ClientMessage::IsAsync(enabled) => engine.set_free_run(session, enabled),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::Arc;

    use driftline_core::config::DriftlineConfig;
    use driftline_core::stub::{StubModelProvider, StubOutputterFactory};

    use super::*;

    fn engine() -> Engine {
        let config = DriftlineConfig::default();
        Engine::new(
            &config,
            Arc::new(StubModelProvider::new(config.stub_model.clone())),
            Arc::new(StubOutputterFactory),
        )
    }

    fn connected(engine: &Engine) -> (SessionId, registry::ChannelReceiver) {
        let session = SessionId::new();
        let (tx, rx) = registry::channel();
        engine.connect(session, tx);
        (session, rx)
    }

    #[test]
    fn ack_opens_the_gate() {
        let engine = engine();
        let (session, _rx) = connected(&engine);
        let state = engine.session(session).unwrap();
        assert!(!state.gate().is_set());
        apply_client_message(&engine, session, ClientMessage::Ack);
        assert!(state.gate().is_set());
    }

    #[test]
    fn is_async_toggles_free_run() {
        let engine = engine();
        let (session, _rx) = connected(&engine);
        let state = engine.session(session).unwrap();
        apply_client_message(&engine, session, ClientMessage::IsAsync(true));
        assert!(state.is_free_run());
        apply_client_message(&engine, session, ClientMessage::IsAsync(false));
        assert!(!state.is_free_run());
    }

    #[test]
    fn messages_for_unknown_sessions_create_nothing() {
        let engine = engine();
        let session = SessionId::new();
        apply_client_message(&engine, session, ClientMessage::Ack);
        apply_client_message(&engine, session, ClientMessage::IsAsync(true));
        assert!(engine.session(session).is_none());
        assert!(engine.sessions().is_empty());
    }

    #[test]
    fn kill_without_run_is_harmless() {
        let engine = engine();
        let session = SessionId::new();
        apply_client_message(&engine, session, ClientMessage::Kill);
        assert!(!engine.registry().is_active(session));
    }

    #[test]
    fn events_encode_as_text_frames() {
        match encode_event(&ChannelEvent::Prepared) {
            Some(Message::Text(text)) => assert_eq!(text.as_str(), r#"{"event":"prepared"}"#),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}
