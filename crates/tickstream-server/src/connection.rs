//! `WebSocket` handler for the stream endpoint.
//!
//! Clients connect to `GET /stream`, send `hello`, and then receive the
//! frames the scheduler releases for their session. The connection task
//! owns the socket: it reads client frames and writes whatever arrives
//! on the session's outbound channel.
//!
//! Any protocol violation (malformed frame, unknown type, schema failure,
//! a message before `hello`, a second `hello`, a binary frame) is
//! answered with `bye{reason}` and the socket is closed.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use tickstream_types::{ClientMessage, ProtocolError, ServerMessage, SessionId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::hub::AttachError;
use crate::session::{Outbound, SessionPhase};
use crate::state::AppState;

/// Header selecting the role (and with it the per-pass send cap).
pub const ROLE_HEADER: &str = "x-user-role";

/// Role assumed when the header is absent.
pub const DEFAULT_ROLE: &str = "default";

/// Upgrade an HTTP request to a stream connection.
///
/// # Route
///
/// `GET /stream`
pub async fn stream_ws(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let role = headers
        .get(ROLE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_ROLE)
        .to_owned();
    ws.on_upgrade(move |socket| handle_stream(socket, state, role))
}

/// What the read side decided about one client frame.
enum Inbound {
    /// Keep going.
    Continue,
    /// Handshake done; start forwarding this channel.
    Attached(SessionId, mpsc::Receiver<Outbound>),
    /// Say `bye` with this reason and close.
    Bye(String),
}

/// Per-connection state machine.
struct Connection {
    state: Arc<AppState>,
    role: String,
    phase: SessionPhase,
    session_id: Option<SessionId>,
}

impl Connection {
    fn on_text(&mut self, text: &str) -> Inbound {
        let msg = match ClientMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => return self.violation(&e),
        };

        match (self.phase, self.session_id, msg) {
            (SessionPhase::Connecting, _, ClientMessage::Hello(hello)) => {
                match self.state.hub.attach(&hello, &self.role) {
                    Ok(attached) => {
                        self.phase = SessionPhase::Active;
                        self.session_id = Some(attached.session_id);
                        Inbound::Attached(attached.session_id, attached.outbound)
                    }
                    Err(AttachError::Protocol(e)) => self.violation(&e),
                    Err(e) => {
                        warn!(error = %e, "Failed to attach session");
                        Inbound::Bye(String::from("internal error"))
                    }
                }
            }
            (SessionPhase::Connecting, _, other) => {
                self.violation(&ProtocolError::ExpectedHello(other.kind()))
            }
            (SessionPhase::Active, _, ClientMessage::Hello(_)) => {
                self.violation(&ProtocolError::DuplicateHello)
            }
            (SessionPhase::Active, Some(id), ClientMessage::Credit(credit)) => {
                if self
                    .state
                    .hub
                    .grant(id, credit.n, credit.last_applied)
                    .is_none()
                {
                    return Inbound::Bye(String::from("session closed"));
                }
                Inbound::Continue
            }
            (SessionPhase::Active, Some(id), ClientMessage::Pong(pong)) => {
                self.state.hub.record_pong(id, pong.t);
                Inbound::Continue
            }
            (SessionPhase::Active | SessionPhase::Closed, _, _) => {
                Inbound::Bye(String::from("session closed"))
            }
        }
    }

    fn violation(&self, error: &ProtocolError) -> Inbound {
        self.state.hub.metrics().inc_protocol_violation();
        warn!(
            session_id = ?self.session_id,
            phase = ?self.phase,
            error = %error,
            "Protocol violation"
        );
        Inbound::Bye(error.bye_reason().to_owned())
    }

    fn close(&mut self) {
        self.phase = SessionPhase::Closed;
        if let Some(id) = self.session_id.take() {
            self.state.hub.detach(id, None);
        }
    }
}

/// Next outbound item, or never if the handshake has not happened.
async fn next_outbound(rx: &mut Option<mpsc::Receiver<Outbound>>) -> Option<Outbound> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Send `bye{reason}` and a close frame, ignoring errors.
async fn say_bye(socket: &mut WebSocket, reason: &str) {
    if let Ok(json) = ServerMessage::bye(reason).to_json() {
        let _ = socket.send(Message::Text(json.into())).await;
    }
    let frame = CloseFrame {
        code: close_code::NORMAL,
        reason: reason.to_owned().into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Handle the connection lifecycle.
async fn handle_stream(mut socket: WebSocket, state: Arc<AppState>, role: String) {
    debug!(role, "Stream client connected");

    let mut conn = Connection {
        state,
        role,
        phase: SessionPhase::Connecting,
        session_id: None,
    };
    let mut outbound: Option<mpsc::Receiver<Outbound>> = None;

    loop {
        tokio::select! {
            // Frames released by the scheduler for this session.
            item = next_outbound(&mut outbound) => {
                match item {
                    Some(Outbound::Text(frame)) => {
                        if socket.send(Message::Text(frame.as_ref().into())).await.is_err() {
                            debug!(session_id = ?conn.session_id, "Stream client disconnected (send failed)");
                            break;
                        }
                    }
                    Some(Outbound::Close(reason)) => {
                        say_bye(&mut socket, &reason).await;
                        break;
                    }
                    None => {
                        debug!(session_id = ?conn.session_id, "Session dropped by server");
                        say_bye(&mut socket, "closed").await;
                        break;
                    }
                }
            }
            // Frames from the client.
            msg = socket.recv() => {
                let inbound = match msg {
                    Some(Ok(Message::Text(text))) => conn.on_text(text.as_str()),
                    Some(Ok(Message::Binary(_))) => conn.violation(&ProtocolError::BinaryFrame),
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        Inbound::Continue
                    }
                    Some(Ok(Message::Pong(_))) => Inbound::Continue,
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(session_id = ?conn.session_id, "Stream client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(session_id = ?conn.session_id, "Stream socket error: {e}");
                        break;
                    }
                };

                match inbound {
                    Inbound::Continue => {}
                    Inbound::Attached(id, rx) => {
                        debug!(session_id = %id, "Stream client attached");
                        outbound = Some(rx);
                    }
                    Inbound::Bye(reason) => {
                        // Anything already released goes out before the bye.
                        if let Some(rx) = outbound.as_mut() {
                            while let Ok(Outbound::Text(frame)) = rx.try_recv() {
                                let _ = socket.send(Message::Text(frame.as_ref().into())).await;
                            }
                        }
                        say_bye(&mut socket, &reason).await;
                        break;
                    }
                }
            }
        }
    }

    conn.close();
}
