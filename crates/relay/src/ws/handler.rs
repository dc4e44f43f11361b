use super::protocol::{decode_frame, send_frame};
use crate::directory::IdentityDirectory;
use crate::error::{request_id_from_headers_or_generate, with_request_id_scope};
use crate::metrics;
use crate::presence::PresenceState;
use crate::store::MessageStore;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use consulta_common::protocol::chat::ChatFrame;
use consulta_common::types::{ChatMessage, Role, UserProfile};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::error;
use uuid::Uuid;

pub(crate) const MAX_FRAME_BYTES: usize = 65_536;

/// Per-connection protocol state.
///
/// Frame dispatch is keyed on `(state, frame kind)`; every invalid pair
/// funnels into one rejection path that emits an `error` frame and
/// leaves the state untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Unidentified,
    Identified { user_id: i64 },
    InSession { user_id: i64, session_id: i64 },
}

impl ConnState {
    fn user_id(self) -> Option<i64> {
        match self {
            Self::Unidentified => None,
            Self::Identified { user_id } | Self::InSession { user_id, .. } => Some(user_id),
        }
    }
}

#[derive(Clone)]
pub(crate) struct ChatRouterState {
    pub(crate) presence: PresenceState,
    pub(crate) message_store: MessageStore,
    pub(crate) directory: IdentityDirectory,
}

pub fn router(
    presence: PresenceState,
    message_store: MessageStore,
    directory: IdentityDirectory,
) -> Router {
    let state = ChatRouterState { presence, message_store, directory };

    Router::new().route("/v1/consult/ws", get(ws_upgrade)).with_state(state)
}

pub async fn ws_upgrade(
    State(state): State<ChatRouterState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = request_id_from_headers_or_generate(&headers);
    // Oversize handling stays at the application level (error frame,
    // connection survives) rather than a transport close.
    ws.on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, handle_socket(state, socket)).await;
    })
}

async fn handle_socket(state: ChatRouterState, mut socket: WebSocket) {
    let conn_id = Uuid::new_v4();
    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ChatFrame>();
    let mut conn = ConnState::Unidentified;

    loop {
        tokio::select! {
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(outbound_frame) => {
                        if send_frame(&mut socket, &outbound_frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_frame)) => {
                        if raw_frame.len() > MAX_FRAME_BYTES {
                            if send_frame(
                                &mut socket,
                                &protocol_error("frame exceeds maximum size"),
                            )
                            .await
                            .is_err()
                            {
                                break;
                            }
                            continue;
                        }

                        let inbound = match decode_frame(&raw_frame) {
                            Ok(frame) => frame,
                            Err(_) => {
                                if send_frame(
                                    &mut socket,
                                    &protocol_error("invalid frame payload"),
                                )
                                .await
                                .is_err()
                                {
                                    break;
                                }
                                continue;
                            }
                        };

                        let started_at = Instant::now();
                        let kind = frame_kind(&inbound);
                        let mut send_failed = false;
                        match dispatch(&state, &mut conn, conn_id, &outbound_sender, inbound).await {
                            Ok(replies) => {
                                metrics::record_ws_request(
                                    kind,
                                    false,
                                    started_at.elapsed().as_millis() as u64,
                                );
                                for reply in replies {
                                    if send_frame(&mut socket, &reply).await.is_err() {
                                        send_failed = true;
                                        break;
                                    }
                                }
                            }
                            Err(error_frame) => {
                                metrics::record_ws_request(
                                    kind,
                                    true,
                                    started_at.elapsed().as_millis() as u64,
                                );
                                send_failed =
                                    send_frame(&mut socket, &error_frame).await.is_err();
                            }
                        }
                        refresh_gauges(&state.presence).await;

                        if send_failed {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }

    // Transport close is an implicit leave + unregister. The conn_id
    // guard keeps this from evicting a newer registration made by a
    // reconnecting client.
    if let Some(user_id) = conn.user_id() {
        state.presence.unregister(user_id, conn_id).await;
    }
    refresh_gauges(&state.presence).await;
}

async fn dispatch(
    state: &ChatRouterState,
    conn: &mut ConnState,
    conn_id: Uuid,
    outbound: &mpsc::UnboundedSender<ChatFrame>,
    frame: ChatFrame,
) -> Result<Vec<ChatFrame>, ChatFrame> {
    match (*conn, frame) {
        (
            ConnState::Unidentified | ConnState::Identified { .. },
            ChatFrame::Identify { user_id, role },
        ) => handle_identify(state, conn, conn_id, outbound, user_id, role)
            .await
            .map(|identified| vec![identified]),

        // Everything else requires an identity first.
        (ConnState::Unidentified, _) => Err(protocol_error("not identified")),

        (
            ConnState::Identified { user_id } | ConnState::InSession { user_id, .. },
            ChatFrame::JoinSession { session_id, user_id: claimed_user_id },
        ) => handle_join(state, conn, user_id, claimed_user_id, session_id)
            .await
            .map(|history| vec![history]),

        (
            ConnState::InSession { user_id, session_id },
            ChatFrame::LeaveSession { session_id: target_session_id, user_id: claimed_user_id },
        ) => handle_leave(state, conn, user_id, claimed_user_id, session_id, target_session_id)
            .await
            .map(|_| Vec::new()),

        // Leaving while in no session is a no-op by contract.
        (ConnState::Identified { .. }, ChatFrame::LeaveSession { .. }) => Ok(Vec::new()),

        (ConnState::InSession { user_id, session_id }, ChatFrame::NewMessage { message }) => {
            handle_new_message(state, user_id, session_id, message).await.map(|_| Vec::new())
        }

        (ConnState::Identified { .. }, ChatFrame::NewMessage { .. }) => {
            Err(protocol_error("join a session before sending messages"))
        }

        (ConnState::InSession { .. }, ChatFrame::Identify { .. }) => {
            Err(protocol_error("leave the session before re-identifying"))
        }

        // Server-to-client frames are not valid inbound.
        (_, ChatFrame::Identified { .. })
        | (_, ChatFrame::SessionHistory { .. })
        | (_, ChatFrame::Error { .. }) => Err(protocol_error("unsupported frame type")),
    }
}

async fn handle_identify(
    state: &ChatRouterState,
    conn: &mut ConnState,
    conn_id: Uuid,
    outbound: &mpsc::UnboundedSender<ChatFrame>,
    user_id: i64,
    role: Role,
) -> Result<ChatFrame, ChatFrame> {
    let display_name = match state.directory.display_name(user_id, role).await {
        Ok(Some(display_name)) => display_name,
        Ok(None) => return Err(protocol_error("unknown user id for role")),
        Err(lookup_error) => {
            error!(error = ?lookup_error, user_id, %role, "identity lookup failed");
            return Err(protocol_error("identity lookup failed"));
        }
    };

    // Re-identifying under a different id releases the old registration
    // before the new one is created, so no stale entry survives on this
    // transport.
    if let Some(previous_user_id) = conn.user_id() {
        if previous_user_id != user_id {
            state.presence.unregister(previous_user_id, conn_id).await;
        }
    }

    state
        .presence
        .register(user_id, role, display_name.clone(), conn_id, outbound.clone())
        .await;
    *conn = ConnState::Identified { user_id };

    Ok(ChatFrame::Identified { user: UserProfile { id: user_id, display_name, role } })
}

async fn handle_join(
    state: &ChatRouterState,
    conn: &mut ConnState,
    user_id: i64,
    claimed_user_id: i64,
    session_id: i64,
) -> Result<ChatFrame, ChatFrame> {
    if claimed_user_id != user_id {
        return Err(protocol_error("user_id does not match the identified user"));
    }

    if !state.presence.join(user_id, session_id).await {
        return Err(protocol_error("not identified"));
    }

    // Best-effort: a dead store means an empty history, never a failed
    // join. Whatever was not durably persisted is legitimately absent.
    let messages = state.message_store.history_best_effort(session_id).await;
    *conn = ConnState::InSession { user_id, session_id };

    Ok(ChatFrame::SessionHistory { messages })
}

async fn handle_leave(
    state: &ChatRouterState,
    conn: &mut ConnState,
    user_id: i64,
    claimed_user_id: i64,
    current_session_id: i64,
    target_session_id: i64,
) -> Result<(), ChatFrame> {
    if claimed_user_id != user_id {
        return Err(protocol_error("user_id does not match the identified user"));
    }

    // Leaving a session this connection is not in is a no-op.
    if target_session_id == current_session_id {
        state.presence.leave(user_id, current_session_id).await;
        *conn = ConnState::Identified { user_id };
    }

    Ok(())
}

async fn handle_new_message(
    state: &ChatRouterState,
    user_id: i64,
    session_id: i64,
    draft: ChatMessage,
) -> Result<usize, ChatFrame> {
    if draft.session_id != session_id {
        return Err(protocol_error("message session does not match the joined session"));
    }
    if draft.text.trim().is_empty() {
        return Err(protocol_error("message text must not be empty"));
    }

    // Sender fields come from the registered identity, not the draft.
    let Some((sender_role, sender_display_name)) = state.presence.profile_of(user_id).await
    else {
        return Err(protocol_error("not identified"));
    };

    let created_at = Utc::now();
    let mut message = ChatMessage {
        id: 0,
        session_id,
        text: draft.text,
        sender_role,
        sender_user_id: user_id,
        sender_display_name,
        created_at: Some(created_at),
        read: false,
    };

    message.id = match state.message_store.append_best_effort(&message).await {
        Some(store_id) => store_id,
        // Durability is lost but delivery proceeds; the timestamp keeps
        // the synthesized id usable for client-side keying.
        None => created_at.timestamp_millis(),
    };

    Ok(state.presence.broadcast(session_id, &ChatFrame::NewMessage { message }).await)
}

fn protocol_error(message: impl Into<String>) -> ChatFrame {
    ChatFrame::Error { message: message.into() }
}

fn frame_kind(frame: &ChatFrame) -> &'static str {
    match frame {
        ChatFrame::Identify { .. } => "identify",
        ChatFrame::JoinSession { .. } => "join_session",
        ChatFrame::LeaveSession { .. } => "leave_session",
        ChatFrame::NewMessage { .. } => "new_message",
        ChatFrame::Identified { .. } | ChatFrame::SessionHistory { .. } | ChatFrame::Error { .. } => {
            "server_frame"
        }
    }
}

async fn refresh_gauges(presence: &PresenceState) {
    metrics::set_connected_clients(presence.connected_clients().await);
    metrics::set_occupied_sessions(presence.occupied_sessions().await);
}
