use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures_util::StreamExt;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::auth;
use crate::protocol::{Frame, OpCode, Timeout};
use crate::queue::ReplayQueue;
use crate::scheduler::Scheduler;
use crate::session::{Session, SessionSlot};
use crate::storage::TimeoutStore;

/// Everything the relay endpoint needs, passed to the router instead of
/// living in process-wide statics.
#[derive(Clone)]
pub struct RelayState {
    pub slot: SessionSlot,
    pub queue: Arc<ReplayQueue>,
    pub store: Arc<dyn TimeoutStore>,
    pub scheduler: Scheduler,
    auth_secret: String,
}

impl RelayState {
    pub fn new(store: Arc<dyn TimeoutStore>, auth_secret: String) -> Self {
        let slot = SessionSlot::default();
        let queue = Arc::new(ReplayQueue::default());
        let scheduler = Scheduler::new(store.clone(), slot.clone(), queue.clone());

        Self {
            slot,
            queue,
            store,
            scheduler,
            auth_secret,
        }
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(relay_handler))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// WebSocket upgrade handler. The auth gate runs before the upgrade
/// completes: a missing or mismatched credential never gets a session.
async fn relay_handler(
    State(state): State<RelayState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    match presented {
        Some(credential) if auth::authenticate(credential, &state.auth_secret) => ws
            .on_upgrade(move |socket| handle_socket(socket, state))
            .into_response(),
        _ => {
            warn!("rejected controller connection with missing or bad credential");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

/// Owns one controller connection: installs it as the active session, sends
/// `Ready`, drains the replay queue, then reads frames until the transport
/// dies. This loop is the sole detector of disconnection.
async fn handle_socket(socket: WebSocket, state: RelayState) {
    let (writer, mut receiver) = socket.split();
    let session = Arc::new(Session::new(writer));
    let session_id = state.slot.install(session.clone());
    info!(session = %session_id, "controller session established");

    session.send(&Frame::ready()).await;
    if state.slot.is_current(session_id) {
        flush_replay(&state, &session).await;
    }

    while let Some(next) = receiver.next().await {
        let message = match next {
            Ok(message) => message,
            Err(err) => {
                warn!(session = %session_id, error = %err, "transport error, treating as disconnect");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                if !state.slot.is_current(session_id) {
                    debug!(session = %session_id, "ignoring frame from superseded session");
                    continue;
                }

                // Deliveries that accumulated mid-session drain before the
                // next inbound frame is dispatched, not only at connect.
                flush_replay(&state, &session).await;

                match serde_json::from_str::<Frame>(&text) {
                    Ok(frame) => handle_frame(&state, &session, frame).await,
                    Err(err) => {
                        warn!(session = %session_id, error = %err, "dropping malformed frame")
                    }
                }
            }
            Message::Close(frame) => {
                match frame {
                    Some(CloseFrame { code, reason })
                        if matches!(
                            code,
                            close_code::AWAY | close_code::ABNORMAL | close_code::ERROR
                        ) =>
                    {
                        info!(
                            session = %session_id,
                            code,
                            reason = %reason,
                            "controller went away, will replay events once it is back"
                        );
                    }
                    Some(CloseFrame { code, .. }) => {
                        info!(session = %session_id, code, "controller closed the session");
                    }
                    None => info!(session = %session_id, "controller closed the session"),
                }
                break;
            }
            // Binary, ping and pong frames are tolerated, not dispatched.
            _ => {}
        }
    }

    if state.slot.clear_if_current(session_id) {
        info!(session = %session_id, "controller disconnected, timers will queue for replay");
    }
}

/// Drains the replay queue into this session, oldest first. Entries pushed
/// here keep their durable records; only a timer firing against a live
/// session confirms delivery hard enough to delete.
async fn flush_replay(state: &RelayState, session: &Arc<Session>) {
    let drained = state
        .queue
        .drain_if_nonempty(|timeout| {
            let session = session.clone();
            async move { session.send(&Frame::apply(&timeout)).await }
        })
        .await;

    if drained > 0 {
        info!(count = drained, "replayed queued expiries to controller");
    }
}

/// Protocol dispatcher: routes one decoded inbound frame.
async fn handle_frame(state: &RelayState, session: &Arc<Session>, frame: Frame) {
    match frame.op {
        OpCode::Request => match frame.timeout_payload() {
            Ok(timeout) => {
                debug!(
                    key = %timeout.storage_key(),
                    kind = ?timeout.kind,
                    "controller requested a timeout"
                );
                state.scheduler.schedule(timeout).await;
            }
            Err(err) => warn!(error = %err, "dropping request frame"),
        },

        OpCode::RequestAll => {
            let records = match state.store.all().await {
                Ok(records) => records,
                Err(err) => {
                    warn!(error = %err, "unable to read timeout records, answering with an empty mapping");
                    HashMap::new()
                }
            };
            session.send(&Frame::request_all_back(&records)).await;
        }

        OpCode::Acknowledged => {
            let entries = match frame.batch_payload() {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(error = %err, "dropping acknowledged frame");
                    return;
                }
            };
            // Controllers send this as bulk catch-up on their own startup;
            // one bad entry must not sink the rest of the batch.
            for entry in entries {
                match serde_json::from_value::<Timeout>(entry) {
                    Ok(timeout) => state.scheduler.schedule(timeout).await,
                    Err(err) => warn!(error = %err, "skipping undecodable acknowledged entry"),
                }
            }
        }

        op @ (OpCode::Ready | OpCode::Apply | OpCode::RequestAllBack) => {
            debug!(?op, "ignoring outbound-only opcode from controller");
        }
    }
}
