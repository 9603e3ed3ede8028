use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dto::ws::Content,
    services::session_service::Admission,
    state::{
        SharedState,
        hub::{Frame, Registration},
    },
};

const WRITER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Identity of one connection as known to the hub.
#[derive(Debug, Clone)]
struct ConnectionKey {
    session_id: Uuid,
    user_id: String,
    connection_id: Uuid,
}

/// Handle the full lifecycle of an admitted session connection.
///
/// The writer task drains the bounded outbox the hub feeds; the reader (this task)
/// decodes inbound frames and forwards them to the hub. Either side failing ends
/// the connection and unregisters it.
pub async fn serve(state: SharedState, socket: WebSocket, admission: Admission) {
    let (sender, mut receiver) = socket.split();
    let (outbox_tx, outbox_rx) = mpsc::channel::<Frame>(state.config().outbox_capacity);

    let key = ConnectionKey {
        session_id: admission.session_id,
        user_id: admission.profile.user_id.clone(),
        connection_id: Uuid::new_v4(),
    };

    // Started before registering so the JOINED_LQS frame is flushed right away.
    let writer_task = tokio::spawn(write_outbox(state.clone(), key.clone(), sender, outbox_rx));

    let registration = Registration {
        session_id: admission.session_id,
        connection_id: key.connection_id,
        profile: admission.profile,
        role: admission.role,
        is_host: admission.is_host,
        participant_id: admission.participant_id,
        marks: admission.marks,
        returning: admission.returning,
        outbox: outbox_tx,
    };
    match state.hub().register(registration).await {
        Ok(outcome) => info!(
            session_id = %key.session_id,
            code = %admission.code,
            user_id = %key.user_id,
            role = ?admission.role,
            ?outcome,
            "client connected"
        ),
        Err(err) => {
            // The refused registration dropped the outbox, which closes the socket.
            warn!(session_id = %key.session_id, user_id = %key.user_id, error = %err, "client refused by hub");
            finalize(writer_task).await;
            return;
        }
    }

    while let Some(message) = receiver.next().await {
        let decoded = match message {
            Ok(Message::Text(text)) => Content::from_json_slice(text.as_str().as_bytes()),
            Ok(Message::Binary(bytes)) => Content::from_json_slice(&bytes),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => {
                debug!(session_id = %key.session_id, user_id = %key.user_id, "client closed");
                break;
            }
            Err(err) => {
                warn!(session_id = %key.session_id, user_id = %key.user_id, error = %err, "websocket error");
                break;
            }
        };

        match decoded {
            Ok(content) => {
                debug!(session_id = %key.session_id, user_id = %key.user_id, ?content, "inbound frame");
                let routed = state
                    .hub()
                    .inbound(
                        key.session_id,
                        key.user_id.clone(),
                        key.connection_id,
                        content,
                    )
                    .await;
                if routed.is_err() {
                    warn!(session_id = %key.session_id, "hub stopped; dropping connection");
                    break;
                }
            }
            Err(err) => {
                warn!(
                    session_id = %key.session_id,
                    user_id = %key.user_id,
                    error = %err,
                    "undecodable frame; closing connection"
                );
                break;
            }
        }
    }

    state
        .hub()
        .unregister(key.session_id, key.user_id.clone(), key.connection_id)
        .await;
    info!(session_id = %key.session_id, user_id = %key.user_id, "client disconnected");

    finalize(writer_task).await;
}

/// Forward outbox frames to the socket until the hub closes the outbox or a write fails.
async fn write_outbox(
    state: SharedState,
    key: ConnectionKey,
    mut sender: SplitSink<WebSocket, Message>,
    mut outbox: mpsc::Receiver<Frame>,
) {
    while let Some(frame) = outbox.recv().await {
        if let Err(err) = sender.send(Message::Text(frame.to_string().into())).await {
            debug!(session_id = %key.session_id, user_id = %key.user_id, error = %err, "write failed");
            state
                .hub()
                .unregister(key.session_id, key.user_id, key.connection_id)
                .await;
            return;
        }
    }
    let _ = sender.send(Message::Close(None)).await;
}

/// Ensure the writer task winds down before we return from the socket handler.
async fn finalize(writer_task: JoinHandle<()>) {
    let abort = writer_task.abort_handle();
    if timeout(WRITER_SHUTDOWN_GRACE, writer_task).await.is_err() {
        debug!("writer still running after unregister; aborting");
        abort.abort();
    }
}
