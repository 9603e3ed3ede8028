//! Types shared between the hub, session controllers and boundary handlers.

use std::time::SystemTime;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::{
    dao::models::{SessionConfig, SessionStatus},
    dto::ws::Content,
    error::ServiceError,
};

/// Role a connection plays in its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientRole {
    Host,
    Participant,
    /// Console connection receiving broadcasts without being a participant.
    Moderator,
}

/// Display identity of a connected user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProfile {
    pub user_id: String,
    pub name: String,
    pub emoji: Option<String>,
    pub color: Option<String>,
}

/// Why a session ended, as announced in `END_LQS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    HostEnded,
    Completed,
    DataUnavailable,
    Internal,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::HostEnded => "host_ended",
            EndReason::Completed => "completed",
            EndReason::DataUnavailable => "data_unavailable",
            EndReason::Internal => "internal",
        }
    }
}

/// Progress of a session as reported by its controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSnapshot {
    pub status: SessionStatus,
    pub current_question: u32,
    pub question_count: u32,
    pub locked: bool,
}

/// Messages consumed by a session controller.
#[derive(Debug)]
pub enum ControllerCommand {
    /// Frame received from a client, tagged by the hub with host privileges.
    Inbound {
        user_id: String,
        is_host: bool,
        content: Content,
    },
    /// A client finished registering with the hub.
    ClientJoined {
        profile: ClientProfile,
        role: ClientRole,
        participant_id: Option<Uuid>,
        marks: f64,
    },
    /// A client disconnected or was evicted.
    ClientLeft { user_id: String },
    /// Host asked to skip the running timer.
    Interrupt {
        reply: oneshot::Sender<Result<SessionStatus, ServiceError>>,
    },
    /// Tear the session down.
    End {
        reason: EndReason,
        reply: Option<oneshot::Sender<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<ControllerSnapshot>,
    },
}

/// Entry of the live session index held by the application state.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    pub code: String,
    pub quiz_id: Uuid,
    pub host_user_id: String,
    pub question_count: u32,
    pub config: SessionConfig,
    pub created_at: SystemTime,
    pub commands: mpsc::Sender<ControllerCommand>,
}
