use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dao::models::{SessionConfig, SessionStatus},
    dto::{
        format_system_time,
        validation::{validate_display_name, validate_hex_color},
    },
    state::session::SessionHandle,
};

/// Payload of `POST /live`.
#[derive(Debug, Clone, Deserialize, ToSchema, Validate)]
pub struct CreateSessionRequest {
    pub quiz_id: Uuid,
    /// Questions of the quiz skipped in this session.
    #[serde(default)]
    #[validate(length(max = 500))]
    pub exempted_question_ids: Vec<Uuid>,
    /// Session rules; defaults apply when omitted.
    #[serde(default)]
    pub config: Option<SessionConfig>,
}

/// Live session returned by `POST /live` and `GET /live/{code}/end`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionResponse {
    pub session_id: Uuid,
    pub code: String,
    pub quiz_id: Uuid,
    pub host_user_id: String,
    pub question_count: u32,
    pub status: SessionStatus,
    pub config: SessionConfig,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// `false` when an already running session of the quiz was returned.
    pub created: bool,
}

impl SessionResponse {
    pub fn new(session: &SessionHandle, status: SessionStatus, created: bool) -> Self {
        Self {
            session_id: session.id,
            code: session.code.clone(),
            quiz_id: session.quiz_id,
            host_user_id: session.host_user_id.clone(),
            question_count: session.question_count,
            status,
            config: session.config.clone(),
            created_at: format_system_time(session.created_at),
            created,
        }
    }
}

/// Result of `GET /live/{code}/check`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct CheckResponse {
    pub exists: bool,
    pub session_id: Option<Uuid>,
    pub quiz_id: Option<Uuid>,
    pub question_count: Option<u32>,
    /// Playable order of the current question, `0` before the first one.
    pub current_question: Option<u32>,
    pub status: Option<SessionStatus>,
}

impl CheckResponse {
    pub fn missing() -> Self {
        Self {
            exists: false,
            session_id: None,
            quiz_id: None,
            question_count: None,
            current_question: None,
            status: None,
        }
    }
}

/// Status reached after `GET /live/{code}/interrupt`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InterruptResponse {
    pub session_id: Uuid,
    pub status: SessionStatus,
}

/// Query string of `GET /live/{code}/join`.
#[derive(Debug, Clone, Deserialize, Validate, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct JoinQuery {
    /// Session identifier; must match the session holding the code.
    pub id: Uuid,
    /// Display name shown to other members.
    #[validate(custom(function = "validate_display_name"))]
    pub name: String,
    #[serde(default)]
    #[validate(length(max = 16))]
    pub emoji: Option<String>,
    /// `#RRGGBB` display color.
    #[serde(default)]
    #[validate(custom(function = "validate_hex_color"))]
    pub color: Option<String>,
}
