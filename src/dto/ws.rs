//! Frames exchanged with live session WebSocket clients.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dao::{
    cache::ResponseAggregate,
    models::{ParticipantStatus, QuestionType, SessionStatus},
    quiz_catalog::QuestionMedia,
};

/// Frames accepted from clients: `{"type": ..., "payload": ...}`. Unknown tags fail to decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Content {
    JoinLqs,
    LeaveLqs,
    StartLqs,
    EndLqs,
    NextQuestion,
    Interrupt,
    SubmitAnswer { order: u32, option_ids: Vec<Uuid> },
    UnsubmitAnswer { order: u32 },
    GetParticipants,
    GetLeaderboard,
    KickParticipant { user_id: String },
    ToggleLock,
}

impl Content {
    /// Commands reserved to the host.
    pub fn is_host_command(&self) -> bool {
        matches!(
            self,
            Content::StartLqs
                | Content::EndLqs
                | Content::NextQuestion
                | Content::Interrupt
                | Content::KickParticipant { .. }
                | Content::ToggleLock
        )
    }

    /// Decode a text or binary frame body.
    pub fn from_json_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// One row of a leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: u32,
    pub user_id: Option<String>,
    pub name: String,
    pub emoji: Option<String>,
    pub marks: f64,
}

/// Option as shown to participants (correctness and marks withheld).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionView {
    pub id: Uuid,
    pub content: String,
    pub color: Option<String>,
}

/// Participant as listed to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantView {
    pub user_id: Option<String>,
    pub name: String,
    pub emoji: Option<String>,
    pub color: Option<String>,
    pub marks: f64,
    pub status: ParticipantStatus,
    pub connected: bool,
}

/// Frames emitted by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerContent {
    JoinedLqs {
        user_id: String,
        name: String,
        emoji: Option<String>,
        color: Option<String>,
        is_host: bool,
    },
    LeftLqs {
        user_id: String,
        name: String,
    },
    Countdown {
        remaining: u64,
        status: SessionStatus,
    },
    DistributeQuestion {
        order: u32,
        total: u32,
        question_id: Uuid,
        content: String,
        question_type: QuestionType,
        time_limit_secs: u64,
        has_media: bool,
    },
    DistributeMedia {
        order: u32,
        question_id: Uuid,
        media: QuestionMedia,
    },
    DistributeOptions {
        order: u32,
        question_id: Uuid,
        time_limit_secs: u64,
        options: Vec<OptionView>,
    },
    RevealAnswer {
        order: u32,
        question_id: Uuid,
        correct_option_ids: Vec<Uuid>,
        distribution: ResponseAggregate,
    },
    ConcludeQuestion {
        order: u32,
        question_id: Uuid,
        distribution: ResponseAggregate,
    },
    Conclude {
        leaderboard: Vec<LeaderboardEntry>,
    },
    EndLqs {
        reason: String,
    },
    Leaderboard {
        order: Option<u32>,
        entries: Vec<LeaderboardEntry>,
    },
    MiniLeaderboard {
        order: u32,
        entries: Vec<LeaderboardEntry>,
    },
    Participants {
        participants: Vec<ParticipantView>,
    },
    SessionState {
        session_id: Uuid,
        code: String,
        status: SessionStatus,
        current_question: u32,
        question_count: u32,
        locked: bool,
        marks: Option<f64>,
    },
    AnswerAccepted {
        order: u32,
        question_id: Uuid,
        marks: f64,
        total_marks: f64,
    },
    AnswerRejected {
        order: u32,
        reason: String,
    },
    LockToggled {
        locked: bool,
    },
    Kicked {
        reason: String,
    },
    Error {
        message: String,
    },
}

/// Outbound wrapper: `{ content, live_quiz_session_id, uid }`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<C> {
    pub content: C,
    pub live_quiz_session_id: Uuid,
    /// Originating user, empty for frames produced by the server itself.
    pub uid: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn unit_frames_decode_without_payload() {
        let content: Content = serde_json::from_str(r#"{"type":"START_LQS"}"#).unwrap();
        assert_eq!(content, Content::StartLqs);
        assert!(content.is_host_command());
    }

    #[test]
    fn submit_answer_decodes_payload() {
        let option = Uuid::new_v4();
        let content = Content::from_json_slice(
            json!({"type": "SUBMIT_ANSWER", "payload": {"order": 2, "option_ids": [option]}})
                .to_string()
                .as_bytes(),
        )
        .unwrap();
        assert_eq!(
            content,
            Content::SubmitAnswer {
                order: 2,
                option_ids: vec![option]
            }
        );
        assert!(!content.is_host_command());
    }

    #[test]
    fn unknown_tags_are_rejected() {
        assert!(serde_json::from_str::<Content>(r#"{"type":"SELF_DESTRUCT"}"#).is_err());
        assert!(serde_json::from_str::<Content>(r#"{"payload":{}}"#).is_err());
    }

    #[test]
    fn envelope_wraps_server_content() {
        let session_id = Uuid::new_v4();
        let frame = serde_json::to_value(Envelope {
            content: ServerContent::Countdown {
                remaining: 3,
                status: SessionStatus::Starting,
            },
            live_quiz_session_id: session_id,
            uid: String::new(),
        })
        .unwrap();

        assert_eq!(
            frame,
            json!({
                "content": {"type": "COUNTDOWN", "payload": {"remaining": 3, "status": "STARTING"}},
                "live_quiz_session_id": session_id,
                "uid": ""
            })
        );
    }
}
