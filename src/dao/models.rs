use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, time::SystemTime};
use utoipa::ToSchema;
use uuid::Uuid;

/// Persisted lifecycle status of a live session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Idle,
    Starting,
    Questioning,
    Media,
    Answering,
    RevealingAnswer,
    Leaderboard,
    Concluding,
    Ending,
    Ended,
}

impl SessionStatus {
    /// Whether the session still occupies its code and quiz slot.
    pub fn is_live(self) -> bool {
        !matches!(self, SessionStatus::Ended)
    }

    /// Stable wire/database name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Idle => "IDLE",
            SessionStatus::Starting => "STARTING",
            SessionStatus::Questioning => "QUESTIONING",
            SessionStatus::Media => "MEDIA",
            SessionStatus::Answering => "ANSWERING",
            SessionStatus::RevealingAnswer => "REVEALING_ANSWER",
            SessionStatus::Leaderboard => "LEADERBOARD",
            SessionStatus::Concluding => "CONCLUDING",
            SessionStatus::Ending => "ENDING",
            SessionStatus::Ended => "ENDED",
        }
    }
}

/// Membership status of a persisted participant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantStatus {
    Joined,
    Left,
    Kicked,
}

impl ParticipantStatus {
    /// Stable database name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            ParticipantStatus::Joined => "JOINED",
            ParticipantStatus::Left => "LEFT",
            ParticipantStatus::Kicked => "KICKED",
        }
    }
}

/// Kind of question being answered, copied from the quiz read-side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuestionType {
    SingleChoice,
    MultipleChoice,
    TrueFalse,
}

/// How many leaderboard rows are shown to players.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LeaderboardSize {
    Top3,
    Top5,
    #[default]
    Top10,
    All,
}

impl LeaderboardSize {
    /// Maximum number of rows, `None` meaning every participant.
    pub fn limit(self) -> Option<usize> {
        match self {
            LeaderboardSize::Top3 => Some(3),
            LeaderboardSize::Top5 => Some(5),
            LeaderboardSize::Top10 => Some(10),
            LeaderboardSize::All => None,
        }
    }
}

/// Participant-facing rules of a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(default)]
pub struct ParticipantRules {
    /// Whether a participant may replace or retract an answer.
    pub reanswer: bool,
}

/// Leaderboard display rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(default)]
pub struct LeaderboardRules {
    /// Emit a mini leaderboard after every accepted submission.
    pub during_questions: bool,
    /// Insert a leaderboard state between questions.
    pub between_questions: bool,
    /// Number of rows shown.
    pub size: LeaderboardSize,
}

impl Default for LeaderboardRules {
    fn default() -> Self {
        Self {
            during_questions: false,
            between_questions: true,
            size: LeaderboardSize::default(),
        }
    }
}

/// Option display rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(default)]
pub struct OptionRules {
    /// Hide option colors on participant devices.
    pub colorless: bool,
    /// Reveal the correct option(s) after answering closes.
    pub show_correct_answer: bool,
}

impl Default for OptionRules {
    fn default() -> Self {
        Self {
            colorless: false,
            show_correct_answer: true,
        }
    }
}

/// Host-selected configuration of a live session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(default)]
pub struct SessionConfig {
    pub participant: ParticipantRules,
    pub leaderboard: LeaderboardRules,
    pub option: OptionRules,
}

/// Live session record persisted by the storage layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionEntity {
    /// Primary key of the session.
    pub id: Uuid,
    /// Identity of the host that created the session.
    pub host_user_id: String,
    /// Quiz being played.
    pub quiz_id: Uuid,
    /// Six character join code.
    pub code: String,
    /// Last persisted status.
    pub status: SessionStatus,
    /// Questions of the quiz that are skipped in this session.
    pub exempted_question_ids: Vec<Uuid>,
    /// Rules chosen by the host.
    pub config: SessionConfig,
    /// Number of playable questions.
    pub question_count: u32,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    /// Set once the session is ended; the row is kept for history.
    pub ended_at: Option<SystemTime>,
}

/// Persisted projection of a connected (or formerly connected) participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParticipantEntity {
    pub id: Uuid,
    /// Bearer identity; absent for anonymous participants.
    pub user_id: Option<String>,
    pub session_id: Uuid,
    pub name: String,
    pub emoji: Option<String>,
    pub color: Option<String>,
    pub status: ParticipantStatus,
    /// Running total of marks.
    pub marks: f64,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

/// One submission of one participant to one question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnswerResponseEntity {
    pub id: Uuid,
    pub session_id: Uuid,
    pub participant_id: Uuid,
    pub question_id: Uuid,
    /// Playable position of the question within the session (1-based).
    pub question_order: u32,
    pub question_type: QuestionType,
    /// Selected option identifiers.
    pub answer: Vec<Uuid>,
    /// Marks awarded for this answer.
    pub marks: f64,
    /// Time between options being distributed and the submission.
    pub use_time_ms: u64,
    pub created_at: SystemTime,
}

/// History row written for every status change of a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionHistoryEntity {
    pub id: Uuid,
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub question_order: Option<u32>,
    pub recorded_at: SystemTime,
}

/// Keys a session can be looked up by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLookup {
    /// Any session (live or ended) by primary key.
    Id(Uuid),
    /// The live session of a quiz.
    QuizId(Uuid),
    /// The live session holding a join code.
    Code(String),
}

/// Filters accepted when listing answer responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerQuery {
    BySession(Uuid),
    ByQuestion(Uuid),
    ByParticipant(Uuid),
    BySessionAndQuestion { session_id: Uuid, question_id: Uuid },
    BySessionAndParticipant { session_id: Uuid, participant_id: Uuid },
}

impl AnswerQuery {
    /// Whether `answer` satisfies the filter.
    pub fn matches(&self, answer: &AnswerResponseEntity) -> bool {
        match self {
            AnswerQuery::BySession(id) => answer.session_id == *id,
            AnswerQuery::ByQuestion(id) => answer.question_id == *id,
            AnswerQuery::ByParticipant(id) => answer.participant_id == *id,
            AnswerQuery::BySessionAndQuestion {
                session_id,
                question_id,
            } => answer.session_id == *session_id && answer.question_id == *question_id,
            AnswerQuery::BySessionAndParticipant {
                session_id,
                participant_id,
            } => answer.session_id == *session_id && answer.participant_id == *participant_id,
        }
    }
}

/// Leaderboard ordering: marks descending, then name ascending.
pub fn ranking_order(a_marks: f64, a_name: &str, b_marks: f64, b_name: &str) -> Ordering {
    b_marks.total_cmp(&a_marks).then_with(|| a_name.cmp(b_name))
}
