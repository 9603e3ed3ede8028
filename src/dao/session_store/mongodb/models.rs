use mongodb::bson::{DateTime, Document, doc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{MongoDaoError, MongoResult};
use crate::dao::models::{
    AnswerQuery, AnswerResponseEntity, ParticipantEntity, ParticipantStatus, QuestionType,
    SessionConfig, SessionEntity, SessionHistoryEntity, SessionStatus,
};

pub const SESSION_COLLECTION: &str = "live_sessions";
pub const PARTICIPANT_COLLECTION: &str = "participants";
pub const ANSWER_COLLECTION: &str = "answer_responses";
pub const HISTORY_COLLECTION: &str = "session_history";

fn parse_id(collection: &'static str, value: &str) -> MongoResult<Uuid> {
    Uuid::parse_str(value).map_err(|source| MongoDaoError::MalformedId {
        collection,
        value: value.to_owned(),
        source,
    })
}

pub fn doc_id(id: Uuid) -> Document {
    doc! {"_id": id.to_string()}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoSessionDocument {
    #[serde(rename = "_id")]
    id: String,
    host_user_id: String,
    quiz_id: String,
    code: String,
    status: SessionStatus,
    #[serde(default)]
    exempted_question_ids: Vec<String>,
    #[serde(default)]
    config: SessionConfig,
    question_count: i64,
    created_at: DateTime,
    updated_at: DateTime,
    ended_at: Option<DateTime>,
}

impl From<SessionEntity> for MongoSessionDocument {
    fn from(value: SessionEntity) -> Self {
        Self {
            id: value.id.to_string(),
            host_user_id: value.host_user_id,
            quiz_id: value.quiz_id.to_string(),
            code: value.code,
            status: value.status,
            exempted_question_ids: value
                .exempted_question_ids
                .iter()
                .map(Uuid::to_string)
                .collect(),
            config: value.config,
            question_count: i64::from(value.question_count),
            created_at: DateTime::from_system_time(value.created_at),
            updated_at: DateTime::from_system_time(value.updated_at),
            ended_at: value.ended_at.map(DateTime::from_system_time),
        }
    }
}

impl TryFrom<MongoSessionDocument> for SessionEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoSessionDocument) -> MongoResult<Self> {
        let exempted_question_ids = value
            .exempted_question_ids
            .iter()
            .map(|id| parse_id(SESSION_COLLECTION, id))
            .collect::<MongoResult<Vec<_>>>()?;
        Ok(Self {
            id: parse_id(SESSION_COLLECTION, &value.id)?,
            host_user_id: value.host_user_id,
            quiz_id: parse_id(SESSION_COLLECTION, &value.quiz_id)?,
            code: value.code,
            status: value.status,
            exempted_question_ids,
            config: value.config,
            question_count: u32::try_from(value.question_count).unwrap_or(0),
            created_at: value.created_at.to_system_time(),
            updated_at: value.updated_at.to_system_time(),
            ended_at: value.ended_at.map(|at| at.to_system_time()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoParticipantDocument {
    #[serde(rename = "_id")]
    id: String,
    user_id: Option<String>,
    session_id: String,
    name: String,
    emoji: Option<String>,
    color: Option<String>,
    status: ParticipantStatus,
    marks: f64,
    created_at: DateTime,
    updated_at: DateTime,
}

impl From<ParticipantEntity> for MongoParticipantDocument {
    fn from(value: ParticipantEntity) -> Self {
        Self {
            id: value.id.to_string(),
            user_id: value.user_id,
            session_id: value.session_id.to_string(),
            name: value.name,
            emoji: value.emoji,
            color: value.color,
            status: value.status,
            marks: value.marks,
            created_at: DateTime::from_system_time(value.created_at),
            updated_at: DateTime::from_system_time(value.updated_at),
        }
    }
}

impl TryFrom<MongoParticipantDocument> for ParticipantEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoParticipantDocument) -> MongoResult<Self> {
        Ok(Self {
            id: parse_id(PARTICIPANT_COLLECTION, &value.id)?,
            user_id: value.user_id,
            session_id: parse_id(PARTICIPANT_COLLECTION, &value.session_id)?,
            name: value.name,
            emoji: value.emoji,
            color: value.color,
            status: value.status,
            marks: value.marks,
            created_at: value.created_at.to_system_time(),
            updated_at: value.updated_at.to_system_time(),
        })
    }
}

/// Fields written only when a join inserts the participant row; the filter
/// supplies `session_id` and `user_id`.
pub fn participant_on_insert(value: &ParticipantEntity) -> Document {
    doc! {
        "_id": value.id.to_string(),
        "name": value.name.clone(),
        "emoji": value.emoji.clone(),
        "color": value.color.clone(),
        "status": value.status.as_str(),
        "marks": value.marks,
        "created_at": DateTime::from_system_time(value.created_at),
        "updated_at": DateTime::from_system_time(value.updated_at),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoAnswerDocument {
    #[serde(rename = "_id")]
    id: String,
    session_id: String,
    participant_id: String,
    question_id: String,
    question_order: i64,
    question_type: QuestionType,
    answer: Vec<String>,
    marks: f64,
    use_time_ms: i64,
    created_at: DateTime,
}

impl From<AnswerResponseEntity> for MongoAnswerDocument {
    fn from(value: AnswerResponseEntity) -> Self {
        Self {
            id: value.id.to_string(),
            session_id: value.session_id.to_string(),
            participant_id: value.participant_id.to_string(),
            question_id: value.question_id.to_string(),
            question_order: i64::from(value.question_order),
            question_type: value.question_type,
            answer: value.answer.iter().map(Uuid::to_string).collect(),
            marks: value.marks,
            use_time_ms: i64::try_from(value.use_time_ms).unwrap_or(i64::MAX),
            created_at: DateTime::from_system_time(value.created_at),
        }
    }
}

impl TryFrom<MongoAnswerDocument> for AnswerResponseEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoAnswerDocument) -> MongoResult<Self> {
        let answer = value
            .answer
            .iter()
            .map(|id| parse_id(ANSWER_COLLECTION, id))
            .collect::<MongoResult<Vec<_>>>()?;
        Ok(Self {
            id: parse_id(ANSWER_COLLECTION, &value.id)?,
            session_id: parse_id(ANSWER_COLLECTION, &value.session_id)?,
            participant_id: parse_id(ANSWER_COLLECTION, &value.participant_id)?,
            question_id: parse_id(ANSWER_COLLECTION, &value.question_id)?,
            question_order: u32::try_from(value.question_order).unwrap_or(0),
            question_type: value.question_type,
            answer,
            marks: value.marks,
            use_time_ms: u64::try_from(value.use_time_ms).unwrap_or(0),
            created_at: value.created_at.to_system_time(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoHistoryDocument {
    #[serde(rename = "_id")]
    id: String,
    session_id: String,
    status: SessionStatus,
    question_order: Option<i64>,
    recorded_at: DateTime,
}

impl MongoHistoryDocument {
    pub fn record(session_id: Uuid, status: SessionStatus, question_order: Option<u32>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            status,
            question_order: question_order.map(i64::from),
            recorded_at: DateTime::now(),
        }
    }
}

impl TryFrom<MongoHistoryDocument> for SessionHistoryEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoHistoryDocument) -> MongoResult<Self> {
        Ok(Self {
            id: parse_id(HISTORY_COLLECTION, &value.id)?,
            session_id: parse_id(HISTORY_COLLECTION, &value.session_id)?,
            status: value.status,
            question_order: value.question_order.and_then(|o| u32::try_from(o).ok()),
            recorded_at: value.recorded_at.to_system_time(),
        })
    }
}

/// Translate an [`AnswerQuery`] into a collection filter.
pub fn answer_filter(query: &AnswerQuery) -> Document {
    match query {
        AnswerQuery::BySession(id) => doc! {"session_id": id.to_string()},
        AnswerQuery::ByQuestion(id) => doc! {"question_id": id.to_string()},
        AnswerQuery::ByParticipant(id) => doc! {"participant_id": id.to_string()},
        AnswerQuery::BySessionAndQuestion {
            session_id,
            question_id,
        } => doc! {
            "session_id": session_id.to_string(),
            "question_id": question_id.to_string(),
        },
        AnswerQuery::BySessionAndParticipant {
            session_id,
            participant_id,
        } => doc! {
            "session_id": session_id.to_string(),
            "participant_id": participant_id.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;

    #[test]
    fn session_document_round_trips_identifiers() {
        let now = SystemTime::now();
        let entity = SessionEntity {
            id: Uuid::new_v4(),
            host_user_id: "host-1".into(),
            quiz_id: Uuid::new_v4(),
            code: "QZ1234".into(),
            status: SessionStatus::Leaderboard,
            exempted_question_ids: vec![Uuid::new_v4()],
            config: SessionConfig::default(),
            question_count: 4,
            created_at: now,
            updated_at: now,
            ended_at: None,
        };

        let document = MongoSessionDocument::from(entity.clone());
        let back = SessionEntity::try_from(document).expect("valid document");
        assert_eq!(back.id, entity.id);
        assert_eq!(back.quiz_id, entity.quiz_id);
        assert_eq!(back.exempted_question_ids, entity.exempted_question_ids);
        assert_eq!(back.status, SessionStatus::Leaderboard);
    }

    #[test]
    fn malformed_identifier_is_reported() {
        let document = MongoHistoryDocument {
            id: "not-a-uuid".into(),
            session_id: Uuid::new_v4().to_string(),
            status: SessionStatus::Idle,
            question_order: None,
            recorded_at: DateTime::now(),
        };

        let err = SessionHistoryEntity::try_from(document).expect_err("must fail");
        assert!(matches!(
            err,
            MongoDaoError::MalformedId {
                collection: HISTORY_COLLECTION,
                ..
            }
        ));
    }

    #[test]
    fn answer_filter_combines_session_and_question() {
        let session_id = Uuid::new_v4();
        let question_id = Uuid::new_v4();
        let filter = answer_filter(&AnswerQuery::BySessionAndQuestion {
            session_id,
            question_id,
        });
        assert_eq!(
            filter.get_str("session_id").ok(),
            Some(session_id.to_string().as_str())
        );
        assert_eq!(
            filter.get_str("question_id").ok(),
            Some(question_id.to_string().as_str())
        );
    }
}
