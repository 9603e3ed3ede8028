use mongodb::error::Error as MongoError;
use thiserror::Error;
use uuid::Uuid;

pub type MongoResult<T> = std::result::Result<T, MongoDaoError>;

#[derive(Debug, Error)]
pub enum MongoDaoError {
    #[error("failed to parse MongoDB connection URI `{uri}`")]
    InvalidUri {
        uri: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to build MongoDB client from options")]
    ClientConstruction {
        #[source]
        source: MongoError,
    },
    #[error("MongoDB ping failed during initial connection after {attempts} attempt(s)")]
    InitialPing {
        attempts: u32,
        #[source]
        source: MongoError,
    },
    #[error("MongoDB ping health check failed")]
    HealthPing {
        #[source]
        source: MongoError,
    },
    #[error("failed to ensure index `{index}` on collection `{collection}`")]
    EnsureIndex {
        collection: &'static str,
        index: &'static str,
        #[source]
        source: MongoError,
    },
    #[error("failed to write session `{id}`")]
    WriteSession {
        id: Uuid,
        #[source]
        source: MongoError,
    },
    #[error("failed to load session")]
    LoadSession {
        #[source]
        source: MongoError,
    },
    #[error("failed to write participant of session `{session_id}`")]
    WriteParticipant {
        session_id: Uuid,
        #[source]
        source: MongoError,
    },
    #[error("failed to load participants of session `{session_id}`")]
    LoadParticipants {
        session_id: Uuid,
        #[source]
        source: MongoError,
    },
    #[error("failed to count participant rows")]
    CountParticipants {
        #[source]
        source: MongoError,
    },
    #[error("failed to write answer response of participant `{participant_id}`")]
    WriteAnswer {
        participant_id: Uuid,
        #[source]
        source: MongoError,
    },
    #[error("failed to load answer responses")]
    LoadAnswers {
        #[source]
        source: MongoError,
    },
    #[error("failed to access history of session `{session_id}`")]
    History {
        session_id: Uuid,
        #[source]
        source: MongoError,
    },
    #[error("stored document in `{collection}` has a malformed identifier `{value}`")]
    MalformedId {
        collection: &'static str,
        value: String,
        #[source]
        source: uuid::Error,
    },
}
