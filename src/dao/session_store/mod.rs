pub mod memory;
#[cfg(feature = "mongo-store")]
pub mod mongodb;

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::dao::{
    models::{
        AnswerQuery, AnswerResponseEntity, ParticipantEntity, ParticipantStatus,
        SessionEntity, SessionHistoryEntity, SessionLookup, SessionStatus,
    },
    storage::StorageResult,
};

/// Abstraction over the durable record of sessions, participants and answers.
pub trait SessionStore: Send + Sync {
    /// Insert a new session row together with its first history row.
    fn create_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<()>>;
    /// Soft-delete a session: status becomes `ENDED` and `ended_at` is set.
    /// Returns `false` when no live session had this id.
    fn end_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<bool>>;
    fn find_session(
        &self,
        lookup: SessionLookup,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>>;
    /// Persist a status change and append the matching history row.
    fn update_session_status(
        &self,
        id: Uuid,
        status: SessionStatus,
        question_order: Option<u32>,
    ) -> BoxFuture<'static, StorageResult<()>>;
    fn list_history(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<SessionHistoryEntity>>>;

    /// Insert the participant unless `(user_id, session_id)` already has a row.
    /// Returns the stored row, which is the existing one when the insert lost.
    fn create_participant(
        &self,
        participant: ParticipantEntity,
    ) -> BoxFuture<'static, StorageResult<ParticipantEntity>>;
    /// Update the status of the participant identified by `(user_id, session_id)`,
    /// returning the updated row.
    fn update_participant_status(
        &self,
        user_id: String,
        session_id: Uuid,
        status: ParticipantStatus,
    ) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>>;
    fn update_participant_marks(
        &self,
        participant_id: Uuid,
        marks: f64,
    ) -> BoxFuture<'static, StorageResult<()>>;
    fn find_participant(
        &self,
        user_id: String,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>>;
    /// Whether the user has ever joined any session.
    fn participant_exists(&self, user_id: String) -> BoxFuture<'static, StorageResult<bool>>;
    /// Participants of a session ordered by marks descending, then name.
    fn list_participants(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ParticipantEntity>>>;

    /// Insert or replace the answer of a participant to a question.
    fn save_answer_response(
        &self,
        answer: AnswerResponseEntity,
    ) -> BoxFuture<'static, StorageResult<()>>;
    fn delete_answer_response(
        &self,
        participant_id: Uuid,
        question_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<bool>>;
    fn list_answers(
        &self,
        query: AnswerQuery,
    ) -> BoxFuture<'static, StorageResult<Vec<AnswerResponseEntity>>>;

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}
