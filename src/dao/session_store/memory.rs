//! Process-local [`SessionStore`] used for tests, local development and as the
//! fallback when no database is configured.

use std::{sync::Arc, time::SystemTime};

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::SessionStore;
use crate::dao::{
    models::{
        AnswerQuery, AnswerResponseEntity, ParticipantEntity, ParticipantStatus, SessionEntity,
        SessionHistoryEntity, SessionLookup, SessionStatus, ranking_order,
    },
    storage::StorageResult,
};

#[derive(Default)]
struct Tables {
    sessions: Vec<SessionEntity>,
    participants: Vec<ParticipantEntity>,
    answers: Vec<AnswerResponseEntity>,
    history: Vec<SessionHistoryEntity>,
}

/// In-memory tables guarded by a single lock; every call is one short critical section.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn history_row(session_id: Uuid, status: SessionStatus, order: Option<u32>) -> SessionHistoryEntity {
    SessionHistoryEntity {
        id: Uuid::new_v4(),
        session_id,
        status,
        question_order: order,
        recorded_at: SystemTime::now(),
    }
}

impl SessionStore for MemorySessionStore {
    fn create_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<()>> {
        let tables = self.tables.clone();
        Box::pin(async move {
            let mut guard = tables.write().await;
            guard
                .history
                .push(history_row(session.id, session.status, None));
            guard.sessions.push(session);
            Ok(())
        })
    }

    fn end_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<bool>> {
        let tables = self.tables.clone();
        Box::pin(async move {
            let mut guard = tables.write().await;
            let Some(session) = guard
                .sessions
                .iter_mut()
                .find(|s| s.id == id && s.status.is_live())
            else {
                return Ok(false);
            };
            let now = SystemTime::now();
            session.status = SessionStatus::Ended;
            session.updated_at = now;
            session.ended_at = Some(now);
            guard
                .history
                .push(history_row(id, SessionStatus::Ended, None));
            Ok(true)
        })
    }

    fn find_session(
        &self,
        lookup: SessionLookup,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let tables = self.tables.clone();
        Box::pin(async move {
            let guard = tables.read().await;
            let found = guard
                .sessions
                .iter()
                .rev()
                .find(|s| match &lookup {
                    SessionLookup::Id(id) => s.id == *id,
                    SessionLookup::QuizId(quiz_id) => s.quiz_id == *quiz_id && s.status.is_live(),
                    SessionLookup::Code(code) => s.code == *code && s.status.is_live(),
                })
                .cloned();
            Ok(found)
        })
    }

    fn update_session_status(
        &self,
        id: Uuid,
        status: SessionStatus,
        question_order: Option<u32>,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let tables = self.tables.clone();
        Box::pin(async move {
            let mut guard = tables.write().await;
            if let Some(session) = guard.sessions.iter_mut().find(|s| s.id == id) {
                session.status = status;
                session.updated_at = SystemTime::now();
            }
            guard.history.push(history_row(id, status, question_order));
            Ok(())
        })
    }

    fn list_history(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<SessionHistoryEntity>>> {
        let tables = self.tables.clone();
        Box::pin(async move {
            let guard = tables.read().await;
            Ok(guard
                .history
                .iter()
                .filter(|row| row.session_id == session_id)
                .cloned()
                .collect())
        })
    }

    fn create_participant(
        &self,
        participant: ParticipantEntity,
    ) -> BoxFuture<'static, StorageResult<ParticipantEntity>> {
        let tables = self.tables.clone();
        Box::pin(async move {
            let mut guard = tables.write().await;
            let existing = guard.participants.iter().find(|p| {
                p.session_id == participant.session_id && p.user_id == participant.user_id
            });
            if let Some(existing) = existing {
                return Ok(existing.clone());
            }
            guard.participants.push(participant.clone());
            Ok(participant)
        })
    }

    fn update_participant_status(
        &self,
        user_id: String,
        session_id: Uuid,
        status: ParticipantStatus,
    ) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>> {
        let tables = self.tables.clone();
        Box::pin(async move {
            let mut guard = tables.write().await;
            let updated = guard
                .participants
                .iter_mut()
                .find(|p| p.session_id == session_id && p.user_id.as_deref() == Some(&user_id))
                .map(|p| {
                    p.status = status;
                    p.updated_at = SystemTime::now();
                    p.clone()
                });
            Ok(updated)
        })
    }

    fn update_participant_marks(
        &self,
        participant_id: Uuid,
        marks: f64,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let tables = self.tables.clone();
        Box::pin(async move {
            let mut guard = tables.write().await;
            if let Some(p) = guard.participants.iter_mut().find(|p| p.id == participant_id) {
                p.marks = marks;
                p.updated_at = SystemTime::now();
            }
            Ok(())
        })
    }

    fn find_participant(
        &self,
        user_id: String,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>> {
        let tables = self.tables.clone();
        Box::pin(async move {
            let guard = tables.read().await;
            Ok(guard
                .participants
                .iter()
                .find(|p| p.session_id == session_id && p.user_id.as_deref() == Some(&user_id))
                .cloned())
        })
    }

    fn participant_exists(&self, user_id: String) -> BoxFuture<'static, StorageResult<bool>> {
        let tables = self.tables.clone();
        Box::pin(async move {
            let guard = tables.read().await;
            Ok(guard
                .participants
                .iter()
                .any(|p| p.user_id.as_deref() == Some(&user_id)))
        })
    }

    fn list_participants(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ParticipantEntity>>> {
        let tables = self.tables.clone();
        Box::pin(async move {
            let guard = tables.read().await;
            let mut rows: Vec<ParticipantEntity> = guard
                .participants
                .iter()
                .filter(|p| p.session_id == session_id)
                .cloned()
                .collect();
            rows.sort_by(|a, b| ranking_order(a.marks, &a.name, b.marks, &b.name));
            Ok(rows)
        })
    }

    fn save_answer_response(
        &self,
        answer: AnswerResponseEntity,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let tables = self.tables.clone();
        Box::pin(async move {
            let mut guard = tables.write().await;
            match guard.answers.iter_mut().find(|a| {
                a.participant_id == answer.participant_id && a.question_id == answer.question_id
            }) {
                Some(existing) => *existing = answer,
                None => guard.answers.push(answer),
            }
            Ok(())
        })
    }

    fn delete_answer_response(
        &self,
        participant_id: Uuid,
        question_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let tables = self.tables.clone();
        Box::pin(async move {
            let mut guard = tables.write().await;
            let before = guard.answers.len();
            guard
                .answers
                .retain(|a| !(a.participant_id == participant_id && a.question_id == question_id));
            Ok(guard.answers.len() != before)
        })
    }

    fn list_answers(
        &self,
        query: AnswerQuery,
    ) -> BoxFuture<'static, StorageResult<Vec<AnswerResponseEntity>>> {
        let tables = self.tables.clone();
        Box::pin(async move {
            let guard = tables.read().await;
            Ok(guard
                .answers
                .iter()
                .filter(|a| query.matches(a))
                .cloned()
                .collect())
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::models::{QuestionType, SessionConfig};

    fn session(quiz_id: Uuid, code: &str) -> SessionEntity {
        let now = SystemTime::now();
        SessionEntity {
            id: Uuid::new_v4(),
            host_user_id: "host".into(),
            quiz_id,
            code: code.into(),
            status: SessionStatus::Idle,
            exempted_question_ids: Vec::new(),
            config: SessionConfig::default(),
            question_count: 3,
            created_at: now,
            updated_at: now,
            ended_at: None,
        }
    }

    fn participant(session_id: Uuid, user: &str, name: &str, marks: f64) -> ParticipantEntity {
        let now = SystemTime::now();
        ParticipantEntity {
            id: Uuid::new_v4(),
            user_id: Some(user.into()),
            session_id,
            name: name.into(),
            emoji: None,
            color: None,
            status: ParticipantStatus::Joined,
            marks,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn ended_sessions_are_hidden_from_code_and_quiz_lookups() {
        let store = MemorySessionStore::new();
        let quiz_id = Uuid::new_v4();
        let row = session(quiz_id, "AB1234");
        let id = row.id;
        store.create_session(row).await.unwrap();

        assert!(
            store
                .find_session(SessionLookup::Code("AB1234".into()))
                .await
                .unwrap()
                .is_some()
        );
        assert!(store.end_session(id).await.unwrap());
        assert!(!store.end_session(id).await.unwrap());

        assert!(
            store
                .find_session(SessionLookup::QuizId(quiz_id))
                .await
                .unwrap()
                .is_none()
        );
        let kept = store
            .find_session(SessionLookup::Id(id))
            .await
            .unwrap()
            .expect("ended session kept for history");
        assert_eq!(kept.status, SessionStatus::Ended);
        assert!(kept.ended_at.is_some());
    }

    #[tokio::test]
    async fn status_updates_append_history_rows() {
        let store = MemorySessionStore::new();
        let row = session(Uuid::new_v4(), "CD5678");
        let id = row.id;
        store.create_session(row).await.unwrap();
        store
            .update_session_status(id, SessionStatus::Starting, None)
            .await
            .unwrap();
        store
            .update_session_status(id, SessionStatus::Questioning, Some(1))
            .await
            .unwrap();

        let history = store.list_history(id).await.unwrap();
        let statuses: Vec<_> = history.iter().map(|h| h.status).collect();
        assert_eq!(
            statuses,
            vec![
                SessionStatus::Idle,
                SessionStatus::Starting,
                SessionStatus::Questioning
            ]
        );
        assert_eq!(history[2].question_order, Some(1));
    }

    #[tokio::test]
    async fn participants_are_listed_by_marks_then_name() {
        let store = MemorySessionStore::new();
        let session_id = Uuid::new_v4();
        for (user, name, marks) in [("u1", "zoe", 10.0), ("u2", "amy", 10.0), ("u3", "bob", 30.0)] {
            store
                .create_participant(participant(session_id, user, name, marks))
                .await
                .unwrap();
        }

        let names: Vec<_> = store
            .list_participants(session_id)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["bob", "amy", "zoe"]);
    }

    #[tokio::test]
    async fn participant_status_update_preserves_marks() {
        let store = MemorySessionStore::new();
        let session_id = Uuid::new_v4();
        store
            .create_participant(participant(session_id, "u1", "amy", 42.0))
            .await
            .unwrap();

        let updated = store
            .update_participant_status("u1".into(), session_id, ParticipantStatus::Left)
            .await
            .unwrap()
            .expect("participant exists");
        assert_eq!(updated.status, ParticipantStatus::Left);
        assert_eq!(updated.marks, 42.0);
    }

    #[tokio::test]
    async fn concurrent_creates_keep_one_row_per_user_and_session() {
        let store = MemorySessionStore::new();
        let session_id = Uuid::new_v4();
        let first = participant(session_id, "u1", "amy", 0.0);
        let second = participant(session_id, "u1", "amy", 0.0);

        let (a, b) = tokio::join!(
            store.create_participant(first),
            store.create_participant(second)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.id, b.id);
        assert_eq!(store.list_participants(session_id).await.unwrap().len(), 1);

        // Same user in another session is a separate row.
        let other = store
            .create_participant(participant(Uuid::new_v4(), "u1", "amy", 0.0))
            .await
            .unwrap();
        assert_ne!(other.id, a.id);
    }

    #[tokio::test]
    async fn participant_exists_spans_sessions() {
        let store = MemorySessionStore::new();
        assert!(!store.participant_exists("u1".into()).await.unwrap());

        store
            .create_participant(participant(Uuid::new_v4(), "u1", "amy", 0.0))
            .await
            .unwrap();
        assert!(store.participant_exists("u1".into()).await.unwrap());
        assert!(!store.participant_exists("u2".into()).await.unwrap());
    }

    #[tokio::test]
    async fn saving_an_answer_twice_keeps_a_single_row() {
        let store = MemorySessionStore::new();
        let session_id = Uuid::new_v4();
        let participant_id = Uuid::new_v4();
        let question_id = Uuid::new_v4();
        let mut answer = AnswerResponseEntity {
            id: Uuid::new_v4(),
            session_id,
            participant_id,
            question_id,
            question_order: 1,
            question_type: QuestionType::SingleChoice,
            answer: vec![Uuid::new_v4()],
            marks: 100.0,
            use_time_ms: 1200,
            created_at: SystemTime::now(),
        };
        store.save_answer_response(answer.clone()).await.unwrap();
        answer.marks = 50.0;
        store.save_answer_response(answer).await.unwrap();

        let rows = store
            .list_answers(AnswerQuery::BySessionAndQuestion {
                session_id,
                question_id,
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].marks, 50.0);

        assert!(
            store
                .delete_answer_response(participant_id, question_id)
                .await
                .unwrap()
        );
        assert!(
            store
                .list_answers(AnswerQuery::ByParticipant(participant_id))
                .await
                .unwrap()
                .is_empty()
        );
    }
}
