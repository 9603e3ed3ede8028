use std::sync::Arc;

use futures::{TryStreamExt, future::BoxFuture};
use mongodb::{
    Client, Collection, Database, IndexModel,
    bson::{DateTime, doc},
    error::{Error as MongoError, ErrorKind, WriteFailure},
    options::{IndexOptions, ReturnDocument},
};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    config::MongoConfig,
    connection::establish_connection,
    error::{MongoDaoError, MongoResult},
    models::{
        ANSWER_COLLECTION, HISTORY_COLLECTION, MongoAnswerDocument, MongoHistoryDocument,
        MongoParticipantDocument, MongoSessionDocument, PARTICIPANT_COLLECTION,
        SESSION_COLLECTION, answer_filter, doc_id, participant_on_insert,
    },
};
use crate::dao::{
    models::{
        AnswerQuery, AnswerResponseEntity, ParticipantEntity, ParticipantStatus, SessionEntity,
        SessionHistoryEntity, SessionLookup, SessionStatus,
    },
    session_store::SessionStore,
    storage::StorageResult,
};

/// MongoDB-backed [`SessionStore`].
#[derive(Clone)]
pub struct MongoSessionStore {
    inner: Arc<MongoInner>,
}

struct MongoInner {
    state: RwLock<MongoState>,
    config: MongoConfig,
}

struct MongoState {
    // Kept so the connection pool lives as long as the database handle.
    #[allow(dead_code)]
    client: Client,
    database: Database,
}

impl MongoInner {
    async fn ping(&self) -> MongoResult<()> {
        let database = self.state.read().await.database.clone();
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|source| MongoDaoError::HealthPing { source })?;
        Ok(())
    }

    async fn reconnect(&self) -> MongoResult<()> {
        let (client, database) =
            establish_connection(&self.config.options, &self.config.database_name).await?;
        let mut guard = self.state.write().await;
        guard.client = client;
        guard.database = database;
        Ok(())
    }
}

const DUPLICATE_KEY: i32 = 11000;

fn is_duplicate_key(err: &MongoError) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Command(command) => command.code == DUPLICATE_KEY,
        ErrorKind::Write(WriteFailure::WriteError(write)) => write.code == DUPLICATE_KEY,
        _ => false,
    }
}

fn index(keys: mongodb::bson::Document, name: &str, unique: bool) -> IndexModel {
    IndexModel::builder()
        .keys(keys)
        .options(
            IndexOptions::builder()
                .name(Some(name.to_owned()))
                .unique(Some(unique))
                .build(),
        )
        .build()
}

impl MongoSessionStore {
    /// Establish a connection to MongoDB and ensure indexes are present.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let (client, database) =
            establish_connection(&config.options, &config.database_name).await?;

        let store = Self {
            inner: Arc::new(MongoInner {
                state: RwLock::new(MongoState { client, database }),
                config,
            }),
        };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> MongoResult<()> {
        let database = self.database().await;
        let wanted: [(&'static str, &'static str, mongodb::bson::Document, bool); 5] = [
            (SESSION_COLLECTION, "code", doc! {"code": 1, "status": 1}, false),
            (SESSION_COLLECTION, "quiz_id", doc! {"quiz_id": 1, "status": 1}, false),
            (
                PARTICIPANT_COLLECTION,
                "session_id,user_id",
                doc! {"session_id": 1, "user_id": 1},
                true,
            ),
            (
                ANSWER_COLLECTION,
                "participant_id,question_id",
                doc! {"participant_id": 1, "question_id": 1},
                true,
            ),
            (HISTORY_COLLECTION, "session_id", doc! {"session_id": 1}, false),
        ];

        for (collection, name, keys, unique) in wanted {
            database
                .collection::<mongodb::bson::Document>(collection)
                .create_index(index(keys, &format!("{collection}_{name}_idx"), unique))
                .await
                .map_err(|source| MongoDaoError::EnsureIndex {
                    collection,
                    index: name,
                    source,
                })?;
        }
        Ok(())
    }

    async fn database(&self) -> Database {
        self.inner.state.read().await.database.clone()
    }

    async fn sessions(&self) -> Collection<MongoSessionDocument> {
        self.database().await.collection(SESSION_COLLECTION)
    }

    async fn participants(&self) -> Collection<MongoParticipantDocument> {
        self.database().await.collection(PARTICIPANT_COLLECTION)
    }

    async fn answers(&self) -> Collection<MongoAnswerDocument> {
        self.database().await.collection(ANSWER_COLLECTION)
    }

    async fn history(&self) -> Collection<MongoHistoryDocument> {
        self.database().await.collection(HISTORY_COLLECTION)
    }

    async fn append_history(
        &self,
        session_id: Uuid,
        status: SessionStatus,
        question_order: Option<u32>,
    ) -> MongoResult<()> {
        self.history()
            .await
            .insert_one(MongoHistoryDocument::record(session_id, status, question_order))
            .await
            .map_err(|source| MongoDaoError::History { session_id, source })?;
        Ok(())
    }

    async fn create_session(&self, session: SessionEntity) -> MongoResult<()> {
        let id = session.id;
        let status = session.status;
        let document: MongoSessionDocument = session.into();
        self.sessions()
            .await
            .insert_one(&document)
            .await
            .map_err(|source| MongoDaoError::WriteSession { id, source })?;
        self.append_history(id, status, None).await
    }

    async fn end_session(&self, id: Uuid) -> MongoResult<bool> {
        let now = DateTime::now();
        let mut filter = doc_id(id);
        filter.insert("status", doc! {"$ne": SessionStatus::Ended.as_str()});
        let result = self
            .sessions()
            .await
            .update_one(
                filter,
                doc! {"$set": {
                    "status": SessionStatus::Ended.as_str(),
                    "updated_at": now,
                    "ended_at": now,
                }},
            )
            .await
            .map_err(|source| MongoDaoError::WriteSession { id, source })?;

        if result.modified_count == 0 {
            return Ok(false);
        }
        self.append_history(id, SessionStatus::Ended, None).await?;
        Ok(true)
    }

    async fn find_session(&self, lookup: SessionLookup) -> MongoResult<Option<SessionEntity>> {
        let live = doc! {"$ne": SessionStatus::Ended.as_str()};
        let filter = match lookup {
            SessionLookup::Id(id) => doc_id(id),
            SessionLookup::QuizId(quiz_id) => {
                doc! {"quiz_id": quiz_id.to_string(), "status": live}
            }
            SessionLookup::Code(code) => doc! {"code": code, "status": live},
        };

        let document = self
            .sessions()
            .await
            .find_one(filter)
            .sort(doc! {"created_at": -1})
            .await
            .map_err(|source| MongoDaoError::LoadSession { source })?;
        document.map(SessionEntity::try_from).transpose()
    }

    async fn update_session_status(
        &self,
        id: Uuid,
        status: SessionStatus,
        question_order: Option<u32>,
    ) -> MongoResult<()> {
        self.sessions()
            .await
            .update_one(
                doc_id(id),
                doc! {"$set": {"status": status.as_str(), "updated_at": DateTime::now()}},
            )
            .await
            .map_err(|source| MongoDaoError::WriteSession { id, source })?;
        self.append_history(id, status, question_order).await
    }

    async fn list_history(&self, session_id: Uuid) -> MongoResult<Vec<SessionHistoryEntity>> {
        let documents: Vec<MongoHistoryDocument> = self
            .history()
            .await
            .find(doc! {"session_id": session_id.to_string()})
            .sort(doc! {"recorded_at": 1})
            .await
            .map_err(|source| MongoDaoError::History { session_id, source })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::History { session_id, source })?;
        documents.into_iter().map(TryInto::try_into).collect()
    }

    async fn create_participant(
        &self,
        participant: ParticipantEntity,
    ) -> MongoResult<ParticipantEntity> {
        let session_id = participant.session_id;
        let filter = doc! {
            "session_id": session_id.to_string(),
            "user_id": participant.user_id.clone(),
        };
        let upserted = self
            .participants()
            .await
            .find_one_and_update(
                filter.clone(),
                doc! {"$setOnInsert": participant_on_insert(&participant)},
            )
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await;

        let document = match upserted {
            Ok(document) => document,
            // Two upserts raced on the unique index; the winner's row is there now.
            Err(err) if is_duplicate_key(&err) => self
                .participants()
                .await
                .find_one(filter)
                .await
                .map_err(|source| MongoDaoError::LoadParticipants { session_id, source })?,
            Err(source) => return Err(MongoDaoError::WriteParticipant { session_id, source }),
        };
        match document {
            Some(document) => document.try_into(),
            None => Ok(participant),
        }
    }

    async fn participant_exists(&self, user_id: String) -> MongoResult<bool> {
        let count = self
            .participants()
            .await
            .count_documents(doc! {"user_id": user_id})
            .limit(1)
            .await
            .map_err(|source| MongoDaoError::CountParticipants { source })?;
        Ok(count > 0)
    }

    async fn update_participant_status(
        &self,
        user_id: String,
        session_id: Uuid,
        status: ParticipantStatus,
    ) -> MongoResult<Option<ParticipantEntity>> {
        let document = self
            .participants()
            .await
            .find_one_and_update(
                doc! {"session_id": session_id.to_string(), "user_id": user_id},
                doc! {"$set": {"status": status.as_str(), "updated_at": DateTime::now()}},
            )
            .return_document(ReturnDocument::After)
            .await
            .map_err(|source| MongoDaoError::WriteParticipant { session_id, source })?;
        document.map(ParticipantEntity::try_from).transpose()
    }

    async fn update_participant_marks(&self, participant_id: Uuid, marks: f64) -> MongoResult<()> {
        self.participants()
            .await
            .update_one(
                doc_id(participant_id),
                doc! {"$set": {"marks": marks, "updated_at": DateTime::now()}},
            )
            .await
            .map_err(|source| MongoDaoError::WriteParticipant {
                session_id: participant_id,
                source,
            })?;
        Ok(())
    }

    async fn find_participant(
        &self,
        user_id: String,
        session_id: Uuid,
    ) -> MongoResult<Option<ParticipantEntity>> {
        let document = self
            .participants()
            .await
            .find_one(doc! {"session_id": session_id.to_string(), "user_id": user_id})
            .await
            .map_err(|source| MongoDaoError::LoadParticipants { session_id, source })?;
        document.map(ParticipantEntity::try_from).transpose()
    }

    async fn list_participants(&self, session_id: Uuid) -> MongoResult<Vec<ParticipantEntity>> {
        let documents: Vec<MongoParticipantDocument> = self
            .participants()
            .await
            .find(doc! {"session_id": session_id.to_string()})
            .sort(doc! {"marks": -1, "name": 1})
            .await
            .map_err(|source| MongoDaoError::LoadParticipants { session_id, source })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::LoadParticipants { session_id, source })?;
        documents.into_iter().map(TryInto::try_into).collect()
    }

    async fn save_answer_response(&self, answer: AnswerResponseEntity) -> MongoResult<()> {
        let participant_id = answer.participant_id;
        let filter = doc! {
            "participant_id": participant_id.to_string(),
            "question_id": answer.question_id.to_string(),
        };
        let document: MongoAnswerDocument = answer.into();
        self.answers()
            .await
            .replace_one(filter, &document)
            .upsert(true)
            .await
            .map_err(|source| MongoDaoError::WriteAnswer {
                participant_id,
                source,
            })?;
        Ok(())
    }

    async fn delete_answer_response(
        &self,
        participant_id: Uuid,
        question_id: Uuid,
    ) -> MongoResult<bool> {
        let result = self
            .answers()
            .await
            .delete_one(doc! {
                "participant_id": participant_id.to_string(),
                "question_id": question_id.to_string(),
            })
            .await
            .map_err(|source| MongoDaoError::WriteAnswer {
                participant_id,
                source,
            })?;
        Ok(result.deleted_count > 0)
    }

    async fn list_answers(&self, query: AnswerQuery) -> MongoResult<Vec<AnswerResponseEntity>> {
        let documents: Vec<MongoAnswerDocument> = self
            .answers()
            .await
            .find(answer_filter(&query))
            .sort(doc! {"question_order": 1, "created_at": 1})
            .await
            .map_err(|source| MongoDaoError::LoadAnswers { source })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::LoadAnswers { source })?;
        documents.into_iter().map(TryInto::try_into).collect()
    }
}

impl SessionStore for MongoSessionStore {
    fn create_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.create_session(session).await.map_err(Into::into) })
    }

    fn end_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move { store.end_session(id).await.map_err(Into::into) })
    }

    fn find_session(
        &self,
        lookup: SessionLookup,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.find_session(lookup).await.map_err(Into::into) })
    }

    fn update_session_status(
        &self,
        id: Uuid,
        status: SessionStatus,
        question_order: Option<u32>,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .update_session_status(id, status, question_order)
                .await
                .map_err(Into::into)
        })
    }

    fn list_history(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<SessionHistoryEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.list_history(session_id).await.map_err(Into::into) })
    }

    fn create_participant(
        &self,
        participant: ParticipantEntity,
    ) -> BoxFuture<'static, StorageResult<ParticipantEntity>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .create_participant(participant)
                .await
                .map_err(Into::into)
        })
    }

    fn participant_exists(&self, user_id: String) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move { store.participant_exists(user_id).await.map_err(Into::into) })
    }

    fn update_participant_status(
        &self,
        user_id: String,
        session_id: Uuid,
        status: ParticipantStatus,
    ) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .update_participant_status(user_id, session_id, status)
                .await
                .map_err(Into::into)
        })
    }

    fn update_participant_marks(
        &self,
        participant_id: Uuid,
        marks: f64,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .update_participant_marks(participant_id, marks)
                .await
                .map_err(Into::into)
        })
    }

    fn find_participant(
        &self,
        user_id: String,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .find_participant(user_id, session_id)
                .await
                .map_err(Into::into)
        })
    }

    fn list_participants(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ParticipantEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.list_participants(session_id).await.map_err(Into::into) })
    }

    fn save_answer_response(
        &self,
        answer: AnswerResponseEntity,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.save_answer_response(answer).await.map_err(Into::into) })
    }

    fn delete_answer_response(
        &self,
        participant_id: Uuid,
        question_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .delete_answer_response(participant_id, question_id)
                .await
                .map_err(Into::into)
        })
    }

    fn list_answers(
        &self,
        query: AnswerQuery,
    ) -> BoxFuture<'static, StorageResult<Vec<AnswerResponseEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.list_answers(query).await.map_err(Into::into) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.ping().await.map_err(Into::into) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.reconnect().await.map_err(Into::into) })
    }
}
