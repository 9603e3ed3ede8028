//! Session lifecycle requested over HTTP: create, check, end, interrupt and the
//! admission of WebSocket clients.

use std::time::{Duration, SystemTime};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::{
        cache::{SessionSnapshot, with_cache_deadline},
        models::{
            ParticipantEntity, ParticipantStatus, SessionEntity, SessionLookup, SessionStatus,
        },
        session_store::SessionStore,
        storage::with_deadline_retry,
    },
    dto::live::{CheckResponse, CreateSessionRequest, InterruptResponse, JoinQuery, SessionResponse},
    error::ServiceError,
    services::{code_allocator::is_valid_code, controller, identity_service::Identity},
    state::{
        SharedState,
        session::{
            ClientProfile, ClientRole, ControllerCommand, ControllerSnapshot, EndReason,
            SessionHandle,
        },
    },
};

const MODERATOR_NAME: &str = "Moderator";

/// Everything needed to register an upgraded connection with the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub session_id: Uuid,
    pub code: String,
    pub profile: ClientProfile,
    pub role: ClientRole,
    pub is_host: bool,
    pub participant_id: Option<Uuid>,
    pub marks: f64,
    /// The participant row already existed before this connection.
    pub returning: bool,
}

/// Return the live session of the requested quiz, or create, persist, cache and start one.
pub async fn create(
    state: &SharedState,
    host: &Identity,
    request: CreateSessionRequest,
) -> Result<SessionResponse, ServiceError> {
    // Held until the new session is indexed so concurrent requests see it.
    let mut allocator = state.creation_gate().lock().await;

    if let Some(existing) = state.session_by_quiz(request.quiz_id) {
        let snapshot = controller_snapshot(&existing).await?;
        info!(session_id = %existing.id, quiz_id = %request.quiz_id, "returning running session");
        return Ok(SessionResponse::new(&existing, snapshot.status, false));
    }

    let store = state.require_store().await?;
    let deadline = state.config().timings.io_deadline;

    let stale = with_deadline_retry("find_session", deadline, || {
        store.find_session(SessionLookup::QuizId(request.quiz_id))
    })
    .await?;
    if let Some(stale) = stale {
        warn!(session_id = %stale.id, code = %stale.code, "ending session left open by a previous run");
        with_deadline_retry("end_session", deadline, || store.end_session(stale.id)).await?;
        if let Err(err) =
            with_cache_deadline("delete", deadline, state.cache().delete(stale.code)).await
        {
            warn!(error = %err, "failed to drop cached snapshot of stale session");
        }
    }

    let outline = tokio::time::timeout(deadline, state.catalog().quiz_outline(request.quiz_id))
        .await
        .map_err(|_| ServiceError::Timeout)??
        .ok_or_else(|| ServiceError::NotFound(format!("quiz `{}`", request.quiz_id)))?;
    let questions = outline.playable(&request.exempted_question_ids);
    if questions.is_empty() {
        return Err(ServiceError::InvalidInput(
            "quiz has no playable questions".into(),
        ));
    }

    let code = allocator.allocate(&state.live_codes())?;
    let now = SystemTime::now();
    let session = SessionEntity {
        id: Uuid::new_v4(),
        host_user_id: host.user_id.clone(),
        quiz_id: request.quiz_id,
        code: code.clone(),
        status: SessionStatus::Idle,
        exempted_question_ids: request.exempted_question_ids,
        config: request.config.unwrap_or_default(),
        question_count: questions.len() as u32,
        created_at: now,
        updated_at: now,
        ended_at: None,
    };

    with_deadline_retry("create_session", deadline, || {
        store.create_session(session.clone())
    })
    .await?;

    let snapshot = SessionSnapshot {
        session_id: session.id,
        quiz_id: session.quiz_id,
        question_count: session.question_count,
        current_question: 0,
        status: SessionStatus::Idle,
        config: session.config.clone(),
    };
    let cached = with_cache_deadline(
        "put",
        deadline,
        state
            .cache()
            .put(code.clone(), snapshot, state.config().timings.cache_ttl),
    )
    .await;
    if let Err(err) = cached {
        warn!(session_id = %session.id, error = %err, "failed to seed cache; rolling back session");
        if let Err(end_err) =
            with_deadline_retry("end_session", deadline, || store.end_session(session.id)).await
        {
            warn!(session_id = %session.id, error = %end_err, "failed to end rolled back session");
        }
        return Err(err.into());
    }

    let session_id = session.id;
    let handle = match controller::launch(state, session, questions).await {
        Ok(handle) => handle,
        Err(err) => {
            warn!(%session_id, error = %err, "failed to start session controller");
            controller::teardown(state, session_id, &code, EndReason::Internal).await;
            return Err(err);
        }
    };
    drop(allocator);

    info!(
        session_id = %handle.id,
        %code,
        quiz_id = %handle.quiz_id,
        host = %handle.host_user_id,
        questions = handle.question_count,
        "live session created"
    );
    Ok(SessionResponse::new(&handle, SessionStatus::Idle, true))
}

/// Presence and progress of the session holding `code`: cache first, then the store.
pub async fn check(state: &SharedState, code: &str) -> Result<CheckResponse, ServiceError> {
    ensure_code(code)?;
    let deadline = state.config().timings.io_deadline;

    match with_cache_deadline("get", deadline, state.cache().get(code.to_owned())).await {
        Ok(Some(snapshot)) => {
            return Ok(CheckResponse {
                exists: true,
                session_id: Some(snapshot.session_id),
                quiz_id: Some(snapshot.quiz_id),
                question_count: Some(snapshot.question_count),
                current_question: Some(snapshot.current_question),
                status: Some(snapshot.status),
            });
        }
        Ok(None) => {}
        Err(err) => warn!(%code, error = %err, "cache lookup failed; falling back to store"),
    }

    let store = state.require_store().await?;
    let found = with_deadline_retry("find_session", deadline, || {
        store.find_session(SessionLookup::Code(code.to_owned()))
    })
    .await?;

    Ok(match found.filter(|session| session.status.is_live()) {
        Some(session) => CheckResponse {
            exists: true,
            session_id: Some(session.id),
            quiz_id: Some(session.quiz_id),
            question_count: Some(session.question_count),
            current_question: None,
            status: Some(session.status),
        },
        None => CheckResponse::missing(),
    })
}

/// End the session on behalf of its host. Resolves once the session is torn down.
pub async fn end(
    state: &SharedState,
    code: &str,
    caller: &Identity,
) -> Result<SessionResponse, ServiceError> {
    let handle = live_session(state, code)?;
    require_host(&handle, caller)?;

    let (reply, done) = oneshot::channel();
    send_command(
        &handle,
        ControllerCommand::End {
            reason: EndReason::HostEnded,
            reply: Some(reply),
        },
    )
    .await?;
    // A dropped reply means the controller already stopped.
    let _ = done.await;

    Ok(SessionResponse::new(&handle, SessionStatus::Ended, false))
}

/// Skip the running timer of the session on behalf of its host.
pub async fn interrupt(
    state: &SharedState,
    code: &str,
    caller: &Identity,
) -> Result<InterruptResponse, ServiceError> {
    let handle = live_session(state, code)?;
    require_host(&handle, caller)?;

    let (reply, answer) = oneshot::channel();
    send_command(&handle, ControllerCommand::Interrupt { reply }).await?;
    let status = answer.await.map_err(|_| session_ended())??;

    Ok(InterruptResponse {
        session_id: handle.id,
        status,
    })
}

/// Check a join request and prepare the participant (or host) it admits.
pub async fn admit(
    state: &SharedState,
    code: &str,
    caller: &Identity,
    query: JoinQuery,
) -> Result<Admission, ServiceError> {
    let handle = live_session(state, code)?;
    if query.id != handle.id {
        return Err(ServiceError::InvalidInput(
            "id does not match the session".into(),
        ));
    }

    let profile = ClientProfile {
        user_id: caller.user_id.clone(),
        name: query.name.trim().to_owned(),
        emoji: query.emoji,
        color: query.color,
    };

    if caller.user_id == handle.host_user_id {
        return Ok(Admission {
            session_id: handle.id,
            code: handle.code,
            profile,
            role: ClientRole::Host,
            is_host: true,
            participant_id: None,
            marks: 0.0,
            returning: true,
        });
    }

    let store = state.require_store().await?;
    let deadline = state.config().timings.io_deadline;
    let existing = with_deadline_retry("find_participant", deadline, || {
        store.find_participant(caller.user_id.clone(), handle.id)
    })
    .await?;

    let (participant_id, marks, returning) = match existing {
        Some(participant) => rejoin(store.as_ref(), deadline, handle.id, &caller.user_id, participant).await?,
        None => {
            let locked = state
                .hub()
                .is_locked(handle.id)
                .await
                .map_err(|err| ServiceError::InvalidState(err.to_string()))?;
            match locked {
                Some(true) => return Err(ServiceError::Forbidden("session is locked".into())),
                Some(false) => {}
                None => return Err(session_ended()),
            }

            let now = SystemTime::now();
            let participant = ParticipantEntity {
                id: Uuid::new_v4(),
                user_id: Some(caller.user_id.clone()),
                session_id: handle.id,
                name: profile.name.clone(),
                emoji: profile.emoji.clone(),
                color: profile.color.clone(),
                status: ParticipantStatus::Joined,
                marks: 0.0,
                created_at: now,
                updated_at: now,
            };
            let participant_id = participant.id;
            let stored = with_deadline_retry("create_participant", deadline, || {
                store.create_participant(participant.clone())
            })
            .await?;
            if stored.id == participant_id {
                (participant_id, 0.0, false)
            } else {
                debug!(session_id = %handle.id, user_id = %caller.user_id, "concurrent join already created the participant");
                rejoin(store.as_ref(), deadline, handle.id, &caller.user_id, stored).await?
            }
        }
    };

    Ok(Admission {
        session_id: handle.id,
        code: handle.code,
        profile,
        role: ClientRole::Participant,
        is_host: false,
        participant_id: Some(participant_id),
        marks,
        returning,
    })
}

/// Mark an existing participant row as joined again. Kicked users stay out.
async fn rejoin(
    store: &dyn SessionStore,
    deadline: Duration,
    session_id: Uuid,
    user_id: &str,
    participant: ParticipantEntity,
) -> Result<(Uuid, f64, bool), ServiceError> {
    if participant.status == ParticipantStatus::Kicked {
        return Err(ServiceError::Forbidden(
            "you were removed from this session".into(),
        ));
    }
    let updated = with_deadline_retry("update_participant_status", deadline, || {
        store.update_participant_status(user_id.to_owned(), session_id, ParticipantStatus::Joined)
    })
    .await?;
    let marks = updated.map_or(participant.marks, |row| row.marks);
    Ok((participant.id, marks, true))
}

/// Admit a moderator console. The host's credential grants host commands;
/// anonymous consoles only observe.
pub fn admit_moderator(
    state: &SharedState,
    code: &str,
    caller: Option<&Identity>,
) -> Result<Admission, ServiceError> {
    let handle = live_session(state, code)?;
    let is_host = caller.is_some_and(|identity| identity.user_id == handle.host_user_id);
    let user_id = match caller {
        Some(identity) => format!("mod:{}", identity.user_id),
        None => format!("mod:{}", Uuid::new_v4()),
    };

    Ok(Admission {
        session_id: handle.id,
        code: handle.code,
        profile: ClientProfile {
            user_id,
            name: MODERATOR_NAME.into(),
            emoji: None,
            color: None,
        },
        role: ClientRole::Moderator,
        is_host,
        participant_id: None,
        marks: 0.0,
        returning: true,
    })
}

fn ensure_code(code: &str) -> Result<(), ServiceError> {
    if is_valid_code(code) {
        Ok(())
    } else {
        Err(ServiceError::InvalidInput(format!("invalid join code `{code}`")))
    }
}

fn live_session(state: &SharedState, code: &str) -> Result<SessionHandle, ServiceError> {
    ensure_code(code)?;
    state
        .session_by_code(code)
        .ok_or_else(|| ServiceError::NotFound(format!("no live session `{code}`")))
}

fn require_host(handle: &SessionHandle, caller: &Identity) -> Result<(), ServiceError> {
    if caller.user_id == handle.host_user_id {
        Ok(())
    } else {
        Err(ServiceError::Forbidden("only the host can do this".into()))
    }
}

fn session_ended() -> ServiceError {
    ServiceError::NotFound("session ended".into())
}

async fn send_command(
    handle: &SessionHandle,
    command: ControllerCommand,
) -> Result<(), ServiceError> {
    handle
        .commands
        .send(command)
        .await
        .map_err(|_| session_ended())
}

async fn controller_snapshot(handle: &SessionHandle) -> Result<ControllerSnapshot, ServiceError> {
    let (reply, answer) = oneshot::channel();
    send_command(handle, ControllerCommand::Snapshot { reply }).await?;
    answer.await.map_err(|_| session_ended())
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
        time::Duration,
    };

    use futures::future::{BoxFuture, join_all};

    use super::*;
    use crate::{
        config::AppConfig,
        dao::{
            cache::{SessionCache, memory::MemorySessionCache},
            models::{
                AnswerQuery, AnswerResponseEntity, QuestionType, SessionConfig,
                SessionHistoryEntity,
            },
            quiz_catalog::{
                Question, QuestionOption,
                memory::{MemoryQuizCatalog, QuizFixture},
            },
            session_store::{SessionStore, memory::MemorySessionStore},
            storage::{StorageError, StorageResult},
        },
        services::identity_service::Claims,
        state::{AppState, hub::HubHandle},
    };

    struct Fixture {
        state: SharedState,
        store: Arc<MemorySessionStore>,
        cache: Arc<MemorySessionCache>,
        quiz_id: Uuid,
        question_ids: Vec<Uuid>,
    }

    /// Memory store whose next `failures` calls fail as if the connection dropped.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemorySessionStore,
        failures: AtomicU32,
    }

    impl FlakyStore {
        fn fail_next(&self, calls: u32) {
            self.failures.store(calls, Ordering::SeqCst);
        }

        fn outage<T: Send + 'static>(&self) -> Option<BoxFuture<'static, StorageResult<T>>> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            failing.then(|| -> BoxFuture<'static, StorageResult<T>> {
                Box::pin(async {
                    Err(StorageError::unavailable(
                        "connection reset".into(),
                        std::io::Error::other("reset by peer"),
                    ))
                })
            })
        }
    }

    impl SessionStore for FlakyStore {
        fn create_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<()>> {
            self.outage()
                .unwrap_or_else(|| self.inner.create_session(session))
        }

        fn end_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<bool>> {
            self.outage().unwrap_or_else(|| self.inner.end_session(id))
        }

        fn find_session(
            &self,
            lookup: SessionLookup,
        ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
            self.outage().unwrap_or_else(|| self.inner.find_session(lookup))
        }

        fn update_session_status(
            &self,
            id: Uuid,
            status: SessionStatus,
            question_order: Option<u32>,
        ) -> BoxFuture<'static, StorageResult<()>> {
            self.outage()
                .unwrap_or_else(|| self.inner.update_session_status(id, status, question_order))
        }

        fn list_history(
            &self,
            session_id: Uuid,
        ) -> BoxFuture<'static, StorageResult<Vec<SessionHistoryEntity>>> {
            self.outage().unwrap_or_else(|| self.inner.list_history(session_id))
        }

        fn create_participant(
            &self,
            participant: ParticipantEntity,
        ) -> BoxFuture<'static, StorageResult<ParticipantEntity>> {
            self.outage()
                .unwrap_or_else(|| self.inner.create_participant(participant))
        }

        fn update_participant_status(
            &self,
            user_id: String,
            session_id: Uuid,
            status: ParticipantStatus,
        ) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>> {
            self.outage().unwrap_or_else(|| {
                self.inner
                    .update_participant_status(user_id, session_id, status)
            })
        }

        fn update_participant_marks(
            &self,
            participant_id: Uuid,
            marks: f64,
        ) -> BoxFuture<'static, StorageResult<()>> {
            self.outage()
                .unwrap_or_else(|| self.inner.update_participant_marks(participant_id, marks))
        }

        fn find_participant(
            &self,
            user_id: String,
            session_id: Uuid,
        ) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>> {
            self.outage()
                .unwrap_or_else(|| self.inner.find_participant(user_id, session_id))
        }

        fn participant_exists(&self, user_id: String) -> BoxFuture<'static, StorageResult<bool>> {
            self.outage()
                .unwrap_or_else(|| self.inner.participant_exists(user_id))
        }

        fn list_participants(
            &self,
            session_id: Uuid,
        ) -> BoxFuture<'static, StorageResult<Vec<ParticipantEntity>>> {
            self.outage()
                .unwrap_or_else(|| self.inner.list_participants(session_id))
        }

        fn save_answer_response(
            &self,
            answer: AnswerResponseEntity,
        ) -> BoxFuture<'static, StorageResult<()>> {
            self.outage()
                .unwrap_or_else(|| self.inner.save_answer_response(answer))
        }

        fn delete_answer_response(
            &self,
            participant_id: Uuid,
            question_id: Uuid,
        ) -> BoxFuture<'static, StorageResult<bool>> {
            self.outage().unwrap_or_else(|| {
                self.inner
                    .delete_answer_response(participant_id, question_id)
            })
        }

        fn list_answers(
            &self,
            query: AnswerQuery,
        ) -> BoxFuture<'static, StorageResult<Vec<AnswerResponseEntity>>> {
            self.outage().unwrap_or_else(|| self.inner.list_answers(query))
        }

        fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
            self.inner.health_check()
        }

        fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
            self.inner.try_reconnect()
        }
    }

    fn identity(user_id: &str) -> Identity {
        Identity {
            user_id: user_id.into(),
            claims: Claims {
                sub: user_id.into(),
                name: None,
                exp: u64::MAX,
            },
        }
    }

    fn question(order: u32) -> Question {
        Question {
            id: Uuid::new_v4(),
            order,
            content: format!("Question {order}"),
            question_type: QuestionType::SingleChoice,
            media: None,
            time_limit_secs: 20,
            have_time_factor: false,
            time_factor: 0.0,
            options: vec![QuestionOption {
                id: Uuid::new_v4(),
                content: "yes".into(),
                is_correct: true,
                mark: 100.0,
                color: None,
            }],
        }
    }

    async fn fixture() -> Fixture {
        let (hub, _task) = HubHandle::spawn();
        let questions = vec![question(1), question(2), question(3)];
        let quiz = QuizFixture {
            quiz_id: Uuid::new_v4(),
            title: "Rivers".into(),
            questions: questions.clone(),
        };
        let quiz_id = quiz.quiz_id;
        let cache = Arc::new(MemorySessionCache::new());
        let state = AppState::new(
            AppConfig::default(),
            cache.clone(),
            Arc::new(MemoryQuizCatalog::with_quizzes([quiz])),
            hub,
        );
        let store = Arc::new(MemorySessionStore::new());
        state.install_session_store(store.clone()).await;
        Fixture {
            state,
            store,
            cache,
            quiz_id,
            question_ids: questions.iter().map(|q| q.id).collect(),
        }
    }

    fn request(quiz_id: Uuid, exempted: Vec<Uuid>) -> CreateSessionRequest {
        CreateSessionRequest {
            quiz_id,
            exempted_question_ids: exempted,
            config: None,
        }
    }

    fn join_query(session_id: Uuid, name: &str) -> JoinQuery {
        JoinQuery {
            id: session_id,
            name: name.into(),
            emoji: None,
            color: None,
        }
    }

    #[tokio::test]
    async fn create_then_check_reports_idle_session() {
        let f = fixture().await;
        let created = create(&f.state, &identity("host"), request(f.quiz_id, vec![]))
            .await
            .unwrap();
        assert!(created.created);
        assert_eq!(created.question_count, 3);
        assert!(is_valid_code(&created.code));

        let checked = check(&f.state, &created.code).await.unwrap();
        assert!(checked.exists);
        assert_eq!(checked.session_id, Some(created.session_id));
        assert_eq!(checked.status, Some(SessionStatus::Idle));
        assert_eq!(checked.current_question, Some(0));
    }

    #[tokio::test]
    async fn exempted_questions_are_not_counted() {
        let f = fixture().await;
        let created = create(
            &f.state,
            &identity("host"),
            request(f.quiz_id, vec![f.question_ids[1]]),
        )
        .await
        .unwrap();
        assert_eq!(created.question_count, 2);
    }

    #[tokio::test]
    async fn concurrent_creates_share_one_session() {
        let f = fixture().await;
        let attempts = (0..2).map(|i| {
            let state = f.state.clone();
            let quiz_id = f.quiz_id;
            tokio::spawn(async move {
                create(&state, &identity(&format!("host-{i}")), request(quiz_id, vec![])).await
            })
        });
        let results: Vec<SessionResponse> = join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(results[0].session_id, results[1].session_id);
        assert_eq!(results[0].code, results[1].code);
        assert_eq!(results.iter().filter(|r| r.created).count(), 1);

        let live = f
            .store
            .find_session(SessionLookup::QuizId(f.quiz_id))
            .await
            .unwrap();
        assert_eq!(live.map(|s| s.id), Some(results[0].session_id));
        assert_eq!(f.state.live_session_count(), 1);
    }

    #[tokio::test]
    async fn stale_store_session_is_ended_before_creating() {
        let f = fixture().await;
        let now = SystemTime::now();
        let stale = SessionEntity {
            id: Uuid::new_v4(),
            host_user_id: "host".into(),
            quiz_id: f.quiz_id,
            code: "ZZ9999".into(),
            status: SessionStatus::Answering,
            exempted_question_ids: Vec::new(),
            config: SessionConfig::default(),
            question_count: 3,
            created_at: now,
            updated_at: now,
            ended_at: None,
        };
        f.store.create_session(stale.clone()).await.unwrap();

        let created = create(&f.state, &identity("host"), request(f.quiz_id, vec![]))
            .await
            .unwrap();
        assert_ne!(created.session_id, stale.id);

        let old = f
            .store
            .find_session(SessionLookup::Id(stale.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(old.status, SessionStatus::Ended);
        assert!(old.ended_at.is_some());
    }

    #[tokio::test]
    async fn unknown_quiz_is_not_found() {
        let f = fixture().await;
        let err = create(&f.state, &identity("host"), request(Uuid::new_v4(), vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn creation_requires_a_connected_store() {
        let f = fixture().await;
        f.state.clear_session_store().await;
        let err = create(&f.state, &identity("host"), request(f.quiz_id, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Degraded));
    }

    #[tokio::test]
    async fn check_validates_code_and_reports_absence() {
        let f = fixture().await;
        assert!(matches!(
            check(&f.state, "ab1234").await,
            Err(ServiceError::InvalidInput(_))
        ));
        assert_eq!(
            check(&f.state, "AB1234").await.unwrap(),
            CheckResponse::missing()
        );
    }

    #[tokio::test]
    async fn check_falls_back_to_store_on_cache_miss() {
        let f = fixture().await;
        let created = create(&f.state, &identity("host"), request(f.quiz_id, vec![]))
            .await
            .unwrap();
        f.cache.delete(created.code.clone()).await.unwrap();

        let checked = check(&f.state, &created.code).await.unwrap();
        assert!(checked.exists);
        assert_eq!(checked.session_id, Some(created.session_id));
        assert_eq!(checked.current_question, None);
    }

    #[tokio::test]
    async fn only_the_host_may_end_or_interrupt() {
        let f = fixture().await;
        let created = create(&f.state, &identity("host"), request(f.quiz_id, vec![]))
            .await
            .unwrap();

        assert!(matches!(
            end(&f.state, &created.code, &identity("guest")).await,
            Err(ServiceError::Forbidden(_))
        ));
        assert!(matches!(
            interrupt(&f.state, &created.code, &identity("guest")).await,
            Err(ServiceError::Forbidden(_))
        ));
        // Nothing to skip before the session starts.
        assert!(matches!(
            interrupt(&f.state, &created.code, &identity("host")).await,
            Err(ServiceError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn end_releases_code_and_cache() {
        let f = fixture().await;
        let created = create(&f.state, &identity("host"), request(f.quiz_id, vec![]))
            .await
            .unwrap();

        let ended = end(&f.state, &created.code, &identity("host")).await.unwrap();
        assert_eq!(ended.status, SessionStatus::Ended);

        tokio::time::timeout(Duration::from_secs(5), async {
            while f.state.session_by_code(&created.code).is_some() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(check(&f.state, &created.code).await.unwrap(), CheckResponse::missing());
        assert!(matches!(
            end(&f.state, &created.code, &identity("host")).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn admission_persists_participants_and_preserves_marks() {
        let f = fixture().await;
        let created = create(&f.state, &identity("host"), request(f.quiz_id, vec![]))
            .await
            .unwrap();

        let first = admit(
            &f.state,
            &created.code,
            &identity("ann"),
            join_query(created.session_id, " Ann "),
        )
        .await
        .unwrap();
        assert_eq!(first.role, ClientRole::Participant);
        assert_eq!(first.profile.name, "Ann");
        assert!(!first.returning);

        let participant_id = first.participant_id.unwrap();
        f.store
            .update_participant_marks(participant_id, 250.0)
            .await
            .unwrap();
        f.store
            .update_participant_status("ann".into(), created.session_id, ParticipantStatus::Left)
            .await
            .unwrap();

        let again = admit(
            &f.state,
            &created.code,
            &identity("ann"),
            join_query(created.session_id, "Ann"),
        )
        .await
        .unwrap();
        assert!(again.returning);
        assert_eq!(again.participant_id, Some(participant_id));
        assert_eq!(again.marks, 250.0);

        let row = f
            .store
            .find_participant("ann".into(), created.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ParticipantStatus::Joined);
    }

    #[tokio::test]
    async fn admission_refuses_kicked_users_and_wrong_ids() {
        let f = fixture().await;
        let created = create(&f.state, &identity("host"), request(f.quiz_id, vec![]))
            .await
            .unwrap();

        assert!(matches!(
            admit(&f.state, &created.code, &identity("bob"), join_query(Uuid::new_v4(), "Bob")).await,
            Err(ServiceError::InvalidInput(_))
        ));

        admit(&f.state, &created.code, &identity("bob"), join_query(created.session_id, "Bob"))
            .await
            .unwrap();
        f.store
            .update_participant_status("bob".into(), created.session_id, ParticipantStatus::Kicked)
            .await
            .unwrap();
        assert!(matches!(
            admit(&f.state, &created.code, &identity("bob"), join_query(created.session_id, "Bob")).await,
            Err(ServiceError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn host_and_moderators_are_not_participants() {
        let f = fixture().await;
        let created = create(&f.state, &identity("host"), request(f.quiz_id, vec![]))
            .await
            .unwrap();

        let host = admit(&f.state, &created.code, &identity("host"), join_query(created.session_id, "Host"))
            .await
            .unwrap();
        assert_eq!(host.role, ClientRole::Host);
        assert!(host.is_host);
        assert!(host.participant_id.is_none());

        let console = admit_moderator(&f.state, &created.code, Some(&identity("host"))).unwrap();
        assert_eq!(console.role, ClientRole::Moderator);
        assert!(console.is_host);

        let observer = admit_moderator(&f.state, &created.code, None).unwrap();
        assert!(!observer.is_host);
        assert_ne!(observer.profile.user_id, console.profile.user_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_joins_share_one_participant_row() {
        let f = fixture().await;
        let created = create(&f.state, &identity("host"), request(f.quiz_id, vec![]))
            .await
            .unwrap();

        let attempts = (0..8).map(|_| {
            let state = f.state.clone();
            let code = created.code.clone();
            let session_id = created.session_id;
            tokio::spawn(async move {
                admit(&state, &code, &identity("ann"), join_query(session_id, "Ann")).await
            })
        });
        let admissions: Vec<Admission> = join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        let ids: HashSet<_> = admissions.iter().map(|a| a.participant_id).collect();
        assert_eq!(ids.len(), 1);
        assert_eq!(admissions.iter().filter(|a| !a.returning).count(), 1);
        assert_eq!(
            f.store.list_participants(created.session_id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn transient_store_failures_are_retried_once() {
        let f = fixture().await;
        let store = Arc::new(FlakyStore::default());
        f.state.install_session_store(store.clone()).await;

        store.fail_next(1);
        let created = create(&f.state, &identity("host"), request(f.quiz_id, vec![]))
            .await
            .unwrap();

        f.cache.delete(created.code.clone()).await.unwrap();
        store.fail_next(1);
        assert!(check(&f.state, &created.code).await.unwrap().exists);

        store.fail_next(1);
        let ann = admit(&f.state, &created.code, &identity("ann"), join_query(created.session_id, "Ann"))
            .await
            .unwrap();
        assert!(!ann.returning);

        // A second consecutive failure surfaces.
        store.fail_next(2);
        assert!(matches!(
            admit(&f.state, &created.code, &identity("bob"), join_query(created.session_id, "Bob")).await,
            Err(ServiceError::Unavailable(_))
        ));
        assert!(
            store
                .inner
                .find_participant("ann".into(), created.session_id)
                .await
                .unwrap()
                .is_some()
        );
    }
}
