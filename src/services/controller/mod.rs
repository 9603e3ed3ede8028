//! Per-session controller task: drives the state machine, its timers, answer
//! ingestion and leaderboards. Only the controller mutates its session.

pub mod countdown;
pub mod leaderboard;
pub mod scoring;

use std::{
    collections::HashMap,
    time::{Duration, SystemTime},
};

use futures::{
    FutureExt, StreamExt, TryFutureExt,
    future::{BoxFuture, join_all},
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    dao::{
        cache::{SessionSnapshot, with_cache_deadline},
        models::{AnswerResponseEntity, ParticipantStatus, SessionEntity, ranking_order},
        quiz_catalog::{Question, QuestionRef},
        session_store::SessionStore,
        storage::{RETRY_BASE_DELAY, StorageResult, retry_once, with_deadline},
    },
    dto::ws::{Content, LeaderboardEntry, OptionView, ParticipantView, ServerContent},
    error::ServiceError,
    state::{
        SharedState,
        session::{
            ClientProfile, ClientRole, ControllerCommand, ControllerSnapshot, EndReason,
            SessionHandle,
        },
        state_machine::{SessionEvent, SessionPhase, SessionStateMachine},
    },
};

use self::{
    countdown::{Countdown, Tick, countdown},
    leaderboard::{Standing, rank},
    scoring::{answer_marks, distribution, validate_selection},
};

/// Capacity of a controller's command inbox.
pub const INBOX_CAPACITY: usize = 256;

const KICK_REASON: &str = "removed by the host";

/// Open `session` in the hub, add it to the live index and start its controller.
pub async fn launch(
    state: &SharedState,
    session: SessionEntity,
    questions: Vec<QuestionRef>,
) -> Result<SessionHandle, ServiceError> {
    let (commands_tx, commands_rx) = mpsc::channel(INBOX_CAPACITY);
    state
        .hub()
        .open_session(session.id, session.code.clone(), commands_tx.clone())
        .await
        .map_err(|err| ServiceError::InvalidState(err.to_string()))?;

    let handle = SessionHandle {
        id: session.id,
        code: session.code.clone(),
        quiz_id: session.quiz_id,
        host_user_id: session.host_user_id.clone(),
        question_count: session.question_count,
        config: session.config.clone(),
        created_at: session.created_at,
        commands: commands_tx,
    };
    state.index_session(handle.clone());

    let controller = SessionController::new(state.clone(), session, questions, commands_rx);
    let task = tokio::spawn(controller.run());
    tokio::spawn(supervise(
        state.clone(),
        handle.id,
        handle.code.clone(),
        task,
    ));

    Ok(handle)
}

/// Wait for the controller task; a crashed controller still gets its session torn down.
async fn supervise(state: SharedState, session_id: Uuid, code: String, task: JoinHandle<()>) {
    match task.await {
        Ok(()) => debug!(%session_id, "session controller finished"),
        Err(err) => {
            error!(%session_id, %code, error = %err, "session controller crashed");
            teardown(&state, session_id, &code, EndReason::Internal).await;
        }
    }
}

/// Close the session in the hub with `END_LQS`, drop its cache entries, end its
/// store row and release its code.
pub(crate) async fn teardown(state: &SharedState, session_id: Uuid, code: &str, reason: EndReason) {
    let farewell = ServerContent::EndLqs {
        reason: reason.as_str().to_owned(),
    };
    if state
        .hub()
        .close_session(session_id, Some(farewell))
        .await
        .is_err()
    {
        warn!(%session_id, "hub stopped before the session could be closed");
    }

    let deadline = state.config().timings.io_deadline;
    if let Err(err) =
        with_cache_deadline("delete", deadline, state.cache().delete(code.to_owned())).await
    {
        warn!(%session_id, %code, error = %err, "failed to drop cached session");
    }

    match state.session_store().await {
        Some(store) => {
            if let Err(err) =
                with_deadline("end_session", deadline, store.end_session(session_id)).await
            {
                warn!(%session_id, error = %err, "failed to end session in store");
            }
        }
        None => warn!(%session_id, "store unavailable; session row left open"),
    }

    state.remove_session(session_id);
    info!(%session_id, %code, reason = reason.as_str(), "session ended");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct Member {
    participant_id: Option<Uuid>,
    profile: ClientProfile,
    marks: f64,
    status: ParticipantStatus,
    connected: bool,
}

struct RecordedAnswer {
    option_ids: Vec<Uuid>,
    marks: f64,
}

/// Question currently being played.
struct ActiveQuestion {
    order: u32,
    question: Question,
    answers: HashMap<String, RecordedAnswer>,
    options_sent_at: Option<Instant>,
}

struct Accepted {
    record: Option<AnswerResponseEntity>,
    question_id: Uuid,
    marks: f64,
    total_marks: f64,
}

struct SessionController {
    state: SharedState,
    session: SessionEntity,
    questions: Vec<QuestionRef>,
    machine: SessionStateMachine,
    countdown: Option<Countdown>,
    roster: HashMap<String, Member>,
    current: Option<ActiveQuestion>,
    current_order: u32,
    locked: bool,
    commands: mpsc::Receiver<ControllerCommand>,
}

async fn next_tick(countdown: &mut Option<Countdown>) -> Option<Tick> {
    match countdown {
        Some(ticks) => ticks.next().await,
        None => std::future::pending().await,
    }
}

impl SessionController {
    fn new(
        state: SharedState,
        session: SessionEntity,
        questions: Vec<QuestionRef>,
        commands: mpsc::Receiver<ControllerCommand>,
    ) -> Self {
        let machine = SessionStateMachine::new(
            questions.len() as u32,
            session.config.leaderboard.between_questions,
        );
        Self {
            state,
            session,
            questions,
            machine,
            countdown: None,
            roster: HashMap::new(),
            current: None,
            current_order: 0,
            locked: false,
            commands,
        }
    }

    async fn run(mut self) {
        info!(
            session_id = %self.session.id,
            code = %self.session.code,
            questions = self.questions.len(),
            "session controller started"
        );
        loop {
            let flow = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => self.end(EndReason::Internal, None).await,
                },
                Some(tick) = next_tick(&mut self.countdown) => self.on_tick(tick).await,
            };
            if flow == Flow::Stop {
                break;
            }
        }
    }

    async fn handle_command(&mut self, command: ControllerCommand) -> Flow {
        match command {
            ControllerCommand::Inbound {
                user_id,
                is_host,
                content,
            } => self.handle_inbound(user_id, is_host, content).await,
            ControllerCommand::ClientJoined {
                profile,
                role,
                participant_id,
                marks,
            } => {
                let user_id = profile.user_id.clone();
                if !self.client_joined(profile, role, participant_id, marks) {
                    self.refuse_kicked(&user_id).await;
                }
                Flow::Continue
            }
            ControllerCommand::ClientLeft { user_id } => {
                if let Some(member) = self.roster.get_mut(&user_id) {
                    member.connected = false;
                }
                let outcome = self.close_answering_if_complete().await;
                self.settle(outcome)
            }
            ControllerCommand::Interrupt { reply } => {
                let (result, flow) = match self.interrupt().await {
                    Ok(flow) => (Ok(self.machine.phase().status()), flow),
                    Err(err) => (Err(err), Flow::Continue),
                };
                let _ = reply.send(result);
                flow
            }
            ControllerCommand::End { reason, reply } => self.end(reason, reply).await,
            ControllerCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
                Flow::Continue
            }
        }
    }

    async fn handle_inbound(&mut self, user_id: String, is_host: bool, content: Content) -> Flow {
        if content.is_host_command() && !is_host {
            debug!(session_id = %self.session.id, %user_id, ?content, "host command from non-host");
            let denied = ServiceError::Forbidden("only the host can do this".into());
            self.reply(
                &user_id,
                ServerContent::Error {
                    message: denied.to_string(),
                },
            )
            .await;
            return Flow::Continue;
        }

        let outcome = match content {
            Content::JoinLqs => {
                let frame = self.session_state(&user_id);
                self.reply(&user_id, frame).await;
                Ok(Flow::Continue)
            }
            Content::LeaveLqs => self.leave(&user_id).await,
            Content::StartLqs => self.transition(SessionEvent::Start).await,
            Content::EndLqs => Ok(self.end(EndReason::HostEnded, None).await),
            Content::NextQuestion => self.transition(SessionEvent::Next).await,
            Content::Interrupt => self.interrupt().await,
            Content::SubmitAnswer { order, option_ids } => {
                self.submit(&user_id, is_host, order, option_ids).await
            }
            Content::UnsubmitAnswer { order } => self.unsubmit(&user_id, order).await,
            Content::GetParticipants => {
                let participants = self.participants();
                self.reply(&user_id, ServerContent::Participants { participants })
                    .await;
                Ok(Flow::Continue)
            }
            Content::GetLeaderboard => {
                let frame = ServerContent::Leaderboard {
                    order: self.machine.phase().order(),
                    entries: self.leaderboard(),
                };
                self.reply(&user_id, frame).await;
                Ok(Flow::Continue)
            }
            Content::KickParticipant { user_id: target } => self.kick(&target).await,
            Content::ToggleLock => self.toggle_lock().await,
        };

        match outcome {
            Ok(flow) => flow,
            Err(err) => {
                debug!(session_id = %self.session.id, %user_id, error = %err, "client command refused");
                self.reply(
                    &user_id,
                    ServerContent::Error {
                        message: err.to_string(),
                    },
                )
                .await;
                Flow::Continue
            }
        }
    }

    /// Log a failed internal step; the session keeps running.
    fn settle(&self, outcome: Result<Flow, ServiceError>) -> Flow {
        outcome.unwrap_or_else(|err| {
            warn!(session_id = %self.session.id, error = %err, "session step failed");
            Flow::Continue
        })
    }

    async fn on_tick(&mut self, tick: Tick) -> Flow {
        match tick {
            Tick::Remaining(remaining) => {
                self.broadcast(ServerContent::Countdown {
                    remaining,
                    status: self.machine.phase().status(),
                })
                .await;
                Flow::Continue
            }
            Tick::Elapsed => {
                self.countdown = None;
                let outcome = self.timer_elapsed().await;
                self.settle(outcome)
            }
        }
    }

    async fn timer_elapsed(&mut self) -> Result<Flow, ServiceError> {
        match self.machine.phase() {
            SessionPhase::Starting => self.transition(SessionEvent::StartCountdownElapsed).await,
            SessionPhase::Questioning { .. } => {
                let has_media = self
                    .current
                    .as_ref()
                    .is_some_and(|active| active.question.media.is_some());
                self.transition(SessionEvent::ReadingElapsed { has_media })
                    .await
            }
            SessionPhase::Media { .. } => self.transition(SessionEvent::MediaElapsed).await,
            SessionPhase::Answering { .. } => self.transition(SessionEvent::AnsweringClosed).await,
            SessionPhase::Concluding => Ok(self.end(EndReason::Completed, None).await),
            phase => Err(ServiceError::InvalidState(format!(
                "no timer runs while {}",
                phase.status().as_str()
            ))),
        }
    }

    /// Skip the running timer, or move on when the session waits for the host.
    async fn interrupt(&mut self) -> Result<Flow, ServiceError> {
        match self.machine.phase() {
            SessionPhase::Idle => Err(ServiceError::InvalidState(
                "session has not started".into(),
            )),
            SessionPhase::RevealingAnswer { .. } | SessionPhase::Leaderboard { .. } => {
                self.transition(SessionEvent::Next).await
            }
            _ => {
                self.countdown = None;
                self.timer_elapsed().await
            }
        }
    }

    async fn transition(&mut self, event: SessionEvent) -> Result<Flow, ServiceError> {
        let plan = self.machine.plan(event)?;

        if let SessionPhase::Questioning { order } = plan.to {
            match self.load_question(order).await {
                Ok(question) => {
                    self.current = Some(ActiveQuestion {
                        order,
                        question,
                        answers: HashMap::new(),
                        options_sent_at: None,
                    });
                }
                Err(err) => {
                    warn!(
                        session_id = %self.session.id,
                        order,
                        error = %err,
                        "question unavailable; ending session"
                    );
                    self.machine.abort(plan.id)?;
                    return Ok(self.end(EndReason::DataUnavailable, None).await);
                }
            }
        }

        self.countdown = None;
        let phase = self.machine.apply(plan.id)?;
        debug!(session_id = %self.session.id, from = ?plan.from, to = ?phase, "session transition");
        self.enter(phase).await;
        Ok(Flow::Continue)
    }

    async fn load_question(&self, order: u32) -> Result<Question, ServiceError> {
        let reference = order
            .checked_sub(1)
            .and_then(|index| self.questions.get(index as usize))
            .ok_or_else(|| ServiceError::NotFound(format!("question {order}")))?;
        let deadline = self.state.config().timings.io_deadline;
        let question = tokio::time::timeout(
            deadline,
            self.state
                .catalog()
                .question(self.session.quiz_id, reference.id),
        )
        .await
        .map_err(|_| ServiceError::Timeout)??;
        question.ok_or_else(|| ServiceError::NotFound(format!("question `{}`", reference.id)))
    }

    /// Emit the frames of a newly entered phase, persist it and arm its timer.
    async fn enter(&mut self, phase: SessionPhase) {
        let timings = self.state.config().timings.clone();
        match phase {
            SessionPhase::Starting => {
                self.persist_status().await;
                self.countdown = Some(countdown(timings.starting));
            }
            SessionPhase::Questioning { order } => {
                self.current_order = order;
                let total = self.machine.question_count();
                if let Some(active) = &self.current {
                    let question = &active.question;
                    let frame = ServerContent::DistributeQuestion {
                        order,
                        total,
                        question_id: question.id,
                        content: question.content.clone(),
                        question_type: question.question_type,
                        time_limit_secs: question.time_limit_secs,
                        has_media: question.media.is_some(),
                    };
                    self.broadcast(frame).await;
                }
                self.persist_status().await;
                self.countdown = Some(countdown(timings.questioning));
            }
            SessionPhase::Media { order } => {
                let media = self.current.as_ref().and_then(|active| {
                    active
                        .question
                        .media
                        .clone()
                        .map(|media| (active.question.id, media))
                });
                if let Some((question_id, media)) = media {
                    let duration = Duration::from_secs(media.duration_secs);
                    self.broadcast(ServerContent::DistributeMedia {
                        order,
                        question_id,
                        media,
                    })
                    .await;
                    self.countdown = Some(countdown(duration));
                }
                self.persist_status().await;
            }
            SessionPhase::Answering { order } => {
                let colorless = self.session.config.option.colorless;
                if let Some(active) = self.current.as_mut() {
                    active.options_sent_at = Some(Instant::now());
                    let question = &active.question;
                    let limit = Duration::from_secs(question.time_limit_secs);
                    let frame = ServerContent::DistributeOptions {
                        order,
                        question_id: question.id,
                        time_limit_secs: question.time_limit_secs,
                        options: question
                            .options
                            .iter()
                            .map(|option| OptionView {
                                id: option.id,
                                content: option.content.clone(),
                                color: if colorless { None } else { option.color.clone() },
                            })
                            .collect(),
                    };
                    self.broadcast(frame).await;
                    self.countdown = Some(countdown(limit));
                }
                self.persist_status().await;
            }
            SessionPhase::RevealingAnswer { order } => {
                self.reveal(order).await;
                self.persist_status().await;
            }
            SessionPhase::Leaderboard { order } => {
                self.persist_marks().await;
                let entries = self.leaderboard();
                self.broadcast(ServerContent::Leaderboard {
                    order: Some(order),
                    entries,
                })
                .await;
                self.persist_status().await;
            }
            SessionPhase::Concluding => {
                self.current_order = self.machine.question_count();
                self.persist_marks().await;
                let leaderboard = self.leaderboard();
                self.broadcast(ServerContent::Conclude { leaderboard }).await;
                self.persist_status().await;
                self.countdown = Some(countdown(timings.concluding));
            }
            SessionPhase::Idle | SessionPhase::Ending | SessionPhase::Ended => {
                self.persist_status().await;
            }
        }
    }

    async fn reveal(&mut self, order: u32) {
        let Some(active) = &self.current else {
            return;
        };
        let question = &active.question;
        let aggregate = distribution(
            question,
            order,
            active
                .answers
                .values()
                .map(|answer| answer.option_ids.as_slice()),
        );
        let question_id = question.id;
        let correct_option_ids = question.correct_option_ids();

        let deadline = self.state.config().timings.io_deadline;
        if let Err(err) = with_cache_deadline(
            "put_responses",
            deadline,
            self.state
                .cache()
                .put_responses(self.session.code.clone(), aggregate.clone()),
        )
        .await
        {
            warn!(session_id = %self.session.id, order, error = %err, "failed to cache answer distribution");
        }

        let frame = if self.session.config.option.show_correct_answer {
            ServerContent::RevealAnswer {
                order,
                question_id,
                correct_option_ids,
                distribution: aggregate,
            }
        } else {
            ServerContent::ConcludeQuestion {
                order,
                question_id,
                distribution: aggregate,
            }
        };
        self.broadcast(frame).await;
    }

    async fn submit(
        &mut self,
        user_id: &str,
        is_host: bool,
        order: u32,
        option_ids: Vec<Uuid>,
    ) -> Result<Flow, ServiceError> {
        let accepted = match self.record_answer(user_id, is_host, order, option_ids) {
            Ok(accepted) => accepted,
            Err(reason) => {
                debug!(session_id = %self.session.id, %user_id, order, %reason, "answer rejected");
                self.reply(user_id, ServerContent::AnswerRejected { order, reason })
                    .await;
                return Ok(Flow::Continue);
            }
        };

        self.reply(
            user_id,
            ServerContent::AnswerAccepted {
                order,
                question_id: accepted.question_id,
                marks: accepted.marks,
                total_marks: accepted.total_marks,
            },
        )
        .await;
        if self.session.config.leaderboard.during_questions {
            let entries = self.leaderboard();
            self.broadcast(ServerContent::MiniLeaderboard { order, entries })
                .await;
        }
        if let Some(record) = accepted.record {
            self.spawn_store_write("save_answer_response", move |store| {
                store.save_answer_response(record.clone())
            });
        }

        self.close_answering_if_complete().await
    }

    /// Apply the answer rules; the error is the rejection reason sent back.
    fn record_answer(
        &mut self,
        user_id: &str,
        is_host: bool,
        order: u32,
        option_ids: Vec<Uuid>,
    ) -> Result<Accepted, String> {
        if is_host {
            return Err("the host does not answer".into());
        }
        let SessionPhase::Answering { order: current } = self.machine.phase() else {
            return Err("answering is closed".into());
        };
        if order != current {
            return Err(format!("question {order} is not open"));
        }
        let Some(member) = self
            .roster
            .get_mut(user_id)
            .filter(|member| member.status == ParticipantStatus::Joined)
        else {
            return Err("not a participant of this session".into());
        };
        let Some(active) = self.current.as_mut().filter(|active| active.order == current) else {
            return Err("answering is closed".into());
        };

        validate_selection(&active.question, &option_ids).map_err(|err| err.to_string())?;
        let previous = active.answers.get(user_id).map(|answer| answer.marks);
        if previous.is_some() && !self.session.config.participant.reanswer {
            return Err("already answered".into());
        }

        let limit = Duration::from_secs(active.question.time_limit_secs);
        let used = active
            .options_sent_at
            .map(|sent| sent.elapsed())
            .unwrap_or_default();
        let marks = answer_marks(&active.question, &option_ids, limit.saturating_sub(used));
        member.marks += marks - previous.unwrap_or(0.0);

        let record = member
            .participant_id
            .map(|participant_id| AnswerResponseEntity {
                id: Uuid::new_v4(),
                session_id: self.session.id,
                participant_id,
                question_id: active.question.id,
                question_order: order,
                question_type: active.question.question_type,
                answer: option_ids.clone(),
                marks,
                use_time_ms: used.as_millis() as u64,
                created_at: SystemTime::now(),
            });
        active
            .answers
            .insert(user_id.to_owned(), RecordedAnswer { option_ids, marks });

        Ok(Accepted {
            record,
            question_id: active.question.id,
            marks,
            total_marks: member.marks,
        })
    }

    async fn unsubmit(&mut self, user_id: &str, order: u32) -> Result<Flow, ServiceError> {
        match self.withdraw_answer(user_id, order) {
            Ok((participant_id, question_id)) => {
                if let Some(participant_id) = participant_id {
                    self.spawn_store_write("delete_answer_response", move |store| {
                        store
                            .delete_answer_response(participant_id, question_id)
                            .map_ok(|_| ())
                            .boxed()
                    });
                }
                let frame = self.session_state(user_id);
                self.reply(user_id, frame).await;
            }
            Err(reason) => {
                self.reply(user_id, ServerContent::AnswerRejected { order, reason })
                    .await;
            }
        }
        Ok(Flow::Continue)
    }

    fn withdraw_answer(
        &mut self,
        user_id: &str,
        order: u32,
    ) -> Result<(Option<Uuid>, Uuid), String> {
        if !self.session.config.participant.reanswer {
            return Err("answers cannot be withdrawn in this session".into());
        }
        let SessionPhase::Answering { order: current } = self.machine.phase() else {
            return Err("answering is closed".into());
        };
        if order != current {
            return Err(format!("question {order} is not open"));
        }
        let active = self
            .current
            .as_mut()
            .ok_or_else(|| "answering is closed".to_owned())?;
        let removed = active
            .answers
            .remove(user_id)
            .ok_or_else(|| "no answer to withdraw".to_owned())?;
        let member = self
            .roster
            .get_mut(user_id)
            .ok_or_else(|| "not a participant of this session".to_owned())?;
        member.marks -= removed.marks;
        Ok((member.participant_id, active.question.id))
    }

    /// Answering closes early once every connected participant has answered.
    async fn close_answering_if_complete(&mut self) -> Result<Flow, ServiceError> {
        if matches!(self.machine.phase(), SessionPhase::Answering { .. }) && self.everyone_answered()
        {
            return self.transition(SessionEvent::AnsweringClosed).await;
        }
        Ok(Flow::Continue)
    }

    fn everyone_answered(&self) -> bool {
        let Some(active) = &self.current else {
            return false;
        };
        let mut expected = self
            .roster
            .iter()
            .filter(|(_, member)| member.connected && member.status == ParticipantStatus::Joined)
            .peekable();
        expected.peek().is_some()
            && expected.all(|(user_id, _)| active.answers.contains_key(user_id))
    }

    /// Add or reconnect a roster member. Returns `false` for a kicked participant,
    /// who stays kicked.
    fn client_joined(
        &mut self,
        profile: ClientProfile,
        role: ClientRole,
        participant_id: Option<Uuid>,
        marks: f64,
    ) -> bool {
        if role != ClientRole::Participant {
            debug!(session_id = %self.session.id, user_id = %profile.user_id, ?role, "non-participant joined");
            return true;
        }
        match self.roster.get_mut(&profile.user_id) {
            Some(member) if member.status == ParticipantStatus::Kicked => return false,
            Some(member) => {
                // In-memory marks stay authoritative across reconnects.
                member.connected = true;
                member.status = ParticipantStatus::Joined;
                member.participant_id = participant_id.or(member.participant_id);
                member.profile = profile;
            }
            None => {
                self.roster.insert(
                    profile.user_id.clone(),
                    Member {
                        participant_id,
                        profile,
                        marks,
                        status: ParticipantStatus::Joined,
                        connected: true,
                    },
                );
            }
        }
        true
    }

    /// A kicked participant got back in before the kick reached the store:
    /// write the kick again and close the new connection.
    async fn refuse_kicked(&self, user_id: &str) {
        warn!(session_id = %self.session.id, %user_id, "kicked participant reconnected; removing again");
        self.spawn_status_write(user_id, ParticipantStatus::Kicked);
        let notice = ServerContent::Kicked {
            reason: KICK_REASON.into(),
        };
        if self
            .state
            .hub()
            .kick(self.session.id, user_id.to_owned(), notice)
            .await
            .is_err()
        {
            warn!(session_id = %self.session.id, %user_id, "hub stopped before kick");
        }
    }

    async fn leave(&mut self, user_id: &str) -> Result<Flow, ServiceError> {
        if let Some(member) = self.roster.get_mut(user_id) {
            member.status = ParticipantStatus::Left;
            member.connected = false;
            if member.participant_id.is_some() {
                self.spawn_status_write(user_id, ParticipantStatus::Left);
            }
        }
        if self
            .state
            .hub()
            .disconnect(self.session.id, user_id.to_owned())
            .await
            .is_err()
        {
            warn!(session_id = %self.session.id, %user_id, "hub stopped before disconnect");
        }
        info!(session_id = %self.session.id, %user_id, "participant left");
        self.close_answering_if_complete().await
    }

    async fn kick(&mut self, target: &str) -> Result<Flow, ServiceError> {
        if target == self.session.host_user_id {
            return Err(ServiceError::InvalidInput("the host cannot be kicked".into()));
        }
        let member = self
            .roster
            .get_mut(target)
            .ok_or_else(|| ServiceError::NotFound(format!("participant `{target}`")))?;
        member.status = ParticipantStatus::Kicked;
        member.connected = false;
        if member.participant_id.is_some() {
            self.spawn_status_write(target, ParticipantStatus::Kicked);
        }

        let notice = ServerContent::Kicked {
            reason: KICK_REASON.into(),
        };
        if self
            .state
            .hub()
            .kick(self.session.id, target.to_owned(), notice)
            .await
            .is_err()
        {
            warn!(session_id = %self.session.id, user_id = %target, "hub stopped before kick");
        }
        info!(session_id = %self.session.id, user_id = %target, "participant kicked");
        self.close_answering_if_complete().await
    }

    async fn toggle_lock(&mut self) -> Result<Flow, ServiceError> {
        self.locked = !self.locked;
        self.state
            .hub()
            .set_locked(self.session.id, self.locked)
            .await
            .map_err(|err| ServiceError::InvalidState(err.to_string()))?;
        info!(session_id = %self.session.id, locked = self.locked, "session lock toggled");
        self.broadcast(ServerContent::LockToggled {
            locked: self.locked,
        })
        .await;
        Ok(Flow::Continue)
    }

    async fn end(&mut self, reason: EndReason, reply: Option<oneshot::Sender<()>>) -> Flow {
        self.countdown = None;
        match self.machine.plan(SessionEvent::End) {
            Ok(plan) => {
                if let Err(err) = self.machine.apply(plan.id) {
                    warn!(session_id = %self.session.id, error = %err, "failed to enter ENDING");
                }
            }
            Err(err) => debug!(session_id = %self.session.id, error = %err, "session already ending"),
        }
        self.persist_status().await;
        self.persist_marks().await;

        teardown(&self.state, self.session.id, &self.session.code, reason).await;

        if let Ok(plan) = self.machine.plan(SessionEvent::Finalize) {
            let _ = self.machine.apply(plan.id);
        }
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
        Flow::Stop
    }

    /// Refresh the cached snapshot and record the status change in the store.
    async fn persist_status(&self) {
        let phase = self.machine.phase();
        let deadline = self.state.config().timings.io_deadline;
        let cache = self.state.cache();
        let code = self.session.code.clone();
        let snapshot = self.cache_snapshot();

        match with_cache_deadline("update", deadline, cache.update(code.clone(), snapshot.clone()))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(session_id = %self.session.id, %code, "snapshot missing from cache; seeding again");
                let ttl = self.state.config().timings.cache_ttl;
                if let Err(err) =
                    with_cache_deadline("put", deadline, cache.put(code, snapshot, ttl)).await
                {
                    warn!(session_id = %self.session.id, error = %err, "failed to cache session snapshot");
                }
            }
            Err(err) => {
                warn!(session_id = %self.session.id, error = %err, "failed to refresh session snapshot");
            }
        }

        let Some(store) = self.state.session_store().await else {
            warn!(session_id = %self.session.id, status = phase.status().as_str(), "store unavailable; status not persisted");
            return;
        };
        if let Err(err) = with_deadline(
            "update_session_status",
            deadline,
            store.update_session_status(self.session.id, phase.status(), phase.order()),
        )
        .await
        {
            warn!(session_id = %self.session.id, error = %err, "failed to persist session status");
        }
    }

    async fn persist_marks(&self) {
        let Some(store) = self.state.session_store().await else {
            return;
        };
        let deadline = self.state.config().timings.io_deadline;
        let writes = self.roster.values().filter_map(|member| {
            let participant_id = member.participant_id?;
            Some(with_deadline(
                "update_participant_marks",
                deadline,
                store.update_participant_marks(participant_id, member.marks),
            ))
        });
        for result in join_all(writes).await {
            if let Err(err) = result {
                warn!(session_id = %self.session.id, error = %err, "failed to persist participant marks");
            }
        }
    }

    fn spawn_status_write(&self, user_id: &str, status: ParticipantStatus) {
        let user_id = user_id.to_owned();
        let session_id = self.session.id;
        self.spawn_store_write("update_participant_status", move |store| {
            store
                .update_participant_status(user_id.clone(), session_id, status)
                .map_ok(|_| ())
                .boxed()
        });
    }

    /// Fire-and-forget store write, retried once with jitter and then dropped.
    fn spawn_store_write<F>(&self, operation: &'static str, write: F)
    where
        F: Fn(&dyn SessionStore) -> BoxFuture<'static, StorageResult<()>> + Send + Sync + 'static,
    {
        let state = self.state.clone();
        let session_id = self.session.id;
        let deadline = state.config().timings.io_deadline;
        tokio::spawn(async move {
            let Some(store) = state.session_store().await else {
                warn!(%session_id, operation, "store unavailable; write dropped");
                return;
            };
            let result = retry_once(RETRY_BASE_DELAY, || {
                with_deadline(operation, deadline, write(store.as_ref()))
            })
            .await;
            if let Err(err) = result {
                warn!(%session_id, operation, error = %err, "store write failed after retry; dropped");
            }
        });
    }

    async fn broadcast(&self, content: ServerContent) {
        if self
            .state
            .hub()
            .broadcast(self.session.id, content)
            .await
            .is_err()
        {
            warn!(session_id = %self.session.id, "hub stopped; broadcast dropped");
        }
    }

    async fn reply(&self, user_id: &str, content: ServerContent) {
        if self
            .state
            .hub()
            .send_to(self.session.id, user_id.to_owned(), content)
            .await
            .is_err()
        {
            warn!(session_id = %self.session.id, %user_id, "hub stopped; reply dropped");
        }
    }

    fn leaderboard(&self) -> Vec<LeaderboardEntry> {
        rank(
            self.roster
                .values()
                .filter(|member| member.status != ParticipantStatus::Kicked)
                .map(|member| Standing {
                    user_id: &member.profile.user_id,
                    name: &member.profile.name,
                    emoji: member.profile.emoji.as_deref(),
                    marks: member.marks,
                }),
            self.session.config.leaderboard.size,
        )
    }

    fn participants(&self) -> Vec<ParticipantView> {
        let mut members: Vec<&Member> = self.roster.values().collect();
        members.sort_by(|a, b| ranking_order(a.marks, &a.profile.name, b.marks, &b.profile.name));
        members
            .into_iter()
            .map(|member| ParticipantView {
                user_id: Some(member.profile.user_id.clone()),
                name: member.profile.name.clone(),
                emoji: member.profile.emoji.clone(),
                color: member.profile.color.clone(),
                marks: member.marks,
                status: member.status,
                connected: member.connected,
            })
            .collect()
    }

    fn session_state(&self, user_id: &str) -> ServerContent {
        ServerContent::SessionState {
            session_id: self.session.id,
            code: self.session.code.clone(),
            status: self.machine.phase().status(),
            current_question: self.current_order,
            question_count: self.machine.question_count(),
            locked: self.locked,
            marks: self.roster.get(user_id).map(|member| member.marks),
        }
    }

    fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            status: self.machine.phase().status(),
            current_question: self.current_order,
            question_count: self.machine.question_count(),
            locked: self.locked,
        }
    }

    fn cache_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session.id,
            quiz_id: self.session.quiz_id,
            question_count: self.machine.question_count(),
            current_question: self.current_order,
            status: self.machine.phase().status(),
            config: self.session.config.clone(),
        }
    }
}
