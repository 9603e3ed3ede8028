//! Single task multiplexing every live session and its connected clients.
//!
//! The hub owns the session and client maps exclusively. It never awaits a
//! send: client outboxes and controller inboxes are fed with `try_send`, and a
//! client whose outbox is full or closed is evicted once the fan-out is done.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dto::ws::{Content, Envelope, ServerContent},
    state::session::{ClientProfile, ClientRole, ControllerCommand, EndReason},
};

/// Serialized outbound frame, shared by every recipient of a broadcast.
pub type Frame = Arc<str>;
/// Sending half of a client's bounded outbox.
pub type Outbox = mpsc::Sender<Frame>;

const CONTROL_CAPACITY: usize = 256;
const REGISTER_CAPACITY: usize = 64;
const UNREGISTER_CAPACITY: usize = 256;
const DELIVERY_CAPACITY: usize = 1024;

/// Everything the hub needs to admit a connection.
#[derive(Debug)]
pub struct Registration {
    pub session_id: Uuid,
    pub connection_id: Uuid,
    pub profile: ClientProfile,
    pub role: ClientRole,
    /// Whether frames from this connection may use host commands.
    pub is_host: bool,
    pub participant_id: Option<Uuid>,
    pub marks: f64,
    /// The user already belongs to the session, so a lock does not apply.
    pub returning: bool,
    pub outbox: Outbox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Joined,
    /// An older connection with the same key was evicted.
    Replaced,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegisterError {
    #[error("no live session `{0}`")]
    UnknownSession(Uuid),
    #[error("session `{0}` is locked")]
    Locked(Uuid),
    /// The controller inbox is full; the client may retry.
    #[error("session `{0}` is busy")]
    Busy(Uuid),
    #[error("hub is not running")]
    HubClosed,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("hub is not running")]
pub struct HubClosed;

/// Connected member of a session as seen by the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub user_id: String,
    pub name: String,
    pub role: ClientRole,
    pub connection_id: Uuid,
}

enum Control {
    Open {
        session_id: Uuid,
        code: String,
        controller: mpsc::Sender<ControllerCommand>,
        ack: oneshot::Sender<()>,
    },
    Inbound {
        session_id: Uuid,
        user_id: String,
        connection_id: Uuid,
        content: Content,
    },
    Members {
        session_id: Uuid,
        reply: oneshot::Sender<Option<Vec<MemberInfo>>>,
    },
    IsLocked {
        session_id: Uuid,
        reply: oneshot::Sender<Option<bool>>,
    },
}

struct RegisterRequest {
    registration: Registration,
    ack: oneshot::Sender<Result<RegisterOutcome, RegisterError>>,
}

struct UnregisterRequest {
    session_id: Uuid,
    user_id: String,
    connection_id: Uuid,
}

/// Controller-issued work. A single FIFO keeps broadcasts ordered with closes and kicks.
enum Delivery {
    Broadcast {
        session_id: Uuid,
        content: ServerContent,
    },
    Direct {
        session_id: Uuid,
        user_id: String,
        content: ServerContent,
    },
    Kick {
        session_id: Uuid,
        user_id: String,
        notice: Option<ServerContent>,
    },
    SetLocked {
        session_id: Uuid,
        locked: bool,
        ack: oneshot::Sender<()>,
    },
    Close {
        session_id: Uuid,
        farewell: Option<ServerContent>,
        ack: Option<oneshot::Sender<()>>,
    },
}

/// Cloneable handle used by the rest of the application to talk to the hub task.
#[derive(Clone)]
pub struct HubHandle {
    control: mpsc::Sender<Control>,
    register: mpsc::Sender<RegisterRequest>,
    unregister: mpsc::Sender<UnregisterRequest>,
    deliveries: mpsc::Sender<Delivery>,
}

impl HubHandle {
    /// Spawn the hub task.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (register_tx, register_rx) = mpsc::channel(REGISTER_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(UNREGISTER_CAPACITY);
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_CAPACITY);

        let hub = Hub::default();
        let task = tokio::spawn(hub.run(control_rx, register_rx, unregister_rx, delivery_rx));

        (
            Self {
                control: control_tx,
                register: register_tx,
                unregister: unregister_tx,
                deliveries: delivery_tx,
            },
            task,
        )
    }

    /// Make a session known to the hub; returns once clients can register.
    pub async fn open_session(
        &self,
        session_id: Uuid,
        code: String,
        controller: mpsc::Sender<ControllerCommand>,
    ) -> Result<(), HubClosed> {
        let (ack, done) = oneshot::channel();
        self.control
            .send(Control::Open {
                session_id,
                code,
                controller,
                ack,
            })
            .await
            .map_err(|_| HubClosed)?;
        done.await.map_err(|_| HubClosed)
    }

    /// Send an optional farewell, close every outbox and forget the session.
    /// Resolves once the hub has processed the close.
    pub async fn close_session(
        &self,
        session_id: Uuid,
        farewell: Option<ServerContent>,
    ) -> Result<(), HubClosed> {
        let (ack, done) = oneshot::channel();
        self.deliveries
            .send(Delivery::Close {
                session_id,
                farewell,
                ack: Some(ack),
            })
            .await
            .map_err(|_| HubClosed)?;
        done.await.map_err(|_| HubClosed)
    }

    pub async fn register(
        &self,
        registration: Registration,
    ) -> Result<RegisterOutcome, RegisterError> {
        let (ack, done) = oneshot::channel();
        self.register
            .send(RegisterRequest { registration, ack })
            .await
            .map_err(|_| RegisterError::HubClosed)?;
        done.await.map_err(|_| RegisterError::HubClosed)?
    }

    pub async fn unregister(&self, session_id: Uuid, user_id: String, connection_id: Uuid) {
        let request = UnregisterRequest {
            session_id,
            user_id,
            connection_id,
        };
        if self.unregister.send(request).await.is_err() {
            debug!(%session_id, "hub stopped before unregister");
        }
    }

    /// Route a decoded client frame to the session controller.
    pub async fn inbound(
        &self,
        session_id: Uuid,
        user_id: String,
        connection_id: Uuid,
        content: Content,
    ) -> Result<(), HubClosed> {
        self.control
            .send(Control::Inbound {
                session_id,
                user_id,
                connection_id,
                content,
            })
            .await
            .map_err(|_| HubClosed)
    }

    pub async fn broadcast(&self, session_id: Uuid, content: ServerContent) -> Result<(), HubClosed> {
        self.deliver(Delivery::Broadcast {
            session_id,
            content,
        })
        .await
    }

    pub async fn send_to(
        &self,
        session_id: Uuid,
        user_id: String,
        content: ServerContent,
    ) -> Result<(), HubClosed> {
        self.deliver(Delivery::Direct {
            session_id,
            user_id,
            content,
        })
        .await
    }

    /// Deliver `notice` to the user, then disconnect them and announce `LEFT_LQS`.
    pub async fn kick(
        &self,
        session_id: Uuid,
        user_id: String,
        notice: ServerContent,
    ) -> Result<(), HubClosed> {
        self.deliver(Delivery::Kick {
            session_id,
            user_id,
            notice: Some(notice),
        })
        .await
    }

    /// Close the user's connection and announce `LEFT_LQS`, without a notice.
    pub async fn disconnect(&self, session_id: Uuid, user_id: String) -> Result<(), HubClosed> {
        self.deliver(Delivery::Kick {
            session_id,
            user_id,
            notice: None,
        })
        .await
    }

    /// Resolves once the hub applies the lock, so later registrations observe it.
    pub async fn set_locked(&self, session_id: Uuid, locked: bool) -> Result<(), HubClosed> {
        let (ack, done) = oneshot::channel();
        self.deliver(Delivery::SetLocked {
            session_id,
            locked,
            ack,
        })
        .await?;
        done.await.map_err(|_| HubClosed)
    }

    /// Connected members of a session, `None` when the hub does not know it.
    pub async fn members(&self, session_id: Uuid) -> Result<Option<Vec<MemberInfo>>, HubClosed> {
        let (reply, answer) = oneshot::channel();
        self.control
            .send(Control::Members { session_id, reply })
            .await
            .map_err(|_| HubClosed)?;
        answer.await.map_err(|_| HubClosed)
    }

    pub async fn is_locked(&self, session_id: Uuid) -> Result<Option<bool>, HubClosed> {
        let (reply, answer) = oneshot::channel();
        self.control
            .send(Control::IsLocked { session_id, reply })
            .await
            .map_err(|_| HubClosed)?;
        answer.await.map_err(|_| HubClosed)
    }

    async fn deliver(&self, delivery: Delivery) -> Result<(), HubClosed> {
        self.deliveries.send(delivery).await.map_err(|_| HubClosed)
    }
}

struct Client {
    connection_id: Uuid,
    profile: ClientProfile,
    role: ClientRole,
    is_host: bool,
    outbox: Outbox,
}

struct HubSession {
    code: String,
    locked: bool,
    controller: mpsc::Sender<ControllerCommand>,
    clients: HashMap<String, Client>,
}

/// Outcome of handing a command to a controller.
enum Notify {
    Delivered,
    Dropped,
    ControllerGone,
}

impl HubSession {
    fn notify(&self, command: ControllerCommand) -> Notify {
        match self.controller.try_send(command) {
            Ok(()) => Notify::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => Notify::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => Notify::ControllerGone,
        }
    }
}

fn encode(session_id: Uuid, content: &ServerContent, origin: &str) -> Option<Frame> {
    let envelope = Envelope {
        content,
        live_quiz_session_id: session_id,
        uid: origin.to_owned(),
    };
    match serde_json::to_string(&envelope) {
        Ok(text) => Some(Frame::from(text)),
        Err(err) => {
            warn!(%session_id, error = %err, "failed to serialize outbound frame");
            None
        }
    }
}

fn left_notice(client: &Client) -> Option<(ServerContent, String)> {
    (client.role != ClientRole::Moderator).then(|| {
        (
            ServerContent::LeftLqs {
                user_id: client.profile.user_id.clone(),
                name: client.profile.name.clone(),
            },
            client.profile.user_id.clone(),
        )
    })
}

#[derive(Default)]
struct Hub {
    sessions: HashMap<Uuid, HubSession>,
}

impl Hub {
    async fn run(
        mut self,
        mut control: mpsc::Receiver<Control>,
        mut register: mpsc::Receiver<RegisterRequest>,
        mut unregister: mpsc::Receiver<UnregisterRequest>,
        mut deliveries: mpsc::Receiver<Delivery>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(message) = control.recv() => self.handle_control(message),
                Some(request) = register.recv() => {
                    let outcome = self.register(request.registration);
                    let _ = request.ack.send(outcome);
                }
                Some(request) = unregister.recv() => self.unregister(request),
                Some(delivery) = deliveries.recv() => self.handle_delivery(delivery),
                else => break,
            }
        }
        info!("hub stopped");
    }

    fn handle_control(&mut self, message: Control) {
        match message {
            Control::Open {
                session_id,
                code,
                controller,
                ack,
            } => {
                info!(%session_id, %code, "session opened in hub");
                self.sessions.insert(
                    session_id,
                    HubSession {
                        code,
                        locked: false,
                        controller,
                        clients: HashMap::new(),
                    },
                );
                let _ = ack.send(());
            }
            Control::Inbound {
                session_id,
                user_id,
                connection_id,
                content,
            } => self.route_inbound(session_id, user_id, connection_id, content),
            Control::Members { session_id, reply } => {
                let members = self.sessions.get(&session_id).map(|session| {
                    session
                        .clients
                        .values()
                        .map(|client| MemberInfo {
                            user_id: client.profile.user_id.clone(),
                            name: client.profile.name.clone(),
                            role: client.role,
                            connection_id: client.connection_id,
                        })
                        .collect()
                });
                let _ = reply.send(members);
            }
            Control::IsLocked { session_id, reply } => {
                let _ = reply.send(self.sessions.get(&session_id).map(|s| s.locked));
            }
        }
    }

    fn handle_delivery(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Broadcast {
                session_id,
                content,
            } => self.broadcast(session_id, content, String::new()),
            Delivery::Direct {
                session_id,
                user_id,
                content,
            } => self.direct(session_id, &user_id, &content),
            Delivery::Kick {
                session_id,
                user_id,
                notice,
            } => self.kick(session_id, &user_id, notice.as_ref()),
            Delivery::SetLocked {
                session_id,
                locked,
                ack,
            } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.locked = locked;
                }
                let _ = ack.send(());
            }
            Delivery::Close {
                session_id,
                farewell,
                ack,
            } => {
                self.close(session_id, farewell);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
        }
    }

    fn register(&mut self, registration: Registration) -> Result<RegisterOutcome, RegisterError> {
        let session_id = registration.session_id;
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(RegisterError::UnknownSession(session_id))?;

        let user_id = registration.profile.user_id.clone();
        let present = session.clients.contains_key(&user_id);
        if session.locked
            && registration.role == ClientRole::Participant
            && !registration.returning
            && !present
        {
            return Err(RegisterError::Locked(session_id));
        }

        // Reserve the controller slot first: a participant missing from the
        // roster could never answer.
        let permit = if registration.role == ClientRole::Moderator {
            None
        } else {
            match session.controller.clone().try_reserve_owned() {
                Ok(permit) => Some(permit),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%session_id, %user_id, "controller inbox full; registration refused");
                    return Err(RegisterError::Busy(session_id));
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.fail_session(session_id);
                    return Err(RegisterError::UnknownSession(session_id));
                }
            }
        };

        // The evicted client's outbox is dropped here, which stops its writer.
        let outcome = match session.clients.remove(&user_id) {
            Some(previous) => {
                debug!(%session_id, %user_id, old_connection = %previous.connection_id, "replacing connection");
                RegisterOutcome::Replaced
            }
            None => RegisterOutcome::Joined,
        };

        let client = Client {
            connection_id: registration.connection_id,
            profile: registration.profile.clone(),
            role: registration.role,
            is_host: registration.is_host,
            outbox: registration.outbox,
        };
        session.clients.insert(user_id.clone(), client);
        info!(%session_id, %user_id, role = ?registration.role, ?outcome, "client registered");

        let Some(permit) = permit else {
            return Ok(outcome);
        };
        permit.send(ControllerCommand::ClientJoined {
            profile: registration.profile.clone(),
            role: registration.role,
            participant_id: registration.participant_id,
            marks: registration.marks,
        });

        let profile = registration.profile;
        self.broadcast(
            session_id,
            ServerContent::JoinedLqs {
                user_id: profile.user_id.clone(),
                name: profile.name,
                emoji: profile.emoji,
                color: profile.color,
                is_host: registration.role == ClientRole::Host,
            },
            profile.user_id,
        );
        Ok(outcome)
    }

    fn unregister(&mut self, request: UnregisterRequest) {
        let UnregisterRequest {
            session_id,
            user_id,
            connection_id,
        } = request;
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        let current = session
            .clients
            .get(&user_id)
            .is_some_and(|client| client.connection_id == connection_id);
        if !current {
            debug!(%session_id, %user_id, %connection_id, "ignoring stale unregister");
            return;
        }

        self.evict_and_announce(session_id, vec![user_id]);
    }

    /// Remove clients, tell the controller and broadcast `LEFT_LQS` for each,
    /// cascading to any client that cannot take the announcement.
    fn evict_and_announce(&mut self, session_id: Uuid, user_ids: Vec<String>) {
        let mut queue: VecDeque<(ServerContent, String)> = VecDeque::new();
        let mut controller_gone = false;

        if let Some(session) = self.sessions.get_mut(&session_id) {
            for user_id in user_ids {
                let Some(client) = session.clients.remove(&user_id) else {
                    continue;
                };
                info!(%session_id, %user_id, "client removed");
                if let Some(notice) = left_notice(&client) {
                    controller_gone |= matches!(
                        session.notify(ControllerCommand::ClientLeft {
                            user_id: user_id.clone()
                        }),
                        Notify::ControllerGone
                    );
                    queue.push_back(notice);
                }
            }
        }

        if controller_gone {
            self.fail_session(session_id);
            return;
        }
        self.drain(session_id, queue);
    }

    fn broadcast(&mut self, session_id: Uuid, content: ServerContent, origin: String) {
        self.drain(session_id, VecDeque::from([(content, origin)]));
    }

    /// Fan out queued frames; failed recipients are evicted after each fan-out and
    /// their `LEFT_LQS` is queued behind.
    fn drain(&mut self, session_id: Uuid, mut queue: VecDeque<(ServerContent, String)>) {
        let mut controller_gone = false;

        while let Some((content, origin)) = queue.pop_front() {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            let Some(frame) = encode(session_id, &content, &origin) else {
                continue;
            };

            let failed: Vec<String> = session
                .clients
                .iter()
                .filter_map(|(user_id, client)| {
                    client
                        .outbox
                        .try_send(frame.clone())
                        .err()
                        .map(|_| user_id.clone())
                })
                .collect();

            for user_id in failed {
                let Some(client) = session.clients.remove(&user_id) else {
                    continue;
                };
                warn!(%session_id, %user_id, "outbox full or closed; evicting client");
                if let Some(notice) = left_notice(&client) {
                    controller_gone |= matches!(
                        session.notify(ControllerCommand::ClientLeft { user_id }),
                        Notify::ControllerGone
                    );
                    queue.push_back(notice);
                }
            }
        }

        if controller_gone {
            self.fail_session(session_id);
        }
    }

    fn direct(&mut self, session_id: Uuid, user_id: &str, content: &ServerContent) {
        let Some(session) = self.sessions.get(&session_id) else {
            return;
        };
        let Some(client) = session.clients.get(user_id) else {
            debug!(%session_id, %user_id, "direct frame for absent client dropped");
            return;
        };
        let Some(frame) = encode(session_id, content, "") else {
            return;
        };
        if client.outbox.try_send(frame).is_err() {
            warn!(%session_id, %user_id, "outbox full or closed; evicting client");
            self.evict_and_announce(session_id, vec![user_id.to_owned()]);
        }
    }

    fn kick(&mut self, session_id: Uuid, user_id: &str, notice: Option<&ServerContent>) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        let Some(client) = session.clients.remove(user_id) else {
            return;
        };
        if let Some(frame) = notice.and_then(|notice| encode(session_id, notice, "")) {
            let _ = client.outbox.try_send(frame);
        }
        info!(%session_id, %user_id, "client disconnected by controller");
        if let Some(left) = left_notice(&client) {
            self.drain(session_id, VecDeque::from([left]));
        }
    }

    fn route_inbound(
        &mut self,
        session_id: Uuid,
        user_id: String,
        connection_id: Uuid,
        content: Content,
    ) {
        let Some(session) = self.sessions.get(&session_id) else {
            return;
        };
        let Some(client) = session
            .clients
            .get(&user_id)
            .filter(|client| client.connection_id == connection_id)
        else {
            debug!(%session_id, %user_id, "frame from unregistered connection dropped");
            return;
        };

        let is_host = client.is_host;
        match session.notify(ControllerCommand::Inbound {
            user_id: user_id.clone(),
            is_host,
            content,
        }) {
            Notify::Delivered => {}
            Notify::Dropped => {
                warn!(%session_id, %user_id, "controller inbox full; frame dropped");
                self.direct(
                    session_id,
                    &user_id,
                    &ServerContent::Error {
                        message: "session busy, retry".into(),
                    },
                );
            }
            Notify::ControllerGone => self.fail_session(session_id),
        }
    }

    fn close(&mut self, session_id: Uuid, farewell: Option<ServerContent>) {
        let Some(session) = self.sessions.remove(&session_id) else {
            return;
        };
        if let Some(frame) = farewell.and_then(|content| encode(session_id, &content, "")) {
            for client in session.clients.values() {
                let _ = client.outbox.try_send(frame.clone());
            }
        }
        info!(%session_id, code = %session.code, clients = session.clients.len(), "session closed in hub");
        // Dropping the clients closes every outbox.
    }

    /// The controller of an open session is gone: nothing can drive it anymore.
    fn fail_session(&mut self, session_id: Uuid) {
        warn!(%session_id, "session controller unreachable; closing session");
        self.close(
            session_id,
            Some(ServerContent::EndLqs {
                reason: EndReason::Internal.as_str().to_owned(),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;
    use tokio::time::timeout;

    use super::*;

    struct TestClient {
        user_id: String,
        connection_id: Uuid,
        rx: mpsc::Receiver<Frame>,
    }

    impl TestClient {
        async fn next(&mut self) -> Value {
            let frame = timeout(Duration::from_secs(1), self.rx.recv())
                .await
                .expect("frame in time")
                .expect("outbox open");
            serde_json::from_str(&frame).expect("valid json")
        }

        async fn next_type(&mut self) -> String {
            self.next().await["content"]["type"]
                .as_str()
                .unwrap_or_default()
                .to_owned()
        }

        fn is_closed_and_empty(&mut self) -> bool {
            matches!(
                self.rx.try_recv(),
                Err(mpsc::error::TryRecvError::Disconnected)
            )
        }
    }

    fn profile(user_id: &str) -> ClientProfile {
        ClientProfile {
            user_id: user_id.into(),
            name: format!("name-{user_id}"),
            emoji: None,
            color: None,
        }
    }

    async fn open(hub: &HubHandle) -> (Uuid, mpsc::Receiver<ControllerCommand>) {
        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(64);
        hub.open_session(session_id, "AB1234".into(), tx).await.unwrap();
        (session_id, rx)
    }

    async fn join(
        hub: &HubHandle,
        session_id: Uuid,
        user_id: &str,
        role: ClientRole,
        capacity: usize,
    ) -> Result<(TestClient, RegisterOutcome), RegisterError> {
        let (outbox, rx) = mpsc::channel(capacity);
        let connection_id = Uuid::new_v4();
        let outcome = hub
            .register(Registration {
                session_id,
                connection_id,
                profile: profile(user_id),
                role,
                is_host: role == ClientRole::Host,
                participant_id: None,
                marks: 0.0,
                returning: false,
                outbox,
            })
            .await?;
        Ok((
            TestClient {
                user_id: user_id.into(),
                connection_id,
                rx,
            },
            outcome,
        ))
    }

    #[tokio::test]
    async fn join_is_announced_to_everyone_including_the_joiner() {
        let (hub, _task) = HubHandle::spawn();
        let (session_id, mut controller) = open(&hub).await;

        let (mut host, _) = join(&hub, session_id, "host", ClientRole::Host, 10).await.unwrap();
        let joined = host.next().await;
        assert_eq!(joined["content"]["type"], "JOINED_LQS");
        assert_eq!(joined["uid"], "host");
        assert_eq!(joined["live_quiz_session_id"], session_id.to_string());

        let (mut alice, _) = join(&hub, session_id, "alice", ClientRole::Participant, 10)
            .await
            .unwrap();
        assert_eq!(alice.next_type().await, "JOINED_LQS");
        assert_eq!(host.next_type().await, "JOINED_LQS");

        assert!(matches!(
            controller.recv().await,
            Some(ControllerCommand::ClientJoined { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_session_is_refused() {
        let (hub, _task) = HubHandle::spawn();
        let session_id = Uuid::new_v4();
        let err = join(&hub, session_id, "alice", ClientRole::Participant, 10)
            .await
            .err()
            .expect("refused");
        assert_eq!(err, RegisterError::UnknownSession(session_id));
    }

    #[tokio::test]
    async fn locked_session_refuses_new_participants_only() {
        let (hub, _task) = HubHandle::spawn();
        let (session_id, _controller) = open(&hub).await;
        hub.set_locked(session_id, true).await.unwrap();
        assert_eq!(hub.is_locked(session_id).await.unwrap(), Some(true));

        let err = join(&hub, session_id, "late", ClientRole::Participant, 10)
            .await
            .err()
            .expect("refused");
        assert_eq!(err, RegisterError::Locked(session_id));
        assert!(join(&hub, session_id, "host", ClientRole::Host, 10).await.is_ok());

        hub.set_locked(session_id, false).await.unwrap();
        assert!(join(&hub, session_id, "late", ClientRole::Participant, 10).await.is_ok());
    }

    #[tokio::test]
    async fn full_controller_inbox_refuses_participants() {
        let (hub, _task) = HubHandle::spawn();
        let session_id = Uuid::new_v4();
        let (tx, mut controller) = mpsc::channel(1);
        hub.open_session(session_id, "AB1234".into(), tx).await.unwrap();

        let (mut alice, _) = join(&hub, session_id, "alice", ClientRole::Participant, 10)
            .await
            .unwrap();
        alice.next().await;

        let err = join(&hub, session_id, "bob", ClientRole::Participant, 10)
            .await
            .err()
            .expect("refused");
        assert_eq!(err, RegisterError::Busy(session_id));
        let members = hub.members(session_id).await.unwrap().expect("open session");
        assert_eq!(members.len(), 1);
        assert!(alice.rx.try_recv().is_err());

        assert!(matches!(
            controller.recv().await,
            Some(ControllerCommand::ClientJoined { .. })
        ));
        assert!(join(&hub, session_id, "bob", ClientRole::Participant, 10).await.is_ok());
        assert!(matches!(
            controller.recv().await,
            Some(ControllerCommand::ClientJoined { profile, .. }) if profile.user_id == "bob"
        ));
    }

    #[tokio::test]
    async fn reconnect_evicts_silently_and_announces_once() {
        let (hub, _task) = HubHandle::spawn();
        let (session_id, _controller) = open(&hub).await;

        let (mut watcher, _) = join(&hub, session_id, "watcher", ClientRole::Participant, 10)
            .await
            .unwrap();
        watcher.next().await;

        let (mut first, _) = join(&hub, session_id, "host", ClientRole::Host, 10).await.unwrap();
        first.next().await;
        assert_eq!(watcher.next_type().await, "JOINED_LQS");

        let (mut second, outcome) =
            join(&hub, session_id, "host", ClientRole::Host, 10).await.unwrap();
        assert_eq!(outcome, RegisterOutcome::Replaced);
        assert_eq!(second.next_type().await, "JOINED_LQS");
        assert_eq!(watcher.next_type().await, "JOINED_LQS");

        // Old connection closed without a LEFT_LQS; its late unregister is ignored.
        assert!(first.is_closed_and_empty());
        hub.unregister(session_id, first.user_id.clone(), first.connection_id)
            .await;
        let members = hub.members(session_id).await.unwrap().expect("open session");
        assert_eq!(members.len(), 2);
        assert!(watcher.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_outbox_is_evicted_after_fan_out() {
        let (hub, _task) = HubHandle::spawn();
        let (session_id, mut controller) = open(&hub).await;

        let (mut healthy, _) = join(&hub, session_id, "healthy", ClientRole::Participant, 64)
            .await
            .unwrap();
        // Capacity 10, filled by its own JOINED_LQS plus nine broadcasts below.
        let (mut slow, _) = join(&hub, session_id, "slow", ClientRole::Participant, 10)
            .await
            .unwrap();
        for _ in 0..9 {
            hub.broadcast(
                session_id,
                ServerContent::LockToggled { locked: false },
            )
            .await
            .unwrap();
        }
        hub.broadcast(session_id, ServerContent::LockToggled { locked: true })
            .await
            .unwrap();

        // healthy: own join, slow's join, ten broadcasts, then LEFT_LQS for slow.
        let mut types = Vec::new();
        for _ in 0..13 {
            types.push(healthy.next_type().await);
        }
        assert_eq!(types.last().map(String::as_str), Some("LEFT_LQS"));
        assert_eq!(types.iter().filter(|t| *t == "LOCK_TOGGLED").count(), 10);

        let mut received = 0;
        while slow.rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 10);
        assert!(slow.is_closed_and_empty());

        let mut left = false;
        while let Ok(command) = controller.try_recv() {
            if let ControllerCommand::ClientLeft { user_id } = command {
                left |= user_id == "slow";
            }
        }
        assert!(left);
    }

    #[tokio::test]
    async fn nothing_is_delivered_after_close() {
        let (hub, _task) = HubHandle::spawn();
        let (session_id, _controller) = open(&hub).await;
        let (mut alice, _) = join(&hub, session_id, "alice", ClientRole::Participant, 10)
            .await
            .unwrap();
        alice.next().await;

        hub.close_session(
            session_id,
            Some(ServerContent::EndLqs {
                reason: "host_ended".into(),
            }),
        )
        .await
        .unwrap();
        hub.broadcast(session_id, ServerContent::LockToggled { locked: true })
            .await
            .unwrap();

        let end = alice.next().await;
        assert_eq!(end["content"]["payload"]["reason"], "host_ended");
        assert!(alice.is_closed_and_empty());
        assert_eq!(hub.members(session_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn inbound_frames_are_tagged_with_host_flag() {
        let (hub, _task) = HubHandle::spawn();
        let (session_id, mut controller) = open(&hub).await;
        let (host, _) = join(&hub, session_id, "host", ClientRole::Host, 10).await.unwrap();
        let _ = controller.recv().await;

        hub.inbound(session_id, "host".into(), host.connection_id, Content::StartLqs)
            .await
            .unwrap();
        match controller.recv().await {
            Some(ControllerCommand::Inbound {
                user_id,
                is_host,
                content,
            }) => {
                assert_eq!(user_id, "host");
                assert!(is_host);
                assert_eq!(content, Content::StartLqs);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn vanished_controller_closes_the_session() {
        let (hub, _task) = HubHandle::spawn();
        let (session_id, controller) = open(&hub).await;
        let (mut alice, _) = join(&hub, session_id, "alice", ClientRole::Participant, 10)
            .await
            .unwrap();
        alice.next().await;
        drop(controller);

        hub.inbound(
            session_id,
            "alice".into(),
            alice.connection_id,
            Content::GetLeaderboard,
        )
        .await
        .unwrap();

        let end = alice.next().await;
        assert_eq!(end["content"]["type"], "END_LQS");
        assert_eq!(end["content"]["payload"]["reason"], "internal");
        assert!(alice.is_closed_and_empty());
    }

    #[tokio::test]
    async fn kick_sends_notice_then_announces_departure() {
        let (hub, _task) = HubHandle::spawn();
        let (session_id, _controller) = open(&hub).await;
        let (mut host, _) = join(&hub, session_id, "host", ClientRole::Host, 10).await.unwrap();
        host.next().await;
        let (mut bob, _) = join(&hub, session_id, "bob", ClientRole::Participant, 10)
            .await
            .unwrap();
        bob.next().await;
        host.next().await;

        hub.kick(
            session_id,
            "bob".into(),
            ServerContent::Kicked {
                reason: "kicked by host".into(),
            },
        )
        .await
        .unwrap();

        assert_eq!(bob.next_type().await, "KICKED");
        assert!(bob.is_closed_and_empty());
        assert_eq!(host.next_type().await, "LEFT_LQS");
    }
}
