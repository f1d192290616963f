use std::{
    collections::BTreeMap,
    fmt, io,
    ops::ControlFlow,
    panic::{self, AssertUnwindSafe},
    time::Duration,
};

use serde_json::Value;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{mpsc, oneshot, watch},
    task::{JoinError, JoinHandle},
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{
    codec::{FrameDecoder, write_frame},
    message::{Ack, Event, PRESENCE_TOPIC, PresenceUpdate, Request, ServerToClient},
};

const READ_CHUNK_SIZE: usize = 4096;
const COMMAND_QUEUE: usize = 64;

pub type TopicCallback = Box<dyn FnMut(&Value, Option<&str>) -> anyhow::Result<()> + Send>;
pub type MessageFilter = Box<dyn Fn(&Value) -> bool + Send>;
pub type DirectMessageHandler = Box<dyn FnMut(&Value, Option<&str>) -> anyhow::Result<()> + Send>;
pub type PresenceHandler = Box<dyn FnMut(&PresenceUpdate) -> anyhow::Result<()> + Send>;
pub type ErrorHandler = Box<dyn FnMut(&str) -> anyhow::Result<()> + Send>;
pub type AckHandler = Box<dyn FnMut(&Ack) -> anyhow::Result<()> + Send>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to connect to {addr} after {attempts} attempt(s)")]
    Connect {
        addr: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("connection to broker lost, gave up after {attempts} reconnect attempt(s)")]
    ConnectionLost { attempts: u32 },
    #[error("failed to send request to broker")]
    Transmit(#[source] io::Error),
    #[error("session is closed")]
    Closed,
    #[error("session task failed")]
    Task(#[from] JoinError),
}

/// Bounded retry with exponential backoff, shared by the initial connect and
/// every reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Number of connection attempts, never less than one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Pause after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Registered,
    Reconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Registered => "registered",
            SessionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

struct Subscription {
    filter: Option<MessageFilter>,
    callback: Option<TopicCallback>,
}

#[derive(Default)]
struct Handlers {
    direct: Option<DirectMessageHandler>,
    presence: Option<PresenceHandler>,
    error: Option<ErrorHandler>,
    ack: Option<AckHandler>,
}

type Reply = oneshot::Sender<Result<(), SessionError>>;

enum Command {
    Subscribe {
        topic: String,
        subscription: Subscription,
        respond_to: Reply,
    },
    Send {
        request: Request,
        respond_to: Reply,
    },
    Close {
        respond_to: oneshot::Sender<()>,
    },
}

pub struct SessionBuilder {
    service: String,
    addr: String,
    policy: ReconnectPolicy,
    handlers: Handlers,
}

impl SessionBuilder {
    pub fn new(service: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            addr: addr.into(),
            policy: ReconnectPolicy::default(),
            handlers: Handlers::default(),
        }
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn on_direct_message<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&Value, Option<&str>) -> anyhow::Result<()> + Send + 'static,
    {
        self.handlers.direct = Some(Box::new(handler));
        self
    }

    pub fn on_presence<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&PresenceUpdate) -> anyhow::Result<()> + Send + 'static,
    {
        self.handlers.presence = Some(Box::new(handler));
        self
    }

    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&str) -> anyhow::Result<()> + Send + 'static,
    {
        self.handlers.error = Some(Box::new(handler));
        self
    }

    pub fn on_ack<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&Ack) -> anyhow::Result<()> + Send + 'static,
    {
        self.handlers.ack = Some(Box::new(handler));
        self
    }

    /// Connects, sends `register`, and starts the receive loop. The broker's
    /// acknowledgment is not awaited.
    pub async fn connect(self) -> Result<Session, SessionError> {
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);

        let stream = match connect_with_retry(&self.addr, &self.policy).await {
            Ok(stream) => stream,
            Err(error) => {
                state_tx.send_replace(SessionState::Disconnected);
                return Err(error);
            }
        };
        state_tx.send_replace(SessionState::Connected);
        info!(addr = %self.addr, service = %self.service, "connected to broker");

        let (reader, mut writer) = stream.into_split();
        let register = Request::Register {
            service: self.service.clone(),
        };
        if let Err(error) = write_frame(&mut writer, &register).await {
            state_tx.send_replace(SessionState::Disconnected);
            return Err(SessionError::Transmit(error));
        }
        state_tx.send_replace(SessionState::Registered);

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let worker = SessionWorker {
            service: self.service,
            addr: self.addr,
            policy: self.policy,
            reader,
            writer,
            decoder: FrameDecoder::new(),
            subscriptions: BTreeMap::new(),
            handlers: self.handlers,
            state: state_tx,
        };
        let task = tokio::spawn(worker.run(commands_rx));

        Ok(Session {
            commands: commands_tx,
            state: state_rx,
            task,
        })
    }
}

/// Handle to a connected service. The connection itself is owned by a
/// background task; calls on the handle are queued to it.
pub struct Session {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<Result<(), SessionError>>,
}

impl Session {
    pub fn builder(service: impl Into<String>, addr: impl Into<String>) -> SessionBuilder {
        SessionBuilder::new(service, addr)
    }

    /// Connects with default policy and logging-only handlers.
    pub async fn connect(
        service: impl Into<String>,
        addr: impl Into<String>,
    ) -> Result<Self, SessionError> {
        SessionBuilder::new(service, addr).connect().await
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Subscribes to `topic`, replacing any callback recorded for it before.
    pub async fn subscribe<F>(
        &self,
        topic: impl Into<String>,
        callback: F,
    ) -> Result<(), SessionError>
    where
        F: FnMut(&Value, Option<&str>) -> anyhow::Result<()> + Send + 'static,
    {
        self.subscribe_with(
            topic.into(),
            Subscription {
                filter: None,
                callback: Some(Box::new(callback)),
            },
        )
        .await
    }

    /// Like [`Session::subscribe`], but messages for which `filter` returns
    /// `false` never reach `callback`.
    pub async fn subscribe_filtered<P, F>(
        &self,
        topic: impl Into<String>,
        filter: P,
        callback: F,
    ) -> Result<(), SessionError>
    where
        P: Fn(&Value) -> bool + Send + 'static,
        F: FnMut(&Value, Option<&str>) -> anyhow::Result<()> + Send + 'static,
    {
        self.subscribe_with(
            topic.into(),
            Subscription {
                filter: Some(Box::new(filter)),
                callback: Some(Box::new(callback)),
            },
        )
        .await
    }

    /// Subscribes to roster updates; they arrive through the presence handler.
    pub async fn subscribe_presence(&self) -> Result<(), SessionError> {
        self.subscribe_with(
            PRESENCE_TOPIC.to_string(),
            Subscription {
                filter: None,
                callback: None,
            },
        )
        .await
    }

    async fn subscribe_with(
        &self,
        topic: String,
        subscription: Subscription,
    ) -> Result<(), SessionError> {
        self.call(|respond_to| Command::Subscribe {
            topic,
            subscription,
            respond_to,
        })
        .await
    }

    pub async fn publish(
        &self,
        topic: impl Into<String>,
        message: impl Into<Value>,
    ) -> Result<(), SessionError> {
        self.send(Request::Publish {
            topic: topic.into(),
            message: message.into(),
        })
        .await
    }

    pub async fn send_message(
        &self,
        to: impl Into<String>,
        message: impl Into<Value>,
    ) -> Result<(), SessionError> {
        self.send(Request::Message {
            to: to.into(),
            message: message.into(),
        })
        .await
    }

    async fn send(&self, request: Request) -> Result<(), SessionError> {
        self.call(|respond_to| Command::Send {
            request,
            respond_to,
        })
        .await
    }

    async fn call<F>(&self, command: F) -> Result<(), SessionError>
    where
        F: FnOnce(Reply) -> Command,
    {
        let (respond_to, response) = oneshot::channel();
        self.commands
            .send(command(respond_to))
            .await
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)?
    }

    /// Closes the connection and waits for the receive loop to finish.
    ///
    /// Returns [`SessionError::ConnectionLost`] if the session had already
    /// given up reconnecting.
    pub async fn close(self) -> Result<(), SessionError> {
        let Session { commands, task, .. } = self;

        let (respond_to, closed) = oneshot::channel();
        if commands.send(Command::Close { respond_to }).await.is_ok() {
            let _ = closed.await;
        }
        drop(commands);

        task.await?
    }
}

async fn connect_with_retry(
    addr: &str,
    policy: &ReconnectPolicy,
) -> Result<TcpStream, SessionError> {
    let attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                if let Err(error) = stream.set_nodelay(true) {
                    debug!(%error, "failed to set TCP_NODELAY");
                }
                return Ok(stream);
            }
            Err(source) if attempt >= attempts => {
                return Err(SessionError::Connect {
                    addr: addr.to_string(),
                    attempts,
                    source,
                });
            }
            Err(error) => {
                let delay = policy.delay_for(attempt);
                warn!(addr, attempt, attempts, ?delay, %error, "connect failed, retrying");
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

struct SessionWorker {
    service: String,
    addr: String,
    policy: ReconnectPolicy,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    decoder: FrameDecoder,
    subscriptions: BTreeMap<String, Subscription>,
    handlers: Handlers,
    state: watch::Sender<SessionState>,
}

impl SessionWorker {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) -> Result<(), SessionError> {
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];

        loop {
            select! {
                read = self.reader.read(&mut chunk) => match read {
                    Ok(0) => {
                        info!("broker closed the connection");
                        if self.reconnect(&mut commands).await?.is_break() {
                            return Ok(());
                        }
                    }
                    Ok(n) => self.dispatch_bytes(&chunk[..n]),
                    Err(error) => {
                        warn!(%error, "read from broker failed");
                        if self.reconnect(&mut commands).await?.is_break() {
                            return Ok(());
                        }
                    }
                },
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.shutdown().await;
                        return Ok(());
                    };
                    if self.handle_command(command).await.is_break() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Subscribe {
                topic,
                subscription,
                respond_to,
            } => {
                let request = Request::Subscribe {
                    topic: topic.clone(),
                };
                // Recorded even if the write fails; the next reconnect replays it.
                self.subscriptions.insert(topic, subscription);
                let _ = respond_to.send(self.transmit(&request).await);
            }
            Command::Send {
                request,
                respond_to,
            } => {
                let _ = respond_to.send(self.transmit(&request).await);
            }
            Command::Close { respond_to } => {
                self.shutdown().await;
                let _ = respond_to.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn transmit(&mut self, request: &Request) -> Result<(), SessionError> {
        write_frame(&mut self.writer, request)
            .await
            .map_err(SessionError::Transmit)
    }

    async fn shutdown(&mut self) {
        if let Err(error) = self.writer.shutdown().await {
            debug!(%error, "failed to shut down connection cleanly");
        }
        self.state.send_replace(SessionState::Disconnected);
        info!(service = %self.service, "session closed");
    }

    /// Reconnects and replays registration. `close()` (or dropping every
    /// handle) cancels the retry schedule; any other command arriving meanwhile
    /// is held back until the replay is on the wire.
    async fn reconnect(
        &mut self,
        commands: &mut mpsc::Receiver<Command>,
    ) -> Result<ControlFlow<()>, SessionError> {
        self.state.send_replace(SessionState::Reconnecting);
        self.decoder = FrameDecoder::new();

        let addr = self.addr.clone();
        let policy = self.policy;
        let connect = connect_with_retry(&addr, &policy);
        tokio::pin!(connect);
        let mut held = Vec::new();

        let connected = loop {
            select! {
                connected = &mut connect => break connected,
                command = commands.recv() => match command {
                    Some(Command::Close { respond_to }) => {
                        info!("close requested while reconnecting");
                        self.shutdown().await;
                        let _ = respond_to.send(());
                        return Ok(ControlFlow::Break(()));
                    }
                    Some(command) => held.push(command),
                    None => {
                        self.shutdown().await;
                        return Ok(ControlFlow::Break(()));
                    }
                },
            }
        };

        let stream = match connected {
            Ok(stream) => stream,
            Err(error) => {
                warn!(error = %error, "giving up on broker");
                self.state.send_replace(SessionState::Disconnected);
                self.report_error(&format!("connection to broker lost: {error}"));
                return Err(SessionError::ConnectionLost {
                    attempts: self.policy.attempts(),
                });
            }
        };
        self.state.send_replace(SessionState::Connected);

        let (reader, writer) = stream.into_split();
        self.reader = reader;
        self.writer = writer;

        match self.replay().await {
            Ok(()) => {
                info!(
                    service = %self.service,
                    topics = self.subscriptions.len(),
                    "reconnected and resubscribed"
                );
                self.state.send_replace(SessionState::Registered);
            }
            // The next read sees the broken connection and starts over.
            Err(error) => warn!(%error, "failed to replay registration"),
        }

        for command in held {
            if self.handle_command(command).await.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn replay(&mut self) -> io::Result<()> {
        let register = Request::Register {
            service: self.service.clone(),
        };
        write_frame(&mut self.writer, &register).await?;

        // Callbacks are not `Sync`, so no borrow of the map may live across
        // an await.
        let topics: Vec<String> = self.subscriptions.keys().cloned().collect();
        for topic in topics {
            write_frame(&mut self.writer, &Request::Subscribe { topic }).await?;
        }
        Ok(())
    }

    fn dispatch_bytes(&mut self, bytes: &[u8]) {
        for message in self.decoder.feed::<ServerToClient>(bytes) {
            self.dispatch(message);
        }
    }

    fn dispatch(&mut self, message: ServerToClient) {
        match message {
            ServerToClient::Ack(ack) => match self.handlers.ack.as_mut() {
                Some(handler) => guarded("ack", || handler(&ack)),
                None => debug!(status = %ack.status, "registration acknowledged"),
            },
            ServerToClient::Event(Event::TopicMessage {
                topic,
                from,
                message,
            }) => self.deliver_topic(&topic, from.as_deref(), &message),
            ServerToClient::Event(Event::DirectMessage { from, message }) => {
                match self.handlers.direct.as_mut() {
                    Some(handler) => {
                        guarded("direct message", || handler(&message, from.as_deref()))
                    }
                    None => info!(from = ?from, %message, "direct message"),
                }
            }
            ServerToClient::Event(Event::PresenceUpdate(update)) => {
                match self.handlers.presence.as_mut() {
                    Some(handler) => guarded("presence", || handler(&update)),
                    None => info!(
                        action = update.action.as_str(),
                        service = ?update.service,
                        services = ?update.services,
                        "presence update"
                    ),
                }
            }
            ServerToClient::Event(Event::Error { message }) => self.report_error(&message),
        }
    }

    fn deliver_topic(&mut self, topic: &str, from: Option<&str>, message: &Value) {
        let Some(subscription) = self.subscriptions.get_mut(topic) else {
            debug!(topic, "message for topic without local subscription");
            return;
        };

        if let Some(filter) = &subscription.filter {
            match panic::catch_unwind(AssertUnwindSafe(|| filter(message))) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(topic, "message rejected by filter");
                    return;
                }
                Err(_) => {
                    warn!(topic, "filter panicked, skipping message");
                    return;
                }
            }
        }

        match subscription.callback.as_mut() {
            Some(callback) => guarded(topic, || callback(message, from)),
            None => info!(topic, from = ?from, %message, "topic message"),
        }
    }

    fn report_error(&mut self, message: &str) {
        match self.handlers.error.as_mut() {
            Some(handler) => guarded("error", || handler(message)),
            None => warn!(%message, "broker reported an error"),
        }
    }
}

/// Runs one callback, logging instead of propagating errors and panics.
fn guarded<F>(callback: &str, invoke: F)
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(invoke)) {
        Ok(Ok(())) => {}
        Ok(Err(error)) => warn!(callback, error = ?error, "callback failed"),
        Err(_) => warn!(callback, "callback panicked"),
    }
}
