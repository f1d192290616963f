use std::{io, net::SocketAddr, sync::Arc};

use serde::Serialize;
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    select,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    codec::{FrameDecoder, encode},
    message::{Ack, Event, PRESENCE_TOPIC, PresenceAction, Request},
    presence::PresenceNotifier,
    registry::{ConnectionHandle, ConnectionId, Frame, Registry},
};

const READ_CHUNK_SIZE: usize = 4096;

/// Outcome of delivering one event to a set of recipients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    pub attempted: usize,
    pub delivered: usize,
}

/// Encodes `message` once and queues it for every recipient. A recipient
/// that cannot take the frame is skipped; its own handler reaps it.
pub fn fan_out<T>(message: &T, recipients: &[ConnectionHandle]) -> FanOut
where
    T: Serialize,
{
    let mut report = FanOut::default();
    if recipients.is_empty() {
        return report;
    }

    let frame: Frame = match encode(message) {
        Ok(bytes) => bytes.into(),
        Err(error) => {
            warn!(%error, "failed to encode outbound event");
            return report;
        }
    };

    for recipient in recipients {
        report.attempted += 1;
        match recipient.transmit(&frame) {
            Ok(()) => report.delivered += 1,
            Err(error) => debug!(conn_id = recipient.id(), %error, "dropped frame for recipient"),
        }
    }
    report
}

/// Everything a handler needs from the broker.
#[derive(Debug, Clone)]
pub struct BrokerContext {
    pub registry: Arc<Registry>,
    pub presence: PresenceNotifier,
    pub outbound_capacity: usize,
}

impl BrokerContext {
    pub fn new(registry: Arc<Registry>, outbound_capacity: usize) -> Self {
        let presence = PresenceNotifier::new(Arc::clone(&registry));
        Self {
            registry,
            presence,
            outbound_capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerState {
    Connected,
    Registered { service: String },
}

/// Broker side of one connection. Dropping it purges the connection from the
/// registry and announces its services as gone.
pub struct ConnectionHandler {
    conn: ConnectionHandle,
    peer: Option<SocketAddr>,
    state: HandlerState,
    registry: Arc<Registry>,
    presence: PresenceNotifier,
}

impl ConnectionHandler {
    pub fn new(conn: ConnectionHandle, peer: Option<SocketAddr>, context: &BrokerContext) -> Self {
        Self {
            conn,
            peer,
            state: HandlerState::Connected,
            registry: Arc::clone(&context.registry),
            presence: context.presence.clone(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    pub fn state(&self) -> &HandlerState {
        &self.state
    }

    pub fn service(&self) -> Option<&str> {
        match &self.state {
            HandlerState::Registered { service } => Some(service),
            HandlerState::Connected => None,
        }
    }

    /// Reads until EOF or a read error, dispatching every decoded request.
    pub async fn run<R>(&mut self, reader: &mut R) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut decoder = FrameDecoder::new();
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];

        loop {
            let read = reader.read(&mut chunk).await?;
            if read == 0 {
                return Ok(());
            }
            for request in decoder.feed::<Request>(&chunk[..read]) {
                self.dispatch(request);
            }
        }
    }

    pub fn dispatch(&mut self, request: Request) {
        match request {
            Request::Register { service } => self.register(service),
            Request::Subscribe { topic } => self.subscribe(topic),
            Request::Publish { topic, message } => {
                self.publish(topic, message);
            }
            Request::Message { to, message } => self.direct_message(to, message),
        }
    }

    fn register(&mut self, service: String) {
        if service.trim().is_empty() {
            warn!(peer = ?self.peer, "ignoring register without a service name");
            return;
        }

        if let HandlerState::Registered { service: previous } = &self.state {
            if *previous != service && self.registry.remove_service(previous, self.id()) {
                info!(
                    peer = ?self.peer,
                    service = %previous,
                    "service renamed, releasing old name"
                );
                self.presence.broadcast(PresenceAction::Leave, previous);
            }
        }

        if let Some(evicted) = self.registry.put_service(&service, self.conn.clone()) {
            warn!(
                %service,
                conn_id = self.id(),
                evicted_conn_id = evicted.id(),
                "service name taken over by newer registration"
            );
        }

        info!(peer = ?self.peer, %service, "service registered");
        self.reply(&Ack::registered(&service));
        self.state = HandlerState::Registered {
            service: service.clone(),
        };
        self.presence.broadcast(PresenceAction::Join, &service);
    }

    fn subscribe(&mut self, topic: String) {
        if !self.registry.add_subscriber(&topic, self.conn.clone()) {
            debug!(conn_id = self.id(), %topic, "already subscribed");
        } else {
            info!(subscriber = self.display_name(), %topic, "subscribed");
        }

        if topic == PRESENCE_TOPIC {
            self.presence.send_current(&self.conn);
        }
    }

    fn publish(&self, topic: String, message: Value) -> FanOut {
        let subscribers = self.registry.subscribers(&topic);
        let event = Event::TopicMessage {
            topic: topic.clone(),
            from: self.service().map(str::to_string),
            message,
        };

        let report = fan_out(&event, &subscribers);
        info!(
            from = self.display_name(),
            %topic,
            attempted = report.attempted,
            delivered = report.delivered,
            "published"
        );
        report
    }

    fn direct_message(&self, to: String, message: Value) {
        match self.registry.get_service(&to) {
            Some(target) => {
                info!(from = self.display_name(), %to, "direct message");
                let event = Event::DirectMessage {
                    from: self.service().map(str::to_string),
                    message,
                };
                fan_out(&event, std::slice::from_ref(&target));
            }
            None => {
                info!(from = self.display_name(), %to, "direct message to unknown service");
                self.reply(&Event::Error {
                    message: format!("Service '{to}' not found"),
                });
            }
        }
    }

    fn reply<T>(&self, message: &T)
    where
        T: Serialize,
    {
        fan_out(message, std::slice::from_ref(&self.conn));
    }

    fn display_name(&self) -> String {
        match (self.service(), self.peer) {
            (Some(service), _) => service.to_string(),
            (None, Some(peer)) => peer.to_string(),
            (None, None) => format!("conn-{}", self.id()),
        }
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        let removed = self.registry.remove_connection_everywhere(self.id());
        info!(peer = ?self.peer, conn_id = self.id(), "connection closed");
        for service in removed {
            info!(%service, "service left");
            self.presence.broadcast(PresenceAction::Leave, &service);
        }
    }
}

/// Drives one accepted socket until the peer goes away.
pub async fn serve_connection(
    stream: TcpStream,
    conn_id: ConnectionId,
    context: BrokerContext,
) -> io::Result<()> {
    let peer = stream.peer_addr().ok();
    let (mut reader, writer) = stream.into_split();
    let (conn, outbound) = ConnectionHandle::channel(conn_id, context.outbound_capacity);

    info!(?peer, conn_id, "client connected");
    let mut handler = ConnectionHandler::new(conn, peer, &context);

    let writer = write_outbound(writer, outbound);
    tokio::pin!(writer);
    let mut writer_done = false;

    let result = select! {
        result = handler.run(&mut reader) => result,
        written = &mut writer => {
            writer_done = true;
            written
        }
    };

    // Purges the registry; once the last sender is gone the writer drains
    // whatever is still queued and shuts the socket down.
    drop(handler);
    if !writer_done {
        if let Err(error) = writer.await {
            debug!(?peer, %error, "failed to flush outbound frames");
        }
    }

    result
}

async fn write_outbound<W>(mut writer: W, mut outbound: mpsc::Receiver<Frame>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        writer.write_all(&frame).await?;
        writer.flush().await?;
    }
    writer.shutdown().await
}
