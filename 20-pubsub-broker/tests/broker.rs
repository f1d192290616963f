use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use pubsub_broker::{
    broker::Broker,
    codec::write_frame,
    message::{
        Ack, Event, PRESENCE_TOPIC, PresenceAction, PresenceUpdate, Request, ServerToClient,
    },
    registry::Registry,
};
use serde_json::json;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::{Instant, sleep, timeout},
};

const READ_TIMEOUT: Duration = Duration::from_secs(2);

struct TestBroker {
    addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

impl TestBroker {
    async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let broker = Broker::new(listener);
        let registry = broker.registry();

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = broker.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            registry,
            shutdown,
            server,
        })
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.server.await;
    }
}

struct RawClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RawClient {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Connects and registers, consuming the acknowledgment.
    async fn register(addr: SocketAddr, service: &str) -> Result<Self> {
        let mut client = Self::connect(addr).await?;
        client
            .send(&Request::Register {
                service: service.to_string(),
            })
            .await?;
        let ack = client.recv().await?;
        assert_eq!(ack, ServerToClient::Ack(Ack::registered(service)));
        Ok(client)
    }

    async fn send(&mut self, request: &Request) -> Result<()> {
        write_frame(&mut self.writer, request).await?;
        Ok(())
    }

    async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).await?;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.send(&Request::Subscribe {
            topic: topic.to_string(),
        })
        .await
    }

    async fn recv(&mut self) -> Result<ServerToClient> {
        let mut line = String::new();
        let read = timeout(READ_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .context("timed out waiting for a frame")??;
        if read == 0 {
            bail!("connection closed while waiting for a frame");
        }
        Ok(serde_json::from_str(line.trim_end())?)
    }

    async fn expect_silence(&mut self) -> Result<()> {
        let mut line = String::new();
        match timeout(Duration::from_millis(150), self.reader.read_line(&mut line)).await {
            Err(_) => Ok(()),
            Ok(_) => bail!("unexpected frame: {line}"),
        }
    }

    /// Subscribes to presence and consumes the roster snapshot. The broker
    /// handles requests in order, so everything sent earlier on this
    /// connection has been applied once this returns.
    async fn sync_presence(&mut self) -> Result<Vec<String>> {
        self.subscribe(PRESENCE_TOPIC).await?;
        match self.recv().await? {
            ServerToClient::Event(Event::PresenceUpdate(PresenceUpdate {
                action: PresenceAction::Current,
                services,
                ..
            })) => Ok(services),
            other => bail!("expected roster snapshot, got {other:?}"),
        }
    }
}

async fn wait_until<F>(mut condition: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + READ_TIMEOUT;
    while !condition() {
        if Instant::now() > deadline {
            bail!("condition not reached in time");
        }
        sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

fn presence(action: PresenceAction, service: &str, services: &[&str]) -> ServerToClient {
    ServerToClient::Event(Event::PresenceUpdate(PresenceUpdate {
        action,
        service: Some(service.to_string()),
        services: services.iter().map(|s| s.to_string()).collect(),
    }))
}

#[tokio::test]
async fn services_publish_and_message_each_other() -> Result<()> {
    let broker = TestBroker::start().await?;

    let mut auth = RawClient::register(broker.addr, "auth-service").await?;
    auth.subscribe("user_created").await?;
    assert_eq!(auth.sync_presence().await?, vec!["auth-service".to_string()]);

    let mut user = RawClient::register(broker.addr, "user-service").await?;
    assert_eq!(
        auth.recv().await?,
        presence(PresenceAction::Join, "user-service", &["auth-service", "user-service"])
    );

    user.send(&Request::Publish {
        topic: "user_created".into(),
        message: json!({"user_id": 150}),
    })
    .await?;
    assert_eq!(
        auth.recv().await?,
        ServerToClient::Event(Event::TopicMessage {
            topic: "user_created".into(),
            from: Some("user-service".into()),
            message: json!({"user_id": 150}),
        })
    );

    user.send(&Request::Message {
        to: "auth-service".into(),
        message: json!("ping"),
    })
    .await?;
    assert_eq!(
        auth.recv().await?,
        ServerToClient::Event(Event::DirectMessage {
            from: Some("user-service".into()),
            message: json!("ping"),
        })
    );

    user.send(&Request::Message {
        to: "billing-service".into(),
        message: json!("invoice?"),
    })
    .await?;
    assert_eq!(
        user.recv().await?,
        ServerToClient::Event(Event::Error {
            message: "Service 'billing-service' not found".into(),
        })
    );
    auth.expect_silence().await?;

    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn disconnect_purges_registry_and_announces_leave() -> Result<()> {
    let broker = TestBroker::start().await?;

    let mut watcher = RawClient::connect(broker.addr).await?;
    watcher.sync_presence().await?;

    let mut svc = RawClient::register(broker.addr, "x").await?;
    svc.subscribe("orders").await?;
    assert_eq!(watcher.recv().await?, presence(PresenceAction::Join, "x", &["x"]));

    svc.writer.shutdown().await?;
    drop(svc);

    assert_eq!(watcher.recv().await?, presence(PresenceAction::Leave, "x", &[]));
    let registry = Arc::clone(&broker.registry);
    wait_until(|| registry.subscribers("orders").is_empty() && registry.service_count() == 0)
        .await?;

    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn publish_reaches_every_subscriber_despite_a_dead_one() -> Result<()> {
    let broker = TestBroker::start().await?;

    let mut subscribers = Vec::new();
    for index in 0..5 {
        let mut client = RawClient::connect(broker.addr).await?;
        client.subscribe("metrics").await?;
        client.sync_presence().await?;
        subscribers.push((index, client));
    }
    // One subscriber vanishes without its handler having noticed yet.
    let (_, dead) = subscribers.remove(2);
    drop(dead);

    let mut publisher = RawClient::register(broker.addr, "collector").await?;
    for (_, client) in &mut subscribers {
        assert!(matches!(
            client.recv().await?,
            ServerToClient::Event(Event::PresenceUpdate(_))
        ));
    }

    publisher
        .send(&Request::Publish {
            topic: "metrics".into(),
            message: json!({"cpu": 0.5}),
        })
        .await?;

    for (index, client) in &mut subscribers {
        let received = client.recv().await.with_context(|| format!("subscriber {index}"))?;
        assert_eq!(
            received,
            ServerToClient::Event(Event::TopicMessage {
                topic: "metrics".into(),
                from: Some("collector".into()),
                message: json!({"cpu": 0.5}),
            })
        );
    }

    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn messages_from_one_publisher_arrive_in_order() -> Result<()> {
    let broker = TestBroker::start().await?;

    let mut subscriber = RawClient::connect(broker.addr).await?;
    subscriber.subscribe("seq").await?;
    subscriber.sync_presence().await?;

    let mut publisher = RawClient::connect(broker.addr).await?;
    for n in 0..200 {
        publisher
            .send(&Request::Publish {
                topic: "seq".into(),
                message: json!(n),
            })
            .await?;
    }

    for n in 0..200 {
        match subscriber.recv().await? {
            ServerToClient::Event(Event::TopicMessage { message, from, .. }) => {
                assert_eq!(message, json!(n));
                assert_eq!(from, None, "publisher never registered");
            }
            other => bail!("unexpected frame {other:?}"),
        }
    }

    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn corrupt_and_split_frames_do_not_break_the_connection() -> Result<()> {
    let broker = TestBroker::start().await?;

    let mut client = RawClient::connect(broker.addr).await?;
    client.send_raw(b"{this is not json}\n").await?;
    client.send_raw(br#"{"action":"regi"#).await?;
    sleep(Duration::from_millis(20)).await;
    client.send_raw(b"ster\",\"service\":\"late\"}\n").await?;

    assert_eq!(client.recv().await?, ServerToClient::Ack(Ack::registered("late")));

    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_closes_connections_and_clears_registry() -> Result<()> {
    let broker = TestBroker::start().await?;
    let registry = Arc::clone(&broker.registry);

    let mut client = RawClient::register(broker.addr, "short-lived").await?;
    client.subscribe("t").await?;
    client.sync_presence().await?;
    assert_eq!(registry.service_count(), 1);

    broker.stop().await;

    assert_eq!(registry.service_count(), 0);
    assert_eq!(registry.topic_count(), 0);
    let mut line = String::new();
    let read = timeout(READ_TIMEOUT, client.reader.read_line(&mut line)).await??;
    assert_eq!(read, 0, "broker should close the socket, got {line}");

    Ok(())
}
