use std::{future::Future, io, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::{JoinError, JoinSet},
};
use tracing::{debug, info, warn};

use crate::{
    handler::{BrokerContext, serve_connection},
    registry::{ConnectionId, Registry},
};

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9000";
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub listen: SocketAddr,
    /// Frames queued per connection before further frames to it are dropped.
    pub outbound_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 9000)),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

pub struct Broker {
    listener: TcpListener,
    context: BrokerContext,
}

impl Broker {
    pub fn new(listener: TcpListener) -> Self {
        Self::with_config(listener, &BrokerConfig::default())
    }

    pub fn with_config(listener: TcpListener, config: &BrokerConfig) -> Self {
        Self {
            listener,
            context: BrokerContext::new(Arc::new(Registry::new()), config.outbound_capacity),
        }
    }

    pub async fn bind(config: &BrokerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        Ok(Self::with_config(listener, config))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.context.registry)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Broker { listener, context } = self;
        let mut handlers = JoinSet::new();
        let mut next_id: ConnectionId = 1;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(active = handlers.len(), "broker shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &context, next_id, &mut handlers);
                    next_id += 1;
                }
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    log_handler_exit(joined);
                }
            }
        }

        // Aborting runs each handler's cleanup.
        handlers.shutdown().await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    context: &BrokerContext,
    conn_id: ConnectionId,
    handlers: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, conn_id, context, handlers),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    conn_id: ConnectionId,
    context: &BrokerContext,
    handlers: &mut JoinSet<()>,
) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%peer, error = ?err, "failed to set TCP_NODELAY");
    }

    let context = context.clone();
    handlers.spawn(async move {
        if let Err(err) = serve_connection(stream, conn_id, context).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}

fn log_handler_exit(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            warn!(error = ?err, "connection handler panicked");
        }
    }
}
