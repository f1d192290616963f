use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    broker::{BrokerConfig, DEFAULT_LISTEN_ADDR, DEFAULT_OUTBOUND_CAPACITY},
    session::ReconnectPolicy,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the broker, accepting service connections over TCP.
    Broker(BrokerArgs),
    /// Connect to a broker as a named service and drive it from stdin.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Socket address the broker should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    pub listen: SocketAddr,

    /// Frames queued per connection before further frames to it are dropped.
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_CAPACITY)]
    pub outbound_capacity: usize,
}

impl From<&BrokerArgs> for BrokerConfig {
    fn from(args: &BrokerArgs) -> Self {
        Self {
            listen: args.listen,
            outbound_capacity: args.outbound_capacity,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Service name to register with the broker.
    #[arg(long)]
    pub service: String,

    /// Address of the broker to connect to.
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    pub server: String,

    /// Topic to subscribe to right after connecting. Repeatable.
    #[arg(long = "subscribe", value_name = "TOPIC")]
    pub subscribe: Vec<String>,

    /// Follow service join/leave announcements.
    #[arg(long)]
    pub presence: bool,

    /// Connection attempts before giving up, on startup and after a drop.
    #[arg(long, default_value_t = 5)]
    pub reconnect_attempts: u32,

    /// Delay before the first retry in milliseconds; doubles on each retry.
    #[arg(long, default_value_t = 200)]
    pub reconnect_delay_ms: u64,
}

impl ClientArgs {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_attempts,
            initial_delay: Duration::from_millis(self.reconnect_delay_ms),
            ..ReconnectPolicy::default()
        }
    }
}
