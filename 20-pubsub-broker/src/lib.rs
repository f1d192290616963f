//! Minimal message broker for named services.
//!
//! Services hold one TCP connection to the broker and use it to register a
//! name, publish to and subscribe on topics, send direct messages to other
//! services, and follow join/leave announcements on the `presence` topic.
//! Messages are newline-delimited JSON.
//!
//! - [`codec`] frames JSON envelopes and decodes partial or corrupt streams.
//! - [`message`] defines the request, event, and acknowledgment envelopes.
//! - [`registry`] maps service names and topics to live connections.
//! - [`handler`] runs one connection on the broker side and routes requests.
//! - [`presence`] broadcasts roster changes.
//! - [`broker`] accepts connections and spawns their handlers.
//! - [`session`] is the client library, with bounded reconnect and
//!   resubscription.
//! - [`cli`] and [`client`] provide the command-line broker and an
//!   interactive terminal client built on [`session`].
//!
//! State lives in memory only; restarting the broker forgets every
//! registration and subscription, and clients restore theirs on reconnect.

pub mod broker;
pub mod cli;
pub mod client;
pub mod codec;
pub mod handler;
pub mod message;
pub mod presence;
pub mod registry;
pub mod session;
