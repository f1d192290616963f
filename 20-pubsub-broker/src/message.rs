use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topic reserved for roster broadcasts.
pub const PRESENCE_TOPIC: &str = "presence";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    Register {
        service: String,
    },
    Subscribe {
        topic: String,
    },
    Publish {
        topic: String,
        #[serde(default)]
        message: Value,
    },
    Message {
        to: String,
        #[serde(default)]
        message: Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TopicMessage {
        topic: String,
        from: Option<String>,
        message: Value,
    },
    DirectMessage {
        from: Option<String>,
        message: Value,
    },
    PresenceUpdate(PresenceUpdate),
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub action: PresenceAction,
    pub service: Option<String>,
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresenceAction {
    Join,
    Leave,
    /// Snapshot sent to a connection right after it subscribes to presence.
    Current,
}

impl PresenceAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PresenceAction::Join => "join",
            PresenceAction::Leave => "leave",
            PresenceAction::Current => "current",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Ack {
    pub fn registered(service: &str) -> Self {
        Self {
            status: "ok".to_string(),
            message: Some(format!("Registered as {service}")),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Anything the broker may write to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ServerToClient {
    Event(Event),
    Ack(Ack),
}

impl From<Event> for ServerToClient {
    fn from(event: Event) -> Self {
        ServerToClient::Event(event)
    }
}

impl From<Ack> for ServerToClient {
    fn from(ack: Ack) -> Self {
        ServerToClient::Ack(ack)
    }
}
