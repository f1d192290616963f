use std::sync::Arc;

use tracing::debug;

use crate::{
    handler::{FanOut, fan_out},
    message::{Event, PresenceAction, PresenceUpdate},
    registry::{ConnectionHandle, Registry},
};

#[derive(Debug, Clone)]
pub struct PresenceNotifier {
    registry: Arc<Registry>,
}

impl PresenceNotifier {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Tells every presence subscriber that `service` joined or left,
    /// along with the roster as it stands right now.
    pub fn broadcast(&self, action: PresenceAction, service: &str) -> FanOut {
        let (services, subscribers) = self.registry.presence_snapshot();
        let event = Event::PresenceUpdate(PresenceUpdate {
            action,
            service: Some(service.to_string()),
            services,
        });

        let report = fan_out(&event, &subscribers);
        debug!(
            action = action.as_str(),
            service,
            attempted = report.attempted,
            delivered = report.delivered,
            "presence broadcast"
        );
        report
    }

    /// Sends the current roster to one connection that just subscribed.
    pub fn send_current(&self, conn: &ConnectionHandle) -> FanOut {
        let event = Event::PresenceUpdate(PresenceUpdate {
            action: PresenceAction::Current,
            service: None,
            services: self.registry.roster(),
        });
        fan_out(&event, std::slice::from_ref(conn))
    }
}
