use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::message::PRESENCE_TOPIC;

pub type ConnectionId = u64;

/// One encoded frame, shared between every recipient of a fan-out.
pub type Frame = Arc<[u8]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransmitError {
    #[error("outbound queue is full")]
    QueueFull,
    #[error("connection is closed")]
    Closed,
}

/// Sending side of one accepted connection.
///
/// Frames pushed here are written to the socket by that connection's writer.
/// Once the writer goes away every transmit fails with
/// [`TransmitError::Closed`].
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Frame>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, outbound: mpsc::Sender<Frame>) -> Self {
        Self { id, outbound }
    }

    /// Creates a handle together with the queue its writer drains.
    pub fn channel(id: ConnectionId, capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(id, tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues a frame without waiting. Never blocks the caller.
    pub fn transmit(&self, frame: &Frame) -> Result<(), TransmitError> {
        self.outbound
            .try_send(Arc::clone(frame))
            .map_err(|err| match err {
                TrySendError::Full(_) => TransmitError::QueueFull,
                TrySendError::Closed(_) => TransmitError::Closed,
            })
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    services: BTreeMap<String, ConnectionHandle>,
    subscriptions: HashMap<String, BTreeMap<ConnectionId, ConnectionHandle>>,
}

#[derive(Debug, Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // Mutations are single inserts or removes; a poisoned map is still whole.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `conn` as the owner of `name`, returning the previous owner
    /// when another connection held it.
    pub fn put_service(&self, name: &str, conn: ConnectionHandle) -> Option<ConnectionHandle> {
        let conn_id = conn.id();
        self.lock()
            .services
            .insert(name.to_string(), conn)
            .filter(|previous| previous.id() != conn_id)
    }

    /// Removes `name` only if `conn_id` still owns it.
    pub fn remove_service(&self, name: &str, conn_id: ConnectionId) -> bool {
        let mut state = self.lock();
        match state.services.get(name) {
            Some(owner) if owner.id() == conn_id => {
                state.services.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn get_service(&self, name: &str) -> Option<ConnectionHandle> {
        self.lock().services.get(name).cloned()
    }

    /// Adds `conn` to the subscriber set of `topic`. Returns `false` when it
    /// was already subscribed.
    pub fn add_subscriber(&self, topic: &str, conn: ConnectionHandle) -> bool {
        let mut state = self.lock();
        let subscribers = state.subscriptions.entry(topic.to_string()).or_default();
        if subscribers.contains_key(&conn.id()) {
            return false;
        }
        subscribers.insert(conn.id(), conn);
        true
    }

    /// Snapshot of the current subscribers of `topic`.
    pub fn subscribers(&self, topic: &str) -> Vec<ConnectionHandle> {
        self.lock()
            .subscriptions
            .get(topic)
            .map(|subscribers| subscribers.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of all registered services, sorted.
    pub fn roster(&self) -> Vec<String> {
        self.lock().services.keys().cloned().collect()
    }

    /// Roster and presence subscribers read under the same lock so a
    /// broadcast never pairs a roster with a stale audience.
    pub fn presence_snapshot(&self) -> (Vec<String>, Vec<ConnectionHandle>) {
        let state = self.lock();
        let roster = state.services.keys().cloned().collect();
        let subscribers = state
            .subscriptions
            .get(PRESENCE_TOPIC)
            .map(|subscribers| subscribers.values().cloned().collect())
            .unwrap_or_default();
        (roster, subscribers)
    }

    /// Drops every reference to `conn_id` from both maps in one critical
    /// section. Returns the service names it owned.
    pub fn remove_connection_everywhere(&self, conn_id: ConnectionId) -> Vec<String> {
        let mut state = self.lock();

        let owned: Vec<String> = state
            .services
            .iter()
            .filter(|(_, owner)| owner.id() == conn_id)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &owned {
            state.services.remove(name);
        }

        state.subscriptions.retain(|_, subscribers| {
            subscribers.remove(&conn_id);
            !subscribers.is_empty()
        });

        owned
    }

    /// Whether any entry still points at `conn_id`.
    pub fn references(&self, conn_id: ConnectionId) -> bool {
        let state = self.lock();
        state.services.values().any(|owner| owner.id() == conn_id)
            || state
                .subscriptions
                .values()
                .any(|subscribers| subscribers.contains_key(&conn_id))
    }

    pub fn service_count(&self) -> usize {
        self.lock().services.len()
    }

    pub fn topic_count(&self) -> usize {
        self.lock().subscriptions.len()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn handle(id: ConnectionId) -> (ConnectionHandle, mpsc::Receiver<Frame>) {
        ConnectionHandle::channel(id, 8)
    }

    #[test]
    fn last_registration_wins_and_reports_eviction() {
        let registry = Registry::new();
        let (first, _rx1) = handle(1);
        let (second, _rx2) = handle(2);

        assert!(registry.put_service("auth", first.clone()).is_none());
        let evicted = registry
            .put_service("auth", second)
            .expect("first owner evicted");

        assert_eq!(evicted.id(), 1);
        assert_eq!(registry.get_service("auth").map(|c| c.id()), Some(2));
        // Re-registering the same connection is not an eviction.
        assert!(registry.put_service("auth", first.clone()).is_some());
        assert!(registry.put_service("auth", first).is_none());
    }

    #[test]
    fn stale_owner_cannot_remove_newer_registration() {
        let registry = Registry::new();
        let (old, _rx1) = handle(1);
        let (new, _rx2) = handle(2);
        registry.put_service("auth", old);
        registry.put_service("auth", new);

        assert!(!registry.remove_service("auth", 1));
        assert_eq!(registry.get_service("auth").map(|c| c.id()), Some(2));
        assert!(registry.remove_service("auth", 2));
        assert!(registry.get_service("auth").is_none());
    }

    #[test]
    fn duplicate_subscribe_is_a_no_op() {
        let registry = Registry::new();
        let (conn, _rx) = handle(7);

        assert!(registry.add_subscriber("orders", conn.clone()));
        assert!(!registry.add_subscriber("orders", conn));
        assert_eq!(registry.subscribers("orders").len(), 1);
    }

    #[test]
    fn remove_connection_everywhere_purges_both_maps() {
        let registry = Registry::new();
        let (a, _rx_a) = handle(1);
        let (b, _rx_b) = handle(2);
        registry.put_service("a", a.clone());
        registry.put_service("a-alias", a.clone());
        registry.put_service("b", b.clone());
        registry.add_subscriber("t1", a.clone());
        registry.add_subscriber("t2", a);
        registry.add_subscriber("t2", b);

        let mut removed = registry.remove_connection_everywhere(1);
        removed.sort();

        assert_eq!(removed, vec!["a".to_string(), "a-alias".to_string()]);
        assert!(!registry.references(1));
        assert_eq!(registry.roster(), vec!["b".to_string()]);
        assert_eq!(registry.topic_count(), 1, "empty topic t1 is dropped");
        assert_eq!(registry.subscribers("t2").len(), 1);
    }

    #[test]
    fn presence_snapshot_pairs_roster_with_presence_subscribers() {
        let registry = Registry::new();
        let (watcher, _rx) = handle(1);
        let (svc, _rx_svc) = handle(2);
        registry.add_subscriber(PRESENCE_TOPIC, watcher);
        registry.put_service("svc", svc);

        let (roster, subscribers) = registry.presence_snapshot();

        assert_eq!(roster, vec!["svc".to_string()]);
        assert_eq!(
            subscribers.iter().map(ConnectionHandle::id).collect::<Vec<_>>(),
            vec![1]
        );
    }

    #[test]
    fn transmit_reports_full_and_closed_queues() {
        let (conn, rx) = ConnectionHandle::channel(1, 1);
        let frame: Frame = Arc::from(&b"x\n"[..]);

        assert_eq!(conn.transmit(&frame), Ok(()));
        assert_eq!(conn.transmit(&frame), Err(TransmitError::QueueFull));
        drop(rx);
        assert_eq!(conn.transmit(&frame), Err(TransmitError::Closed));
    }

    #[test]
    fn concurrent_churn_leaves_no_closed_connection_reachable() {
        let registry = Arc::new(Registry::new());

        thread::scope(|scope| {
            for worker in 0..8u64 {
                let registry = Arc::clone(&registry);
                scope.spawn(move || {
                    for round in 0..200u64 {
                        let id = worker * 1_000 + round;
                        let (conn, rx) = handle(id);
                        let name = format!("svc-{}", round % 5);
                        registry.put_service(&name, conn.clone());
                        registry.add_subscriber("shared", conn.clone());
                        registry.add_subscriber(&format!("topic-{worker}"), conn);
                        let _ = registry.subscribers("shared");
                        registry.remove_connection_everywhere(id);
                        drop(rx);
                    }
                });
            }
        });

        for worker in 0..8u64 {
            for round in 0..200u64 {
                assert!(!registry.references(worker * 1_000 + round));
            }
        }
        assert_eq!(registry.service_count(), 0);
        assert_eq!(registry.topic_count(), 0);
    }
}
