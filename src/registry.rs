use crate::client::Client;
use crate::config::Peer;
use crate::dial::DialState;
use parking_lot::Mutex;
use quicmesh_core::transport::ConnectionRef;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Live connection and client tables.
///
/// Connections are keyed by remote host, clients by the peer's canonical
/// address. Every allowed address of a registered peer is indexed to its
/// client so the router resolves aliases in one lookup. All access goes
/// through a single lock.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<String, ConnectionRef>,
    clients: HashMap<IpAddr, Arc<Client>>,
    routes: HashMap<IpAddr, IpAddr>,
    states: HashMap<IpAddr, DialState>,
}

impl Inner {
    fn register(&mut self, peer: &Peer, connection: ConnectionRef) -> Registration {
        let key = peer.canonical_address();
        let same = |c: &ConnectionRef| c.stable_id() == connection.stable_id();
        if let Some(client) = self.clients.get(&key).cloned() {
            let in_table = self
                .connections
                .get(peer.host())
                .map(same)
                .unwrap_or(false);
            let superseded = if same(client.connection()) || in_table {
                None
            } else {
                Some(connection)
            };
            return Registration {
                client,
                created: false,
                connection_inserted: false,
                superseded,
            };
        }
        let existing = self.connections.get(peer.host()).cloned();
        let (shared, connection_inserted, superseded) = match existing {
            Some(existing) if same(&existing) => (existing, false, None),
            Some(existing) => (existing, false, Some(connection)),
            None => {
                self.connections
                    .insert(peer.host().to_string(), connection.clone());
                (connection, true, None)
            }
        };
        let client = Arc::new(Client::new(peer.clone(), shared));
        self.clients.insert(key, client.clone());
        for ip in peer.allowed_ips() {
            self.routes.insert(*ip, key);
        }
        self.states.insert(key, DialState::Connected);
        Registration {
            client,
            created: true,
            connection_inserted,
            superseded,
        }
    }
}

/// Outcome of [`ConnectionRegistry::register`].
pub struct Registration {
    pub client: Arc<Client>,
    /// The peer had no client before this call.
    pub created: bool,
    /// The offered connection became the host's connection.
    pub connection_inserted: bool,
    /// The offered connection lost to one already in the table and should be closed.
    pub superseded: Option<ConnectionRef>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(&self, host: &str) -> Option<ConnectionRef> {
        self.inner.lock().connections.get(host).cloned()
    }

    /// Store `connection` for `host` unless one is already there.
    pub fn insert_connection_if_absent(&self, host: &str, connection: &ConnectionRef) -> bool {
        let mut guard = self.inner.lock();
        if guard.connections.contains_key(host) {
            return false;
        }
        guard
            .connections
            .insert(host.to_string(), connection.clone());
        true
    }

    /// Register `peer` over `connection`, atomically.
    ///
    /// An existing client for the peer wins and is returned unchanged. If the
    /// host already has a different connection, the client is bound to that one
    /// and the offered connection is handed back as superseded.
    pub fn register(&self, peer: &Peer, connection: ConnectionRef) -> Registration {
        self.inner.lock().register(peer, connection)
    }

    /// Bind `peer` to `connection` only while it is still the host's session.
    ///
    /// `None` when the host entry is gone or now holds a different session; a
    /// session that was looked up earlier may have been lost in between.
    pub fn register_existing(&self, peer: &Peer, connection: &ConnectionRef) -> Option<Registration> {
        let mut guard = self.inner.lock();
        let current = guard
            .connections
            .get(peer.host())
            .is_some_and(|c| c.stable_id() == connection.stable_id());
        if !current {
            return None;
        }
        Some(guard.register(peer, connection.clone()))
    }

    pub fn client(&self, key: &IpAddr) -> Option<Arc<Client>> {
        self.inner.lock().clients.get(key).cloned()
    }

    pub fn contains_client(&self, key: &IpAddr) -> bool {
        self.inner.lock().clients.contains_key(key)
    }

    /// Client owning `dst`, by canonical address or any other allowed address.
    pub fn client_for(&self, dst: &IpAddr) -> Option<Arc<Client>> {
        let guard = self.inner.lock();
        let key = guard.routes.get(dst)?;
        guard.clients.get(key).cloned()
    }

    /// Drop a lost session. Only removes the host entry when it still points at
    /// `stable_id`; every client bound to it goes too. Returns the keys of the
    /// peers that lost their client.
    pub fn remove_connection(&self, host: &str, stable_id: usize) -> Vec<IpAddr> {
        let mut guard = self.inner.lock();
        if guard
            .connections
            .get(host)
            .is_some_and(|c| c.stable_id() == stable_id)
        {
            guard.connections.remove(host);
        }
        let lost: Vec<IpAddr> = guard
            .clients
            .iter()
            .filter(|(_, client)| client.connection().stable_id() == stable_id)
            .map(|(key, _)| *key)
            .collect();
        for key in &lost {
            if let Some(client) = guard.clients.remove(key) {
                for ip in client.peer().allowed_ips() {
                    guard.routes.remove(ip);
                }
            }
            guard.states.insert(*key, DialState::Disconnected);
        }
        lost
    }

    /// Claim `key` for a dial task. Fails while another task dials it or once it
    /// has a client.
    pub fn begin_dial(&self, key: IpAddr) -> bool {
        let mut guard = self.inner.lock();
        if guard.clients.contains_key(&key) {
            return false;
        }
        if guard.states.get(&key) == Some(&DialState::Dialing) {
            return false;
        }
        guard.states.insert(key, DialState::Dialing);
        true
    }

    pub fn set_state(&self, key: IpAddr, state: DialState) {
        self.inner.lock().states.insert(key, state);
    }

    pub fn state(&self, key: &IpAddr) -> DialState {
        self.inner
            .lock()
            .states
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    pub fn states(&self) -> Vec<(IpAddr, DialState)> {
        self.inner
            .lock()
            .states
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect()
    }

    /// Empty every table, handing back the connections so the caller can close them.
    pub fn clear(&self) -> Vec<ConnectionRef> {
        let mut guard = self.inner.lock();
        guard.clients.clear();
        guard.routes.clear();
        guard.states.clear();
        guard.connections.drain().map(|(_, c)| c).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{peer, MockConnection};

    #[test]
    fn peers_on_one_host_share_a_connection() {
        let registry = ConnectionRegistry::new();
        let a = peer("10.0.0.2:5000", &["10.1.0.2"]);
        let b = peer("10.0.0.2:5001", &["10.1.0.20"]);
        let first = MockConnection::new_ref(1, "10.0.0.2:5000");
        let second = MockConnection::new_ref(2, "10.0.0.2:5001");

        let ra = registry.register(&a, first.clone());
        assert!(ra.created && ra.connection_inserted && ra.superseded.is_none());
        let rb = registry.register(&b, second);
        assert!(rb.created);
        assert!(!rb.connection_inserted);
        assert_eq!(rb.superseded.map(|c| c.stable_id()), Some(2));
        assert_eq!(rb.client.connection().stable_id(), 1);
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.client_count(), 2);
    }

    #[test]
    fn registering_twice_is_a_noop() {
        let registry = ConnectionRegistry::new();
        let a = peer("10.0.0.2:5000", &["10.1.0.2"]);
        let conn = MockConnection::new_ref(1, "10.0.0.2:5000");
        registry.register(&a, conn.clone());
        let again = registry.register(&a, conn);
        assert!(!again.created);
        assert!(again.superseded.is_none());
        assert_eq!(registry.client_count(), 1);

        let stray = MockConnection::new_ref(7, "10.0.0.2:5000");
        let again = registry.register(&a, stray);
        assert_eq!(again.superseded.map(|c| c.stable_id()), Some(7));
        assert_eq!(registry.client(&a.canonical_address()).unwrap().connection().stable_id(), 1);
    }

    #[test]
    fn aliases_route_to_the_owner() {
        let registry = ConnectionRegistry::new();
        let a = peer("10.0.0.2:5000", &["10.1.0.2", "10.1.7.7"]);
        registry.register(&a, MockConnection::new_ref(1, "10.0.0.2:5000"));
        let via_alias = registry.client_for(&"10.1.7.7".parse().unwrap()).unwrap();
        assert_eq!(via_alias.key(), a.canonical_address());
        assert!(registry.client_for(&"10.1.0.3".parse().unwrap()).is_none());
    }

    #[test]
    fn lost_connection_takes_its_clients() {
        let registry = ConnectionRegistry::new();
        let a = peer("10.0.0.2:5000", &["10.1.0.2"]);
        let b = peer("10.0.0.3:5000", &["10.1.0.3"]);
        registry.register(&a, MockConnection::new_ref(1, "10.0.0.2:5000"));
        registry.register(&b, MockConnection::new_ref(2, "10.0.0.3:5000"));

        // stale id leaves the host entry alone
        assert!(registry.remove_connection("10.0.0.2", 99).is_empty());
        assert_eq!(registry.connection_count(), 2);

        let lost = registry.remove_connection("10.0.0.2", 1);
        assert_eq!(lost, vec![a.canonical_address()]);
        assert!(registry.connection("10.0.0.2").is_none());
        assert!(registry.client_for(&"10.1.0.2".parse().unwrap()).is_none());
        assert_eq!(
            registry.state(&a.canonical_address()),
            DialState::Disconnected
        );
        assert_eq!(registry.state(&b.canonical_address()), DialState::Connected);
    }

    #[test]
    fn server_side_entry_is_reused() {
        let registry = ConnectionRegistry::new();
        let inbound = MockConnection::new_ref(5, "10.0.0.2:40000");
        assert!(registry.insert_connection_if_absent("10.0.0.2", &inbound));
        assert!(!registry.insert_connection_if_absent(
            "10.0.0.2",
            &MockConnection::new_ref(6, "10.0.0.2:40001")
        ));
        let reused = registry.connection("10.0.0.2").unwrap();
        let a = peer("10.0.0.2:5000", &["10.1.0.2"]);
        let r = registry.register(&a, reused);
        assert!(r.created && !r.connection_inserted && r.superseded.is_none());
        assert_eq!(r.client.connection().stable_id(), 5);
    }

    #[test]
    fn lost_session_is_not_reused() {
        let registry = ConnectionRegistry::new();
        let inbound = MockConnection::new_ref(5, "10.0.0.2:40000");
        registry.insert_connection_if_absent("10.0.0.2", &inbound);
        let a = peer("10.0.0.2:5000", &["10.1.0.2"]);

        let looked_up = registry.connection("10.0.0.2").unwrap();
        registry.remove_connection("10.0.0.2", 5);
        assert!(registry.register_existing(&a, &looked_up).is_none());
        assert_eq!(registry.connection_count(), 0);
        assert!(!registry.contains_client(&a.canonical_address()));

        // a replacement session under the same host is not the one looked up
        registry.insert_connection_if_absent("10.0.0.2", &MockConnection::new_ref(6, "10.0.0.2:40001"));
        assert!(registry.register_existing(&a, &looked_up).is_none());

        let current = registry.connection("10.0.0.2").unwrap();
        let r = registry.register_existing(&a, &current).unwrap();
        assert!(r.created && !r.connection_inserted && r.superseded.is_none());
        assert_eq!(r.client.connection().stable_id(), 6);
    }

    #[test]
    fn one_dial_task_per_peer() {
        let registry = ConnectionRegistry::new();
        let key: IpAddr = "10.1.0.2".parse().unwrap();
        assert!(registry.begin_dial(key));
        assert!(!registry.begin_dial(key));
        registry.set_state(key, DialState::Exhausted);
        assert!(registry.begin_dial(key));
        registry.register(
            &peer("10.0.0.2:5000", &["10.1.0.2"]),
            MockConnection::new_ref(1, "10.0.0.2:5000"),
        );
        assert!(!registry.begin_dial(key));
    }

    #[test]
    fn clear_hands_back_connections() {
        let registry = ConnectionRegistry::new();
        registry.register(
            &peer("10.0.0.2:5000", &["10.1.0.2"]),
            MockConnection::new_ref(1, "10.0.0.2:5000"),
        );
        let drained = registry.clear();
        assert_eq!(drained.len(), 1);
        assert_eq!(registry.client_count(), 0);
        assert!(registry.states().is_empty());
    }
}
