use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::msgs::handshake::SessionID;
use crate::msgs::persist::{SessionValue, Tls13ClientTicket};

/// A negotiated session shared between a connection and the cache. The
/// value is immutable after handshake completion; sharing is by
/// reference count only.
pub type Session = Arc<SessionValue>;

/// Where sessions may be cached.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionCacheMode {
    Off,
    Client,
    Server,
    Both,
}

impl SessionCacheMode {
    pub fn caches_server(&self) -> bool {
        matches!(self, SessionCacheMode::Server | SessionCacheMode::Both)
    }

    pub fn caches_client(&self) -> bool {
        matches!(self, SessionCacheMode::Client | SessionCacheMode::Both)
    }
}

/// Server-side session-id cache: bounded, least-recently-used eviction,
/// shared across connections behind one mutex.
pub struct ServerSessionCache {
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    entries: HashMap<Vec<u8>, Session>,
    /// Usage order, most recent last.
    order: Vec<Vec<u8>>,
    capacity: usize,
}

impl ServerSessionCache {
    pub fn new(capacity: usize) -> ServerSessionCache {
        ServerSessionCache {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: Vec::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Atomic replace of the entry for `id`.
    pub fn put(&self, id: &SessionID, session: Session) {
        let key = id.as_ref().to_vec();
        let mut inner = self.inner.lock().unwrap();

        if inner.entries.insert(key.clone(), session).is_none() {
            inner.order.push(key);
        } else {
            touch(&mut inner.order, &key);
        }

        while inner.entries.len() > inner.capacity {
            let evicted = inner.order.remove(0);
            inner.entries.remove(&evicted);
            debug!("session cache: evicted LRU entry");
        }
    }

    /// A clone of the shared reference, refreshing recency.
    pub fn get(&self, id: &SessionID) -> Option<Session> {
        let key = id.as_ref().to_vec();
        let mut inner = self.inner.lock().unwrap();
        let found = inner.entries.get(&key).cloned();
        if found.is_some() {
            touch(&mut inner.order, &key);
        }
        found
    }

    pub fn remove(&self, id: &SessionID) {
        let key = id.as_ref().to_vec();
        let mut inner = self.inner.lock().unwrap();
        inner.entries.remove(&key);
        inner.order.retain(|k| k != &key);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn touch(order: &mut Vec<Vec<u8>>, key: &[u8]) {
    if let Some(pos) = order.iter().position(|k| k == key) {
        let k = order.remove(pos);
        order.push(k);
    }
}

/// Client-side store: at most one session-id session and a short queue of
/// TLS 1.3 tickets per server name.
pub struct ClientSessionStore {
    inner: Mutex<HashMap<String, ClientEntry>>,
}

#[derive(Default)]
struct ClientEntry {
    session: Option<Session>,
    tickets: Vec<Tls13ClientTicket>,
}

const MAX_TICKETS_PER_SERVER: usize = 8;

impl ClientSessionStore {
    pub fn new() -> ClientSessionStore {
        ClientSessionStore {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn put_session(&self, server_name: &str, session: Session) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .entry(server_name.to_string())
            .or_default()
            .session = Some(session);
    }

    pub fn get_session(&self, server_name: &str) -> Option<Session> {
        let inner = self.inner.lock().unwrap();
        inner.get(server_name)?.session.clone()
    }

    pub fn forget_session(&self, server_name: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.get_mut(server_name) {
            entry.session = None;
        }
    }

    pub fn push_ticket(&self, server_name: &str, ticket: Tls13ClientTicket) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entry(server_name.to_string()).or_default();
        if entry.tickets.len() >= MAX_TICKETS_PER_SERVER {
            entry.tickets.remove(0);
        }
        entry.tickets.push(ticket);
    }

    /// Tickets are single-use: taking one removes it.
    pub fn take_ticket(&self, server_name: &str) -> Option<Tls13ClientTicket> {
        let mut inner = self.inner.lock().unwrap();
        inner.get_mut(server_name)?.tickets.pop()
    }
}

impl Default for ClientSessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msgs::enums::{CipherSuite, ProtocolVersion};
    use crate::util::Zeroized;

    fn session(id: u8) -> (SessionID, Session) {
        let sid = SessionID::new(&[id; 16]);
        let sv = SessionValue::new(
            ProtocolVersion::TLSv1_2,
            CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            sid.clone(),
            Zeroized::from_slice(&[id; 48]),
            0,
        );
        (sid, Arc::new(sv))
    }

    #[test]
    fn lookup_returns_shared_reference() {
        let cache = ServerSessionCache::new(4);
        let (sid, sess) = session(1);
        cache.put(&sid, Arc::clone(&sess));
        let got = cache.get(&sid).unwrap();
        assert!(Arc::ptr_eq(&got, &sess));
    }

    #[test]
    fn eviction_is_least_recently_used() {
        let cache = ServerSessionCache::new(2);
        let (sid1, s1) = session(1);
        let (sid2, s2) = session(2);
        let (sid3, s3) = session(3);

        cache.put(&sid1, s1);
        cache.put(&sid2, s2);
        // refresh 1 so 2 becomes the victim
        cache.get(&sid1).unwrap();
        cache.put(&sid3, s3);

        assert!(cache.get(&sid1).is_some());
        assert!(cache.get(&sid2).is_none());
        assert!(cache.get(&sid3).is_some());
    }

    #[test]
    fn put_replaces_atomically() {
        let cache = ServerSessionCache::new(2);
        let (sid, s1) = session(1);
        let (_, s2) = session(2);
        cache.put(&sid, s1);
        cache.put(&sid, Arc::clone(&s2));
        assert_eq!(cache.len(), 1);
        assert!(Arc::ptr_eq(&cache.get(&sid).unwrap(), &s2));
    }

    #[test]
    fn client_tickets_are_single_use() {
        let store = ClientSessionStore::new();
        store.push_ticket(
            "example.com",
            Tls13ClientTicket {
                ticket: vec![1],
                psk: Zeroized::from_slice(&[2; 32]),
                age_add: 0,
                lifetime: 300,
                issued_at: 0,
                max_early_data: 0,
            },
        );
        assert!(store.take_ticket("example.com").is_some());
        assert!(store.take_ticket("example.com").is_none());
    }
}
