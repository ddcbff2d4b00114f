use crate::msgs::persist::SessionValue;
use crate::ticketer::TimeBase;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

struct CacheInner {
  map: HashMap<Vec<u8>, Arc<SessionValue>>,
  // most recently used at the back
  order: VecDeque<Vec<u8>>,
}

/// The stateful side of resumption: session-ID to session, bounded,
/// least-recently-used eviction, expiry enforced on lookup.
///
/// Shared between connections; all operations are atomic under an
/// internal reader-writer lock.
pub struct SessionCache {
  cap: usize,
  inner: RwLock<CacheInner>,
}

impl SessionCache {
  pub fn new(cap: usize) -> SessionCache {
    debug_assert!(cap > 0);
    SessionCache {
      cap,
      inner: RwLock::new(CacheInner {
        map: HashMap::new(),
        order: VecDeque::new(),
      }),
    }
  }

  pub fn insert(&self, session: SessionValue) -> bool {
    let key = session.session_id.as_bytes().to_vec();
    if key.is_empty() || key.len() > 32 {
      return false;
    }

    let mut inner = self.inner.write().unwrap();

    if inner.map.insert(key.clone(), Arc::new(session)).is_some() {
      inner.order.retain(|k| k != &key);
    }
    inner.order.push_back(key);

    while inner.map.len() > self.cap {
      if let Some(oldest) = inner.order.pop_front() {
        inner.map.remove(&oldest);
      }
    }

    true
  }

  pub fn lookup(&self, id: &[u8], now: TimeBase) -> Option<Arc<SessionValue>> {
    let mut inner = self.inner.write().unwrap();

    let hit = inner.map.get(id)?.clone();

    if hit.has_expired(now) {
      inner.map.remove(id);
      inner.order.retain(|k| k != id);
      return None;
    }

    // freshen
    inner.order.retain(|k| k != id);
    inner.order.push_back(id.to_vec());
    Some(hit)
  }

  pub fn delete(&self, id: &[u8]) {
    let mut inner = self.inner.write().unwrap();
    inner.map.remove(id);
    inner.order.retain(|k| k != id);
  }

  pub fn len(&self) -> usize {
    self.inner.read().unwrap().map.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::msgs::enums::{CipherSuite, ProtocolVersion};
  use crate::msgs::handshake::SessionID;

  fn session(id: u8, created: u64) -> SessionValue {
    SessionValue::new(
      ProtocolVersion::TLSv1_2,
      CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
      SessionID::new(&[id; 8]),
      vec![id; 48],
      false,
      "",
      b"",
      TimeBase::from_secs(created),
      60,
    )
  }

  #[test]
  fn insert_lookup_delete() {
    let cache = SessionCache::new(4);
    assert!(cache.insert(session(1, 100)));

    let now = TimeBase::from_secs(101);
    assert!(cache.lookup(&[1; 8], now).is_some());
    assert!(cache.lookup(&[9; 8], now).is_none());

    cache.delete(&[1; 8]);
    assert!(cache.lookup(&[1; 8], now).is_none());
  }

  #[test]
  fn empty_session_id_is_uncacheable() {
    let cache = SessionCache::new(4);
    let mut sv = session(1, 100);
    sv.session_id = SessionID::empty();
    assert!(!cache.insert(sv));
  }

  #[test]
  fn lru_eviction_prefers_stale_entries() {
    let cache = SessionCache::new(2);
    cache.insert(session(1, 100));
    cache.insert(session(2, 100));

    // touch 1 so 2 becomes the eviction candidate
    let now = TimeBase::from_secs(101);
    cache.lookup(&[1; 8], now);

    cache.insert(session(3, 100));
    assert_eq!(cache.len(), 2);
    assert!(cache.lookup(&[1; 8], now).is_some());
    assert!(cache.lookup(&[2; 8], now).is_none());
    assert!(cache.lookup(&[3; 8], now).is_some());
  }

  #[test]
  fn expired_entries_vanish_on_lookup() {
    let cache = SessionCache::new(4);
    cache.insert(session(1, 100));

    assert!(cache.lookup(&[1; 8], TimeBase::from_secs(160)).is_none());
    assert_eq!(cache.len(), 0);
  }
}
