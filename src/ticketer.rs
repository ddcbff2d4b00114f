use crate::error::Error;
use crate::msgs::codec::Codec;
use crate::msgs::persist::SessionValue;
use crate::provider::CryptoProvider;
use crate::suites::BulkAlgorithm;

use std::sync::{Arc, RwLock};
use zeroize::Zeroize;

/// Seconds since the Unix epoch, captured once and passed down: no
/// component reads the clock behind the caller's back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeBase(u64);

impl TimeBase {
  pub fn now() -> Result<TimeBase, Error> {
    let secs = std::time::SystemTime::now()
      .duration_since(std::time::UNIX_EPOCH)
      .map_err(|_| Error::Internal("system clock before the epoch"))?
      .as_secs();
    Ok(TimeBase(secs))
  }

  pub fn from_secs(secs: u64) -> TimeBase {
    TimeBase(secs)
  }

  pub fn secs(&self) -> u64 {
    self.0
  }
}

const KEY_NAME_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TICKET_AEAD: BulkAlgorithm = BulkAlgorithm::AES_256_GCM;
const TICKET_KEY_LEN: usize = 32;

/// How many superseded decryption keys we keep for in-flight tickets.
const MAX_DECRYPT_KEYS: usize = 4;

struct TicketKey {
  name: [u8; KEY_NAME_LEN],
  key: Vec<u8>,
}

impl Drop for TicketKey {
  fn drop(&mut self) {
    self.key.zeroize();
  }
}

struct RotatorState {
  enc: TicketKey,
  dec: Vec<TicketKey>,
}

/// Stateless session tickets: an AEAD seal over the encoded session,
/// prefixed with the name of the key that sealed it.
///
/// One key encrypts; a short tail of previous keys still decrypts, so
/// rotation does not orphan in-flight tickets.  A ticket sealed under a
/// superseded key resumes but is reported as needing renewal.
pub struct TicketRotator {
  provider: Arc<dyn CryptoProvider>,
  lifetime: u32,
  state: RwLock<RotatorState>,
}

impl TicketRotator {
  pub fn new(provider: Arc<dyn CryptoProvider>, lifetime: u32) -> Result<TicketRotator, Error> {
    let enc = TicketRotator::fresh_key(provider.as_ref())?;
    Ok(TicketRotator {
      provider,
      lifetime,
      state: RwLock::new(RotatorState {
        enc,
        dec: Vec::new(),
      }),
    })
  }

  fn fresh_key(provider: &dyn CryptoProvider) -> Result<TicketKey, Error> {
    let mut name = [0u8; KEY_NAME_LEN];
    provider.random(&mut name)?;
    let mut key = vec![0u8; TICKET_KEY_LEN];
    provider.random(&mut key)?;
    Ok(TicketKey { name, key })
  }

  pub fn get_lifetime(&self) -> u32 {
    self.lifetime
  }

  /// Swap in a fresh encryption key; the old one joins the decrypt set.
  pub fn rotate(&self) -> Result<(), Error> {
    let fresh = TicketRotator::fresh_key(self.provider.as_ref())?;
    let mut state = self.state.write().unwrap();

    let old = std::mem::replace(&mut state.enc, fresh);
    state.dec.insert(0, old);
    state.dec.truncate(MAX_DECRYPT_KEYS);
    Ok(())
  }

  pub fn encrypt(&self, session: &SessionValue) -> Option<Vec<u8>> {
    let state = self.state.read().unwrap();

    let mut nonce = [0u8; NONCE_LEN];
    self.provider.random(&mut nonce).ok()?;

    let sealed = self
      .provider
      .aead_seal(
        TICKET_AEAD,
        &state.enc.key,
        &nonce,
        &state.enc.name,
        &session.get_encoding(),
      )
      .ok()?;

    let mut ticket = Vec::with_capacity(KEY_NAME_LEN + NONCE_LEN + sealed.len());
    ticket.extend_from_slice(&state.enc.name);
    ticket.extend_from_slice(&nonce);
    ticket.extend_from_slice(&sealed);
    Some(ticket)
  }

  /// Open a ticket.  The second value reports whether the server should
  /// issue a replacement ticket: set for rotated keys, undecryptable
  /// blobs and sessions that decrypt but fail validity.
  pub fn decrypt(&self, ticket: &[u8], now: TimeBase) -> (Option<SessionValue>, bool) {
    if ticket.len() < KEY_NAME_LEN + NONCE_LEN {
      return (None, true);
    }

    let (name, rest) = ticket.split_at(KEY_NAME_LEN);
    let (nonce, sealed) = rest.split_at(NONCE_LEN);

    let state = self.state.read().unwrap();

    let (key, current) = if state.enc.name == name {
      (&state.enc, true)
    } else {
      match state.dec.iter().find(|k| k.name == name) {
        Some(key) => (key, false),
        None => return (None, true),
      }
    };

    let plain = match self
      .provider
      .aead_open(TICKET_AEAD, &key.key, nonce, name, sealed)
    {
      Ok(plain) => plain,
      Err(_) => return (None, true),
    };

    let session = match SessionValue::read_bytes(&plain) {
      Some(session) => session,
      None => return (None, true),
    };

    if session.has_expired(now) {
      return (None, true);
    }

    (Some(session), !current)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::msgs::enums::{CipherSuite, ProtocolVersion};
  use crate::msgs::handshake::SessionID;
  use crate::provider::RingProvider;

  fn rotator() -> TicketRotator {
    TicketRotator::new(Arc::new(RingProvider::new()), 7200).unwrap()
  }

  fn session() -> SessionValue {
    SessionValue::new(
      ProtocolVersion::TLSv1_2,
      CipherSuite::TLS_RSA_WITH_AES_128_GCM_SHA256,
      SessionID::new(&[2; 32]),
      vec![0x11; 48],
      true,
      "host.example",
      b"",
      TimeBase::from_secs(5000),
      600,
    )
  }

  #[test]
  fn round_trip_under_stable_keys() {
    let t = rotator();
    let ticket = t.encrypt(&session()).unwrap();
    let (resumed, renew) = t.decrypt(&ticket, TimeBase::from_secs(5001));
    assert_eq!(resumed.unwrap(), session());
    assert!(!renew);
  }

  #[test]
  fn rotation_still_decrypts_but_asks_for_renewal() {
    let t = rotator();
    let ticket = t.encrypt(&session()).unwrap();

    t.rotate().unwrap();
    let (resumed, renew) = t.decrypt(&ticket, TimeBase::from_secs(5001));
    assert!(resumed.is_some());
    assert!(renew);
  }

  #[test]
  fn deep_rotation_forgets_the_key() {
    let t = rotator();
    let ticket = t.encrypt(&session()).unwrap();

    for _ in 0..(MAX_DECRYPT_KEYS + 1) {
      t.rotate().unwrap();
    }

    let (resumed, renew) = t.decrypt(&ticket, TimeBase::from_secs(5001));
    assert!(resumed.is_none());
    assert!(renew);
  }

  #[test]
  fn expired_inner_session_reports_renewal() {
    let t = rotator();
    let ticket = t.encrypt(&session()).unwrap();

    let (resumed, renew) = t.decrypt(&ticket, TimeBase::from_secs(5000 + 600));
    assert!(resumed.is_none());
    assert!(renew);
  }

  #[test]
  fn garbage_is_rejected() {
    let t = rotator();
    let (resumed, renew) = t.decrypt(b"not a ticket", TimeBase::from_secs(1));
    assert!(resumed.is_none());
    assert!(renew);

    let mut ticket = t.encrypt(&session()).unwrap();
    let last = ticket.len() - 1;
    ticket[last] ^= 0xff;
    let (resumed, _) = t.decrypt(&ticket, TimeBase::from_secs(5001));
    assert!(resumed.is_none());
  }
}
