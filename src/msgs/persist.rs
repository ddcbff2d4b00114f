use crate::msgs::base::{PayloadU16, PayloadU8};
use crate::msgs::codec;
use crate::msgs::codec::{Codec, Reader};
use crate::msgs::enums::{CipherSuite, ProtocolVersion};
use crate::msgs::handshake::{CertificatePayload, SessionID};
use crate::suites;
use crate::ticketer::TimeBase;

use zeroize::Zeroize;

/// A resumable session, as stored in the server cache, sealed into
/// tickets, and remembered by clients.
///
/// `master_secret` holds the TLS 1.2 master secret, or the TLS 1.3
/// resumption PSK already derived from the resumption master secret and
/// the ticket nonce.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionValue {
  pub version: ProtocolVersion,
  pub cipher_suite: CipherSuite,
  pub session_id: SessionID,
  pub master_secret: PayloadU8,
  pub extended_ms: bool,
  pub sni: PayloadU8,
  /// Hash of the peer's authentication identity; resumption requires it
  /// unchanged.
  pub peer_cert_hash: PayloadU8,
  pub client_cert_chain: Option<CertificatePayload>,
  pub sid_ctx: PayloadU8,
  pub creation_time: u64,
  pub lifetime_secs: u32,
  pub age_add: u32,
  /// Client side: the ticket to present next time.  Empty on the server.
  pub ticket: PayloadU16,
}

impl Drop for SessionValue {
  fn drop(&mut self) {
    self.master_secret.0.zeroize();
  }
}

impl Codec for SessionValue {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.version.encode(bytes);
    self.cipher_suite.encode(bytes);
    self.session_id.encode(bytes);
    self.master_secret.encode(bytes);
    codec::encode_u8(u8::from(self.extended_ms), bytes);
    self.sni.encode(bytes);
    self.peer_cert_hash.encode(bytes);
    match self.client_cert_chain {
      Some(ref chain) => {
        codec::encode_u8(1, bytes);
        chain.encode(bytes);
      }
      None => codec::encode_u8(0, bytes),
    }
    self.sid_ctx.encode(bytes);
    codec::encode_u64(self.creation_time, bytes);
    codec::encode_u32(self.lifetime_secs, bytes);
    codec::encode_u32(self.age_add, bytes);
    self.ticket.encode(bytes);
  }

  fn read(r: &mut Reader) -> Option<SessionValue> {
    let version = ProtocolVersion::read(r)?;
    let cipher_suite = CipherSuite::read(r)?;
    let session_id = SessionID::read(r)?;
    let master_secret = PayloadU8::read(r)?;
    let extended_ms = codec::read_u8(r)? == 1;
    let sni = PayloadU8::read(r)?;
    let peer_cert_hash = PayloadU8::read(r)?;
    let client_cert_chain = match codec::read_u8(r)? {
      0 => None,
      1 => Some(CertificatePayload::read(r)?),
      _ => return None,
    };

    Some(SessionValue {
      version,
      cipher_suite,
      session_id,
      master_secret,
      extended_ms,
      sni,
      peer_cert_hash,
      client_cert_chain,
      sid_ctx: PayloadU8::read(r)?,
      creation_time: codec::read_u64(r)?,
      lifetime_secs: codec::read_u32(r)?,
      age_add: codec::read_u32(r)?,
      ticket: PayloadU16::read(r)?,
    })
  }
}

impl SessionValue {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    version: ProtocolVersion,
    cipher_suite: CipherSuite,
    session_id: SessionID,
    master_secret: Vec<u8>,
    extended_ms: bool,
    sni: &str,
    sid_ctx: &[u8],
    now: TimeBase,
    lifetime_secs: u32,
  ) -> SessionValue {
    SessionValue {
      version,
      cipher_suite,
      session_id,
      master_secret: PayloadU8::new(master_secret),
      extended_ms,
      sni: PayloadU8::new(sni.as_bytes().to_vec()),
      peer_cert_hash: PayloadU8::empty(),
      client_cert_chain: None,
      sid_ctx: PayloadU8::new(sid_ctx.to_vec()),
      creation_time: now.secs(),
      lifetime_secs,
      age_add: 0,
      ticket: PayloadU16::empty(),
    }
  }

  pub fn set_ticket(&mut self, ticket: Vec<u8>) {
    self.ticket = PayloadU16::new(ticket);
  }

  pub fn take_ticket(&mut self) -> Vec<u8> {
    std::mem::take(&mut self.ticket.0)
  }

  pub fn sni_str(&self) -> &[u8] {
    &self.sni.0
  }

  pub fn has_expired(&self, now: TimeBase) -> bool {
    now.secs() >= self.creation_time.saturating_add(u64::from(self.lifetime_secs))
  }

  /// The §3 resumption-validity rule: unexpired, suite hash compatible
  /// for TLS 1.3, matching session-id-context.
  pub fn can_resume_with(
    &self,
    suite: &suites::SupportedCipherSuite,
    sid_ctx: &[u8],
    now: TimeBase,
  ) -> bool {
    if self.has_expired(now) {
      return false;
    }

    if self.sid_ctx.0 != sid_ctx {
      return false;
    }

    match suites::lookup(self.cipher_suite) {
      Some(stored) if self.version == ProtocolVersion::TLSv1_3 => {
        stored.get_hash() == suite.get_hash()
      }
      Some(stored) => stored.suite == suite.suite,
      None => false,
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::msgs::enums::{CipherSuite, ProtocolVersion};
  use crate::suites;

  fn sample(version: ProtocolVersion, suite: CipherSuite) -> SessionValue {
    SessionValue::new(
      version,
      suite,
      SessionID::new(&[1; 16]),
      vec![0x5a; 48],
      true,
      "example.com",
      b"ctx",
      TimeBase::from_secs(1000),
      300,
    )
  }

  #[test]
  fn round_trip() {
    let mut sv = sample(
      ProtocolVersion::TLSv1_2,
      CipherSuite::TLS_RSA_WITH_AES_128_GCM_SHA256,
    );
    sv.client_cert_chain = Some(vec![crate::msgs::base::PayloadU24::new(b"cert".to_vec())]);
    sv.set_ticket(b"ticket-bytes".to_vec());

    let bytes = sv.get_encoding();
    let parsed = SessionValue::read_bytes(&bytes).unwrap();
    assert_eq!(parsed, sv);
  }

  #[test]
  fn expiry_is_absolute() {
    let sv = sample(
      ProtocolVersion::TLSv1_2,
      CipherSuite::TLS_RSA_WITH_AES_128_GCM_SHA256,
    );
    assert!(!sv.has_expired(TimeBase::from_secs(1299)));
    assert!(sv.has_expired(TimeBase::from_secs(1300)));
  }

  #[test]
  fn tls13_resumption_requires_matching_hash() {
    let sv = sample(ProtocolVersion::TLSv1_3, CipherSuite::TLS13_AES_128_GCM_SHA256);
    let now = TimeBase::from_secs(1001);

    // same hash, different suite: acceptable
    assert!(sv.can_resume_with(&suites::TLS13_CHACHA20_POLY1305_SHA256, b"ctx", now));
    // different hash: not acceptable
    assert!(!sv.can_resume_with(&suites::TLS13_AES_256_GCM_SHA384, b"ctx", now));
    // wrong sid_ctx: not acceptable
    assert!(!sv.can_resume_with(&suites::TLS13_AES_128_GCM_SHA256, b"other", now));
  }

  #[test]
  fn tls12_resumption_requires_exact_suite() {
    let sv = sample(
      ProtocolVersion::TLSv1_2,
      CipherSuite::TLS_RSA_WITH_AES_128_GCM_SHA256,
    );
    let now = TimeBase::from_secs(1001);
    assert!(sv.can_resume_with(&suites::TLS_RSA_WITH_AES_128_GCM_SHA256, b"ctx", now));
    assert!(!sv.can_resume_with(&suites::TLS_RSA_WITH_AES_256_GCM_SHA384, b"ctx", now));
  }
}
