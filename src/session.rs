use crate::cache::SessionCache;
use crate::error::Error;
use crate::key_schedule::{prf, KeySchedule};
use crate::msgs::alert::AlertMessagePayload;
use crate::msgs::enums::{
  AlertDescription, AlertLevel, ContentType, HandshakeType, HashAlgorithm, ProtocolVersion,
};
use crate::msgs::handshake::{
  CertificatePayload, DtlsFraming, HandshakeMessagePayload, HandshakePayload,
};
use crate::msgs::message::{ChangeCipherSpecPayload, Message, MessagePayload};
use crate::msgs::persist::SessionValue;
use crate::provider::{CertVerifier, CryptoProvider, DirectionKeys, RecordLayer};
use crate::suites::SupportedCipherSuite;
use crate::ticketer::TicketRotator;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use zeroize::Zeroize;

/// What `step()` reports back to the owner of a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
  /// Nothing user-visible happened; feed more input when it arrives.
  WantMore,
  /// The handshake just completed.
  HandshakeComplete,
  /// Application data is waiting in the receive buffer.
  AppDataReady,
  /// A certificate decision is outstanding; answer and step again.
  NeedsCertCallback,
  /// A PSK decision is outstanding; answer and step again.
  NeedsPskCallback,
}

/// What an application callback (SNI, ALPN, ClientHello inspection) tells
/// the handshake to do.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CallbackAction {
  Ok,
  /// Decline to take part without affecting the handshake.
  Noack,
  Fatal(AlertDescription),
}

/// Which sides of a context keep a session cache.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionCacheMode {
  Off,
  ClientOnly,
  ServerOnly,
  Both,
}

impl SessionCacheMode {
  pub fn client_enabled(&self) -> bool {
    matches!(self, SessionCacheMode::ClientOnly | SessionCacheMode::Both)
  }

  pub fn server_enabled(&self) -> bool {
    matches!(self, SessionCacheMode::ServerOnly | SessionCacheMode::Both)
  }
}

/// Where a fatal error arose, for post-mortem inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorOrigin {
  pub state: &'static str,
  pub message: Option<HandshakeType>,
}

/// The explicit library context: providers plus the cross-connection
/// shared state (session caches, ticket keys).  Passed to every
/// connection constructor; nothing hides in globals.
pub struct LibContext {
  pub provider: Arc<dyn CryptoProvider>,
  pub verifier: Arc<dyn CertVerifier>,
  pub server_sessions: SessionCache,
  client_sessions: RwLock<HashMap<String, SessionValue>>,
  pub ticketer: Option<TicketRotator>,
}

impl LibContext {
  pub fn new(provider: Arc<dyn CryptoProvider>, verifier: Arc<dyn CertVerifier>) -> LibContext {
    LibContext {
      provider,
      verifier,
      server_sessions: SessionCache::new(256),
      client_sessions: RwLock::new(HashMap::new()),
      ticketer: None,
    }
  }

  /// Enable stateless tickets, with fresh keys and the given lifetime.
  pub fn with_tickets(mut self, lifetime: u32) -> Result<LibContext, Error> {
    self.ticketer = Some(TicketRotator::new(self.provider.clone(), lifetime)?);
    Ok(self)
  }

  pub fn remember_client_session(&self, host: &str, session: SessionValue) {
    self
      .client_sessions
      .write()
      .unwrap()
      .insert(host.to_string(), session);
  }

  pub fn client_session_for(&self, host: &str) -> Option<SessionValue> {
    self.client_sessions.read().unwrap().get(host).cloned()
  }

  pub fn forget_client_session(&self, host: &str) {
    self.client_sessions.write().unwrap().remove(host);
  }
}

/// The two hello randoms.
#[derive(Clone)]
pub struct ConnectionRandoms {
  pub client: [u8; 32],
  pub server: [u8; 32],
}

impl ConnectionRandoms {
  pub fn new() -> ConnectionRandoms {
    ConnectionRandoms {
      client: [0u8; 32],
      server: [0u8; 32],
    }
  }
}

impl Default for ConnectionRandoms {
  fn default() -> ConnectionRandoms {
    ConnectionRandoms::new()
  }
}

/// TLS 1.2-family secrets: the master secret and everything the PRF
/// derives from it.  TLCP 1.1 shares this machinery with its own hash.
pub struct SessionSecrets {
  provider: Arc<dyn CryptoProvider>,
  hash: HashAlgorithm,
  pub randoms: ConnectionRandoms,
  master_secret: [u8; 48],
}

impl Drop for SessionSecrets {
  fn drop(&mut self) {
    self.master_secret.zeroize();
  }
}

impl SessionSecrets {
  /// Full handshake: derive the master secret from the premaster.
  pub fn new(
    provider: Arc<dyn CryptoProvider>,
    hash: HashAlgorithm,
    randoms: &ConnectionRandoms,
    premaster: &[u8],
  ) -> Result<SessionSecrets, Error> {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(&randoms.client);
    seed.extend_from_slice(&randoms.server);

    let ms = prf(
      provider.as_ref(),
      hash,
      premaster,
      b"master secret",
      &seed,
      48,
    )?;

    Ok(SessionSecrets::from_master(provider, hash, randoms, &ms))
  }

  /// Full handshake with extended master secret: bind to the session
  /// hash instead of the randoms.
  pub fn new_ems(
    provider: Arc<dyn CryptoProvider>,
    hash: HashAlgorithm,
    randoms: &ConnectionRandoms,
    premaster: &[u8],
    session_hash: &[u8],
  ) -> Result<SessionSecrets, Error> {
    let ms = prf(
      provider.as_ref(),
      hash,
      premaster,
      b"extended master secret",
      session_hash,
      48,
    )?;

    Ok(SessionSecrets::from_master(provider, hash, randoms, &ms))
  }

  /// Resumption: reuse the stored master secret.
  pub fn new_resume(
    provider: Arc<dyn CryptoProvider>,
    hash: HashAlgorithm,
    randoms: &ConnectionRandoms,
    master: &[u8],
  ) -> SessionSecrets {
    SessionSecrets::from_master(provider, hash, randoms, master)
  }

  fn from_master(
    provider: Arc<dyn CryptoProvider>,
    hash: HashAlgorithm,
    randoms: &ConnectionRandoms,
    master: &[u8],
  ) -> SessionSecrets {
    let mut master_secret = [0u8; 48];
    master_secret.copy_from_slice(master);
    SessionSecrets {
      provider,
      hash,
      randoms: randoms.clone(),
      master_secret,
    }
  }

  pub fn get_master_secret(&self) -> Vec<u8> {
    self.master_secret.to_vec()
  }

  fn verify_data(&self, label: &'static [u8], handshake_hash: &[u8]) -> Result<Vec<u8>, Error> {
    Ok(prf(
      self.provider.as_ref(),
      self.hash,
      &self.master_secret,
      label,
      handshake_hash,
      12,
    )?)
  }

  pub fn client_verify_data(&self, handshake_hash: &[u8]) -> Result<Vec<u8>, Error> {
    self.verify_data(b"client finished", handshake_hash)
  }

  pub fn server_verify_data(&self, handshake_hash: &[u8]) -> Result<Vec<u8>, Error> {
    self.verify_data(b"server finished", handshake_hash)
  }

  /// The record-layer key block.
  pub fn make_key_block(&self, len: usize) -> Result<Vec<u8>, Error> {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(&self.randoms.server);
    seed.extend_from_slice(&self.randoms.client);

    Ok(prf(
      self.provider.as_ref(),
      self.hash,
      &self.master_secret,
      b"key expansion",
      &seed,
      len,
    )?)
  }
}

/// What content and handshake kinds a state is willing to see next.
pub struct Expectation {
  pub content_types: &'static [ContentType],
  pub handshake_types: &'static [HandshakeType],
}

impl Expectation {
  pub fn check(&self, m: &Message) -> Result<(), Error> {
    if !self.content_types.contains(&m.typ) {
      return Err(Error::InappropriateMessage {
        expect_types: self.content_types.to_vec(),
        got_type: m.typ,
      });
    }

    if let Some(hstyp) = m.handshake_type() {
      if !self.handshake_types.is_empty() && !self.handshake_types.contains(&hstyp) {
        return Err(Error::InappropriateHandshakeMessage {
          expect_types: self.handshake_types.to_vec(),
          got_type: hstyp,
        });
      }
    }

    Ok(())
  }
}

/// State shared by the client and server session implementations: the
/// record-layer handle, negotiated parameters, key-schedule state, alert
/// bookkeeping and the DTLS flight buffer.
pub struct SessionCommon {
  pub provider: Arc<dyn CryptoProvider>,
  pub record: Box<dyn RecordLayer>,
  pub is_client: bool,
  pub is_datagram: bool,

  /// Set once version selection concludes.
  pub negotiated_version: Option<ProtocolVersion>,
  suite: Option<&'static SupportedCipherSuite>,

  pub alpn_protocol: Option<Vec<u8>>,
  pub peer_certificates: Option<CertificatePayload>,

  /// TLS 1.2 family.
  pub secrets: Option<SessionSecrets>,
  /// TLS 1.3.
  pub key_schedule: Option<KeySchedule>,

  /// Most recent Finished verify_data, kept for secure renegotiation.
  pub client_verify_data: Vec<u8>,
  pub server_verify_data: Vec<u8>,

  pub ems: bool,
  pub etm: bool,

  pub traffic: bool,
  pub sink: bool,

  pub last_alert_sent: Option<AlertMessagePayload>,
  pub last_alert_received: Option<AlertMessagePayload>,
  pub error_origin: Option<ErrorOrigin>,

  /// One unencrypted middlebox-compatibility CCS may be tolerated while
  /// this is set.
  pub middlebox_ccs_ok: bool,

  received_plaintext: Vec<u8>,
  sendable_plaintext: Vec<Vec<u8>>,

  write_epoch: u32,
  read_epoch: u32,

  dtls_next_send_seq: u16,
  flight: Vec<(ContentType, Vec<u8>)>,
}

impl SessionCommon {
  pub fn new(
    provider: Arc<dyn CryptoProvider>,
    record: Box<dyn RecordLayer>,
    is_client: bool,
    is_datagram: bool,
  ) -> SessionCommon {
    SessionCommon {
      provider,
      record,
      is_client,
      is_datagram,
      negotiated_version: None,
      suite: None,
      alpn_protocol: None,
      peer_certificates: None,
      secrets: None,
      key_schedule: None,
      client_verify_data: Vec::new(),
      server_verify_data: Vec::new(),
      ems: false,
      etm: false,
      traffic: false,
      sink: false,
      last_alert_sent: None,
      last_alert_received: None,
      error_origin: None,
      middlebox_ccs_ok: false,
      received_plaintext: Vec::new(),
      sendable_plaintext: Vec::new(),
      write_epoch: 0,
      read_epoch: 0,
      dtls_next_send_seq: 0,
      flight: Vec::new(),
    }
  }

  pub fn set_suite(&mut self, suite: &'static SupportedCipherSuite) {
    self.suite = Some(suite);
  }

  pub fn get_suite(&self) -> &'static SupportedCipherSuite {
    self.suite.expect("cipher suite not yet chosen")
  }

  pub fn get_suite_opt(&self) -> Option<&'static SupportedCipherSuite> {
    self.suite
  }

  pub fn is_tls13(&self) -> bool {
    self.negotiated_version == Some(ProtocolVersion::TLSv1_3)
  }

  /// The version written into record and message headers.
  pub fn wire_version(&self) -> ProtocolVersion {
    match self.negotiated_version {
      Some(ProtocolVersion::TLCPv1_1) => ProtocolVersion::TLCPv1_1,
      Some(ProtocolVersion::DTLSv1_2) => ProtocolVersion::DTLSv1_2,
      _ => ProtocolVersion::TLSv1_2,
    }
  }

  /// Build a handshake message, assigning the DTLS sequence number when
  /// the transport needs one.  The caller adds it to the transcript and
  /// then sends it; the sequence number must be fixed before either.
  pub fn build_hs(&mut self, typ: HandshakeType, payload: HandshakePayload) -> Message {
    let dtls = if self.is_datagram {
      let seq = self.dtls_next_send_seq;
      self.dtls_next_send_seq += 1;
      Some(DtlsFraming { message_seq: seq })
    } else {
      None
    };

    Message {
      typ: ContentType::Handshake,
      version: self.wire_version(),
      payload: MessagePayload::Handshake(HandshakeMessagePayload { typ, dtls, payload }),
    }
  }

  pub fn send_msg(&mut self, m: Message) {
    let mut bytes = Vec::new();
    m.payload.encode(&mut bytes);

    if self.is_datagram && m.typ != ContentType::ApplicationData {
      self.flight.push((m.typ, bytes.clone()));
    }

    self.record.send(m.typ, &bytes);
  }

  /// A new flight starts: forget the previous one.
  pub fn start_flight(&mut self) {
    self.flight.clear();
  }

  /// DTLS retransmission entry point; the owner drives the timer.
  pub fn retransmit_flight(&mut self) {
    let flight = self.flight.clone();
    for (typ, bytes) in flight {
      self.record.send(typ, &bytes);
    }
    self.record.flush();
  }

  pub fn send_ccs(&mut self) {
    let m = Message {
      typ: ContentType::ChangeCipherSpec,
      version: self.wire_version(),
      payload: MessagePayload::ChangeCipherSpec(ChangeCipherSpecPayload),
    };
    self.send_msg(m);
  }

  pub fn send_warning_alert(&mut self, desc: AlertDescription) {
    let m = Message::build_alert(AlertLevel::Warning, desc);
    self.last_alert_sent = Some(AlertMessagePayload {
      level: AlertLevel::Warning,
      description: desc,
    });
    self.send_msg(m);
  }

  /// Emit a fatal alert, close the write side and drop into the sink
  /// state: no further handshake traffic in either direction.
  pub fn send_fatal_alert(&mut self, desc: AlertDescription) {
    if self.sink {
      return;
    }

    let m = Message::build_alert(AlertLevel::Fatal, desc);
    self.last_alert_sent = Some(AlertMessagePayload {
      level: AlertLevel::Fatal,
      description: desc,
    });
    self.send_msg(m);
    self.record.flush();
    self.record.close();
    self.sink = true;
  }

  pub fn fatal(&mut self, err: Error, state: &'static str, kind: Option<HandshakeType>) -> Error {
    self.error_origin = Some(ErrorOrigin {
      state,
      message: kind,
    });
    self.send_fatal_alert(err.alert());
    err
  }

  fn next_write_keys(&mut self, secret: Vec<u8>) -> DirectionKeys {
    self.write_epoch += 1;
    DirectionKeys {
      epoch: self.write_epoch,
      suite: self.get_suite().suite,
      secret,
    }
  }

  fn next_read_keys(&mut self, secret: Vec<u8>) -> DirectionKeys {
    self.read_epoch += 1;
    DirectionKeys {
      epoch: self.read_epoch,
      suite: self.get_suite().suite,
      secret,
    }
  }

  pub fn install_write_key(&mut self, secret: Vec<u8>) {
    let keys = self.next_write_keys(secret);
    self.record.set_write_key(keys);
  }

  pub fn install_read_key(&mut self, secret: Vec<u8>) {
    let keys = self.next_read_keys(secret);
    self.record.set_read_key(keys);
  }

  /// TLS 1.2 family: expand the key block and hand both directions to
  /// the record layer.  The record layer applies each at its CCS.
  pub fn start_encryption_tls12(&mut self) -> Result<(), Error> {
    let block_len = self.get_suite().key_block_len();
    let block = self
      .secrets
      .as_ref()
      .expect("no TLS 1.2 secrets")
      .make_key_block(block_len)?;

    self.install_write_key(block.clone());
    self.install_read_key(block);
    Ok(())
  }

  pub fn take_received_plaintext(&mut self, bytes: &[u8]) {
    self.received_plaintext.extend_from_slice(bytes);
  }

  pub fn has_received_plaintext(&self) -> bool {
    !self.received_plaintext.is_empty()
  }

  pub fn read_received(&mut self, buf: &mut [u8]) -> usize {
    let take = buf.len().min(self.received_plaintext.len());
    buf[..take].copy_from_slice(&self.received_plaintext[..take]);
    self.received_plaintext.drain(..take);
    take
  }

  /// Application data written before the handshake finished queues here.
  pub fn buffer_plaintext(&mut self, bytes: &[u8]) {
    self.sendable_plaintext.push(bytes.to_vec());
  }

  pub fn flush_plaintext(&mut self) {
    if !self.traffic {
      return;
    }
    let queued = std::mem::take(&mut self.sendable_plaintext);
    for chunk in queued {
      self.record.send(ContentType::ApplicationData, &chunk);
    }
    self.record.flush();
  }

  pub fn send_close_notify(&mut self) {
    if self.sink {
      return;
    }
    let m = Message::build_alert(AlertLevel::Warning, AlertDescription::CloseNotify);
    self.last_alert_sent = Some(AlertMessagePayload {
      level: AlertLevel::Warning,
      description: AlertDescription::CloseNotify,
    });
    self.send_msg(m);
    self.record.flush();
    self.record.close();
  }

  /// Common processing of a peer alert.  Returns an error only for
  /// fatal alerts and close_notify.
  pub fn process_alert(&mut self, alert: &AlertMessagePayload) -> Result<(), Error> {
    self.last_alert_received = Some(alert.clone());

    if alert.description == AlertDescription::CloseNotify {
      self.sink = true;
      return Err(Error::AlertReceived(AlertDescription::CloseNotify));
    }

    if alert.level == AlertLevel::Fatal {
      self.sink = true;
      return Err(Error::AlertReceived(alert.description));
    }

    // warning alerts: surfaced via last_alert_received, not fatal
    info!("TLS alert warning received: {:?}", alert);
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::provider::RingProvider;

  #[test]
  fn verify_data_differs_by_role_and_hash() {
    let provider: Arc<dyn CryptoProvider> = Arc::new(RingProvider::new());
    let mut randoms = ConnectionRandoms::new();
    randoms.client = [1; 32];
    randoms.server = [2; 32];

    let secrets = SessionSecrets::new(
      provider,
      HashAlgorithm::SHA256,
      &randoms,
      &[0x0bu8; 48],
    )
    .unwrap();

    let hash = vec![0xcc; 32];
    let client = secrets.client_verify_data(&hash).unwrap();
    let server = secrets.server_verify_data(&hash).unwrap();
    assert_eq!(client.len(), 12);
    assert_ne!(client, server);
  }

  #[test]
  fn ems_binds_to_session_hash() {
    let provider: Arc<dyn CryptoProvider> = Arc::new(RingProvider::new());
    let randoms = ConnectionRandoms::new();

    let a = SessionSecrets::new_ems(
      provider.clone(),
      HashAlgorithm::SHA256,
      &randoms,
      &[0x0bu8; 48],
      &[1u8; 32],
    )
    .unwrap();
    let b = SessionSecrets::new_ems(
      provider,
      HashAlgorithm::SHA256,
      &randoms,
      &[0x0bu8; 48],
      &[2u8; 32],
    )
    .unwrap();

    assert_ne!(a.get_master_secret(), b.get_master_secret());
  }
}
