use crate::client_hs;
use crate::error::Error;
use crate::hash_hs::{HandshakeHash, HandshakeHashBuffer};
use crate::key_schedule::KeySchedule;
use crate::msgs::enums::{
  ContentType, ExtensionType, NamedGroup, ProtocolVersion, SignatureScheme,
};
use crate::msgs::handshake::{
  ASN1Cert, CertificatePayload, CertificateRequestPayloadTLS13, ServerKeyExchangePayload,
  SessionID,
};
use crate::msgs::message::{Message, MessagePayload};
use crate::msgs::persist::SessionValue;
use crate::negotiation::VersionRange;
use crate::provider::{ActiveKeyExchange, RecordLayer, Signer};
use crate::session::{
  ConnectionRandoms, LibContext, SessionCacheMode, SessionCommon, Status,
};
use crate::suites::{self, SupportedCipherSuite};

use std::sync::Arc;
use zeroize::Zeroize;

/// An externally provisioned pre-shared key.
#[derive(Clone)]
pub struct ExternalPsk {
  pub identity: Vec<u8>,
  pub key: Vec<u8>,
}

impl Drop for ExternalPsk {
  fn drop(&mut self) {
    self.key.zeroize();
  }
}

/// Legacy (≤1.2) PSK callback: identity hint to (identity, key).
pub type PskClientCallback =
  dyn Fn(Option<&[u8]>) -> Option<(Vec<u8>, Vec<u8>)> + Send + Sync;

/// Client-side configuration, mirroring the documented surface: version
/// window, the two suite lists, groups, signature schemes, ALPN,
/// resumption and client-auth material.
pub struct ClientConfig {
  pub versions: VersionRange,
  pub cipher_suites: Vec<&'static SupportedCipherSuite>,
  pub tls13_cipher_suites: Vec<&'static SupportedCipherSuite>,
  pub groups: Vec<NamedGroup>,
  /// Groups to send key shares for; `None` shares every group the
  /// provider can start.
  pub key_share_groups: Option<Vec<NamedGroup>>,
  pub sig_algs: Vec<SignatureScheme>,
  pub alpn_protocols: Vec<Vec<u8>>,

  pub session_cache_mode: SessionCacheMode,
  pub enable_tickets: bool,
  /// Offer extended master secret (≤1.2).
  pub offer_ems: bool,
  /// Offer encrypt-then-MAC for CBC suites (≤1.2).
  pub offer_etm: bool,
  /// Answer a server HelloRequest with a new handshake.
  pub renegotiation_allowed: bool,
  /// Advertise TLS 1.3 post-handshake authentication.
  pub post_handshake_auth: bool,

  pub client_auth_cert: Option<(CertificatePayload, Arc<dyn Signer>)>,
  pub external_psk: Option<ExternalPsk>,
  pub psk_client_callback: Option<Arc<PskClientCallback>>,
  /// A pre-built session to resume, overriding the context cache.
  pub resumption_session: Option<SessionValue>,
}

impl ClientConfig {
  pub fn new() -> ClientConfig {
    ClientConfig {
      versions: VersionRange::new(ProtocolVersion::TLSv1_2, ProtocolVersion::TLSv1_3),
      cipher_suites: suites::default_tls12_suites(),
      tls13_cipher_suites: suites::default_tls13_suites(),
      groups: vec![
        NamedGroup::X25519,
        NamedGroup::secp256r1,
        NamedGroup::secp384r1,
      ],
      key_share_groups: None,
      sig_algs: default_sig_algs(),
      alpn_protocols: Vec::new(),
      session_cache_mode: SessionCacheMode::ClientOnly,
      enable_tickets: true,
      offer_ems: true,
      offer_etm: true,
      renegotiation_allowed: true,
      post_handshake_auth: false,
      client_auth_cert: None,
      external_psk: None,
      psk_client_callback: None,
      resumption_session: None,
    }
  }

  /// All suites we may offer, most preferred first.
  pub fn all_suites(&self) -> Vec<&'static SupportedCipherSuite> {
    let mut ret = Vec::new();
    if self.versions.contains(ProtocolVersion::TLSv1_3) {
      ret.extend_from_slice(&self.tls13_cipher_suites);
    }
    ret.extend_from_slice(&self.cipher_suites);
    ret
  }

  pub fn find_cipher_suite(&self, suite: crate::msgs::enums::CipherSuite) -> Option<&'static SupportedCipherSuite> {
    self.all_suites().into_iter().find(|scs| scs.suite == suite)
  }
}

impl Default for ClientConfig {
  fn default() -> ClientConfig {
    ClientConfig::new()
  }
}

pub(crate) fn default_sig_algs() -> Vec<SignatureScheme> {
  vec![
    SignatureScheme::ED25519,
    SignatureScheme::ECDSA_NISTP256_SHA256,
    SignatureScheme::ECDSA_NISTP384_SHA384,
    SignatureScheme::RSA_PSS_SHA256,
    SignatureScheme::RSA_PSS_SHA384,
    SignatureScheme::RSA_PKCS1_SHA256,
    SignatureScheme::RSA_PKCS1_SHA384,
    SignatureScheme::RSA_PKCS1_SHA512,
  ]
}

/// The PSK a ClientHello offered, kept until the server answers.
pub(crate) struct OfferedPsk {
  pub identity: Vec<u8>,
  pub psk: Vec<u8>,
  pub external: bool,
}

impl Drop for OfferedPsk {
  fn drop(&mut self) {
    self.psk.zeroize();
  }
}

/// Transient client handshake workspace; dropped when the handshake
/// concludes.
pub(crate) struct ClientHandshakeData {
  pub transcript_buffer: Option<HandshakeHashBuffer>,
  pub transcript: Option<HandshakeHash>,
  pub randoms: ConnectionRandoms,
  pub session_id: SessionID,
  pub dtls_cookie: Vec<u8>,
  pub sent_extensions: Vec<ExtensionType>,
  pub offered_key_shares: Vec<Box<dyn ActiveKeyExchange>>,
  pub hrr_seen: bool,
  pub resuming_session: Option<SessionValue>,
  pub offered_psk: Option<OfferedPsk>,
  pub early_key_schedule: Option<KeySchedule>,
  pub server_cert_chain: CertificatePayload,
  pub server_kx: Option<ServerKeyExchangePayload>,
  pub doing_client_auth: bool,
  pub client_auth_sigscheme: Option<SignatureScheme>,
  pub tls13_cert_request: Option<CertificateRequestPayloadTLS13>,
  pub must_issue_new_ticket: bool,
  pub new_ticket: Vec<u8>,
  pub new_ticket_lifetime: u32,
  pub doing_resume: bool,
  pub renegotiating: bool,
  pub send_ccs_before_finished: bool,
}

impl ClientHandshakeData {
  pub fn new() -> ClientHandshakeData {
    ClientHandshakeData {
      transcript_buffer: Some(HandshakeHashBuffer::new()),
      transcript: None,
      randoms: ConnectionRandoms::new(),
      session_id: SessionID::empty(),
      dtls_cookie: Vec::new(),
      sent_extensions: Vec::new(),
      offered_key_shares: Vec::new(),
      hrr_seen: false,
      resuming_session: None,
      offered_psk: None,
      early_key_schedule: None,
      server_cert_chain: Vec::new(),
      server_kx: None,
      doing_client_auth: false,
      client_auth_sigscheme: None,
      tls13_cert_request: None,
      must_issue_new_ticket: false,
      new_ticket: Vec::new(),
      new_ticket_lifetime: 0,
      doing_resume: false,
      renegotiating: false,
      send_ccs_before_finished: false,
    }
  }

  pub fn transcript(&mut self) -> &mut HandshakeHash {
    self.transcript.as_mut().expect("transcript not started")
  }
}

/// Client connection states.  Each has a handler in `client_hs`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnState {
  ExpectServerHello,
  ExpectEncryptedExtensions,
  ExpectCertOrCertReq13,
  ExpectCertificate13,
  ExpectCertificateVerify13,
  ExpectFinished13,
  ExpectCertificate12,
  ExpectServerKx,
  ExpectDoneOrCertReq,
  ExpectCcs,
  ExpectFinished12,
  ExpectNewTicket,
  ExpectCcsResume,
  ExpectFinishedResume,
  ExpectNewTicketResume,
  Traffic12,
  Traffic13,
  Closed,
}

impl ConnState {
  pub fn label(&self) -> &'static str {
    match self {
      ConnState::ExpectServerHello => "ExpectServerHello",
      ConnState::ExpectEncryptedExtensions => "ExpectEncryptedExtensions",
      ConnState::ExpectCertOrCertReq13 => "ExpectCertOrCertReq13",
      ConnState::ExpectCertificate13 => "ExpectCertificate13",
      ConnState::ExpectCertificateVerify13 => "ExpectCertificateVerify13",
      ConnState::ExpectFinished13 => "ExpectFinished13",
      ConnState::ExpectCertificate12 => "ExpectCertificate12",
      ConnState::ExpectServerKx => "ExpectServerKx",
      ConnState::ExpectDoneOrCertReq => "ExpectDoneOrCertReq",
      ConnState::ExpectCcs => "ExpectCcs",
      ConnState::ExpectFinished12 => "ExpectFinished12",
      ConnState::ExpectNewTicket => "ExpectNewTicket",
      ConnState::ExpectCcsResume => "ExpectCcsResume",
      ConnState::ExpectFinishedResume => "ExpectFinishedResume",
      ConnState::ExpectNewTicketResume => "ExpectNewTicketResume",
      ConnState::Traffic12 => "Traffic12",
      ConnState::Traffic13 => "Traffic13",
      ConnState::Closed => "Closed",
    }
  }

  pub fn is_traffic(&self) -> bool {
    matches!(self, ConnState::Traffic12 | ConnState::Traffic13)
  }
}

/// A client connection: configuration, shared machinery, and the
/// handshake state machine driven through [`ClientSession::step`].
pub struct ClientSession {
  pub(crate) ctx: Arc<LibContext>,
  pub(crate) config: Arc<ClientConfig>,
  pub(crate) common: SessionCommon,
  pub(crate) hs: Option<ClientHandshakeData>,
  pub(crate) state: ConnState,
  pub(crate) server_name: String,
  pub(crate) resumption_master_secret: Vec<u8>,
  /// Transcript through the client Finished, retained for TLS 1.3
  /// post-handshake authentication.
  pub(crate) retained_transcript: Option<HandshakeHash>,
  terminal: Option<Error>,
}

impl ClientSession {
  pub fn new(
    ctx: Arc<LibContext>,
    config: Arc<ClientConfig>,
    record: Box<dyn RecordLayer>,
    server_name: &str,
  ) -> Result<ClientSession, Error> {
    let is_datagram = config.versions.min.is_datagram();
    let mut sess = ClientSession {
      common: SessionCommon::new(ctx.provider.clone(), record, true, is_datagram),
      ctx,
      config,
      hs: None,
      state: ConnState::ExpectServerHello,
      server_name: server_name.to_string(),
      resumption_master_secret: Vec::new(),
      retained_transcript: None,
      terminal: None,
    };

    client_hs::start_handshake(&mut sess, false)?;
    Ok(sess)
  }

  pub fn is_handshaking(&self) -> bool {
    !self.state.is_traffic() && self.state != ConnState::Closed
  }

  pub fn negotiated_version(&self) -> Option<ProtocolVersion> {
    self.common.negotiated_version
  }

  pub fn alpn_protocol(&self) -> Option<&[u8]> {
    self.common.alpn_protocol.as_deref()
  }

  pub fn peer_certificates(&self) -> Option<&[ASN1Cert]> {
    self.common.peer_certificates.as_deref()
  }

  pub fn last_alert_sent(&self) -> Option<&crate::msgs::alert::AlertMessagePayload> {
    self.common.last_alert_sent.as_ref()
  }

  pub fn last_alert_received(&self) -> Option<&crate::msgs::alert::AlertMessagePayload> {
    self.common.last_alert_received.as_ref()
  }

  pub fn error_origin(&self) -> Option<&crate::session::ErrorOrigin> {
    self.common.error_origin.as_ref()
  }

  /// Drive the handshake forward over whatever the record layer has.
  pub fn step(&mut self) -> Result<Status, Error> {
    if let Some(err) = &self.terminal {
      return Err(err.clone());
    }

    while let Some((typ, bytes)) = self.common.record.recv() {
      if let Err(err) = self.process_input(typ, &bytes) {
        self.terminal = Some(err.clone());
        self.state = ConnState::Closed;
        self.hs = None;
        return Err(err);
      }
    }

    self.common.record.flush();

    Ok(if self.common.has_received_plaintext() {
      Status::AppDataReady
    } else if self.state.is_traffic() {
      if self.common.traffic {
        Status::HandshakeComplete
      } else {
        Status::WantMore
      }
    } else {
      Status::WantMore
    })
  }

  fn process_input(&mut self, typ: ContentType, bytes: &[u8]) -> Result<(), Error> {
    let parse_version = match self.common.negotiated_version {
      Some(v) => v,
      None if self.common.is_datagram => ProtocolVersion::DTLSv1_2,
      None => ProtocolVersion::TLSv1_2,
    };

    let m = match Message::parse(typ, parse_version, bytes) {
      Some(m) => m,
      None => {
        let err = Error::DecodeError("malformed message");
        return Err(self.common.fatal(err, self.state.label(), None));
      }
    };

    if let MessagePayload::Alert(ref alert) = m.payload {
      return self.common.process_alert(alert);
    }

    // TLS 1.3 middlebox compatibility: tolerate one plaintext CCS.  The
    // flag is only ever raised on 1.3 paths; after a HelloRetryRequest
    // the compatibility CCS arrives before any version is negotiated.
    if m.typ == ContentType::ChangeCipherSpec
      && self.common.middlebox_ccs_ok
      && (self.common.is_tls13() || self.common.negotiated_version.is_none())
    {
      self.common.middlebox_ccs_ok = false;
      return Ok(());
    }

    // A HelloRequest during an ongoing handshake is ignored.
    if m.is_handshake_type(crate::msgs::enums::HandshakeType::HelloRequest)
      && self.is_handshaking()
    {
      return Ok(());
    }

    if self.common.is_datagram && m.typ == ContentType::Handshake {
      // a new inbound message ends the previous outbound flight
      self.common.start_flight();
    }

    let handler = client_hs::state_handler(self.state);
    if let Err(err) = handler.expect.check(&m) {
      let kind = m.handshake_type();
      return Err(self.common.fatal(err, self.state.label(), kind));
    }

    let kind = m.handshake_type();
    match (handler.handle)(self, m) {
      Ok(next) => {
        self.state = next;
        Ok(())
      }
      Err(err) => Err(self.common.fatal(err, self.state.label(), kind)),
    }
  }

  /// Ask for a fresh handshake on an established ≤1.2 connection.
  pub fn renegotiate(&mut self) -> Result<(), Error> {
    if self.state != ConnState::Traffic12 {
      return Err(Error::HandshakeNotComplete);
    }

    self.common.traffic = false;
    client_hs::start_handshake(self, true)?;
    self.state = ConnState::ExpectServerHello;
    Ok(())
  }

  /// TLS 1.3 KeyUpdate: rotate our write keys, optionally asking the
  /// peer to do the same.
  pub fn key_update(&mut self, request_peer_update: bool) -> Result<(), Error> {
    client_hs::emit_key_update(self, request_peer_update)
  }

  pub fn export_keying_material(
    &self,
    out: &mut [u8],
    label: &[u8],
    context: Option<&[u8]>,
  ) -> Result<(), Error> {
    if !self.common.traffic {
      return Err(Error::HandshakeNotComplete);
    }

    let ks = self
      .common
      .key_schedule
      .as_ref()
      .ok_or(Error::HandshakeNotComplete)?;
    ks.export_keying_material(out, label, context)
      .map_err(Error::from)
  }

  pub fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
    if self.common.sink {
      return Err(Error::HandshakeNotComplete);
    }

    if self.common.traffic {
      self.common.record.send(ContentType::ApplicationData, bytes);
      self.common.record.flush();
    } else {
      self.common.buffer_plaintext(bytes);
    }
    Ok(())
  }

  pub fn read(&mut self, buf: &mut [u8]) -> usize {
    self.common.read_received(buf)
  }

  /// DTLS: resend the current outbound flight.
  pub fn retransmit(&mut self) {
    self.common.retransmit_flight();
  }

  pub fn close(&mut self) {
    self.common.send_close_notify();
    self.state = ConnState::Closed;
    self.hs = None;
  }
}
