use crate::error::Error;
use crate::hash_hs::{HandshakeHash, HandshakeHashBuffer};
use crate::key_schedule::KeySchedule;
use crate::msgs::base::PayloadU8;
use crate::msgs::enums::{
  ContentType, HandshakeType, NamedGroup, ProtocolVersion, SignatureScheme,
};
use crate::msgs::handshake::{
  ASN1Cert, CertificatePayload, ClientHelloPayload, SessionID,
};
use crate::msgs::message::{Message, MessagePayload};
use crate::negotiation::VersionRange;
use crate::provider::{ActiveKeyExchange, Decrypter, RecordLayer, Signer};
use crate::server_hs;
use crate::session::{
  CallbackAction, ConnectionRandoms, LibContext, SessionCacheMode, SessionCommon, Status,
};
use crate::suites::{self, SupportedCipherSuite};

use std::sync::Arc;
use zeroize::Zeroize;

/// Whether and how hard the server asks for a client certificate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClientAuthMode {
  None,
  Optional,
  Required,
}

/// The server's authentication material for one identity: a certificate
/// chain, its signing key, and (for key-transport suites: RSA, TLCP) a
/// decryption key.  TLCP chains carry the signing certificate first and
/// the encryption certificate second.
#[derive(Clone)]
pub struct ServerIdentity {
  pub chain: CertificatePayload,
  pub signer: Arc<dyn Signer>,
  pub decrypter: Option<Arc<dyn Decrypter>>,
}

/// How the server finds its identity, given the SNI name and the
/// client's signature schemes.
pub trait ResolvesServerCert: Send + Sync {
  fn resolve(&self, sni: Option<&str>, sigschemes: &[SignatureScheme]) -> Option<ServerIdentity>;
}

/// Always hands out the same identity.
pub struct AlwaysResolvesChain(pub ServerIdentity);

impl ResolvesServerCert for AlwaysResolvesChain {
  fn resolve(&self, _sni: Option<&str>, _sigschemes: &[SignatureScheme]) -> Option<ServerIdentity> {
    Some(self.0.clone())
  }
}

/// Resolves nothing; for PSK-only servers.
pub struct ResolvesNoCert;

impl ResolvesServerCert for ResolvesNoCert {
  fn resolve(&self, _sni: Option<&str>, _sigschemes: &[SignatureScheme]) -> Option<ServerIdentity> {
    None
  }
}

/// What the ALPN callback decided.
#[derive(Debug, Clone, PartialEq)]
pub enum AlpnDecision {
  Select(Vec<u8>),
  /// Take no part; negotiation falls back to list intersection.
  Noack,
  Refuse,
}

pub type SniCallback = dyn Fn(&str) -> CallbackAction + Send + Sync;
pub type AlpnCallback = dyn Fn(&[Vec<u8>]) -> AlpnDecision + Send + Sync;
pub type ClientHelloCallback = dyn Fn(&ClientHelloPayload) -> CallbackAction + Send + Sync;
/// PSK lookup: identity to key.
pub type PskServerCallback = dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync;

/// An external PSK the server will accept under TLS 1.3.
#[derive(Clone)]
pub struct ServerExternalPsk {
  pub identity: Vec<u8>,
  pub key: Vec<u8>,
}

impl Drop for ServerExternalPsk {
  fn drop(&mut self) {
    self.key.zeroize();
  }
}

/// Server-side configuration.
pub struct ServerConfig {
  pub versions: VersionRange,
  pub cipher_suites: Vec<&'static SupportedCipherSuite>,
  pub tls13_cipher_suites: Vec<&'static SupportedCipherSuite>,
  pub groups: Vec<NamedGroup>,
  pub sig_algs: Vec<SignatureScheme>,
  pub alpn_protocols: Vec<Vec<u8>>,
  /// Prefer our suite order over the client's.
  pub ignore_client_order: bool,

  pub cert_resolver: Arc<dyn ResolvesServerCert>,
  pub client_auth: ClientAuthMode,

  pub session_cache_mode: SessionCacheMode,
  pub ticket_support: bool,
  /// Scopes which sessions may resume against this configuration.
  pub sid_ctx: Vec<u8>,

  pub renegotiation_allowed: bool,
  pub resume_on_renego: bool,

  pub psk_identity_hint: Option<Vec<u8>>,
  pub psk_server_callback: Option<Arc<PskServerCallback>>,
  pub external_psks: Vec<ServerExternalPsk>,

  pub sni_callback: Option<Arc<SniCallback>>,
  pub alpn_callback: Option<Arc<AlpnCallback>>,
  pub client_hello_callback: Option<Arc<ClientHelloCallback>>,
}

impl ServerConfig {
  pub fn new(cert_resolver: Arc<dyn ResolvesServerCert>) -> ServerConfig {
    ServerConfig {
      versions: VersionRange::new(ProtocolVersion::TLSv1_2, ProtocolVersion::TLSv1_3),
      cipher_suites: suites::default_tls12_suites(),
      tls13_cipher_suites: suites::default_tls13_suites(),
      groups: vec![
        NamedGroup::X25519,
        NamedGroup::secp256r1,
        NamedGroup::secp384r1,
      ],
      sig_algs: crate::client::default_sig_algs(),
      alpn_protocols: Vec::new(),
      ignore_client_order: false,
      cert_resolver,
      client_auth: ClientAuthMode::None,
      session_cache_mode: SessionCacheMode::ServerOnly,
      ticket_support: true,
      sid_ctx: Vec::new(),
      renegotiation_allowed: true,
      resume_on_renego: false,
      psk_identity_hint: None,
      psk_server_callback: None,
      external_psks: Vec::new(),
      sni_callback: None,
      alpn_callback: None,
      client_hello_callback: None,
    }
  }

  pub fn suites_for_version(&self, version: ProtocolVersion) -> Vec<&'static SupportedCipherSuite> {
    let base: &[&'static SupportedCipherSuite] = if version == ProtocolVersion::TLSv1_3 {
      &self.tls13_cipher_suites
    } else {
      &self.cipher_suites
    };
    suites::reduce_given_version(base, version)
  }

  pub fn has_psk_source(&self) -> bool {
    self.psk_server_callback.is_some() || !self.external_psks.is_empty()
  }
}

/// In-progress post-handshake client authentication (TLS 1.3).
pub(crate) enum PhaProgress {
  ExpectCertificate {
    transcript: HandshakeHash,
    context: PayloadU8,
  },
  ExpectCertificateVerify {
    transcript: HandshakeHash,
    chain: CertificatePayload,
  },
  ExpectFinished {
    transcript: HandshakeHash,
    chain: CertificatePayload,
  },
}

/// Transient server handshake workspace.
pub(crate) struct ServerHandshakeData {
  pub transcript_buffer: Option<HandshakeHashBuffer>,
  pub transcript: Option<HandshakeHash>,
  pub randoms: ConnectionRandoms,
  pub session_id: SessionID,
  pub sni: Option<String>,
  pub sni_acknowledged: bool,
  pub client_sigalgs: Vec<SignatureScheme>,
  pub client_legacy_version: ProtocolVersion,
  pub identity: Option<ServerIdentity>,
  pub kx_data: Option<Box<dyn ActiveKeyExchange>>,
  pub early_ks: Option<KeySchedule>,
  pub hrr_group: Option<NamedGroup>,
  pub pending_client_app_secret: Vec<u8>,
  pub send_ticket: bool,
  pub doing_client_auth: bool,
  pub valid_client_cert_chain: Option<CertificatePayload>,
  pub doing_resume: bool,
  pub hrr_issued: bool,
  pub renegotiating: bool,
  pub client_offered_pha: bool,
}

impl ServerHandshakeData {
  pub fn new(renegotiating: bool) -> ServerHandshakeData {
    ServerHandshakeData {
      transcript_buffer: Some(HandshakeHashBuffer::new()),
      transcript: None,
      randoms: ConnectionRandoms::new(),
      session_id: SessionID::empty(),
      sni: None,
      sni_acknowledged: false,
      client_sigalgs: Vec::new(),
      client_legacy_version: ProtocolVersion::TLSv1_2,
      identity: None,
      kx_data: None,
      early_ks: None,
      hrr_group: None,
      pending_client_app_secret: Vec::new(),
      send_ticket: false,
      doing_client_auth: false,
      valid_client_cert_chain: None,
      doing_resume: false,
      hrr_issued: false,
      renegotiating,
      client_offered_pha: false,
    }
  }

  pub fn transcript(&mut self) -> &mut HandshakeHash {
    self.transcript.as_mut().expect("transcript not started")
  }
}

/// Server connection states.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnState {
  ExpectClientHello,
  ExpectSecondClientHello13,
  ExpectCertificate12,
  ExpectClientKx,
  ExpectCertificateVerify12,
  ExpectCcs,
  ExpectFinished12,
  ExpectCertificate13,
  ExpectCertificateVerify13,
  ExpectFinished13,
  Traffic,
  Closed,
}

impl ConnState {
  pub fn label(&self) -> &'static str {
    match self {
      ConnState::ExpectClientHello => "ExpectClientHello",
      ConnState::ExpectSecondClientHello13 => "ExpectSecondClientHello13",
      ConnState::ExpectCertificate12 => "ExpectCertificate12",
      ConnState::ExpectClientKx => "ExpectClientKx",
      ConnState::ExpectCertificateVerify12 => "ExpectCertificateVerify12",
      ConnState::ExpectCcs => "ExpectCcs",
      ConnState::ExpectFinished12 => "ExpectFinished12",
      ConnState::ExpectCertificate13 => "ExpectCertificate13",
      ConnState::ExpectCertificateVerify13 => "ExpectCertificateVerify13",
      ConnState::ExpectFinished13 => "ExpectFinished13",
      ConnState::Traffic => "Traffic",
      ConnState::Closed => "Closed",
    }
  }
}

/// A server connection, driven through [`ServerSession::step`].
pub struct ServerSession {
  pub(crate) ctx: Arc<LibContext>,
  pub(crate) config: Arc<ServerConfig>,
  pub(crate) common: SessionCommon,
  pub(crate) hs: Option<ServerHandshakeData>,
  pub(crate) state: ConnState,
  pub(crate) resumption_master_secret: Vec<u8>,
  pub(crate) retained_transcript: Option<HandshakeHash>,
  pub(crate) pha: Option<PhaProgress>,
  pub(crate) client_offered_pha: bool,
  pub(crate) dtls_cookie_secret: [u8; 32],
  terminal: Option<Error>,
}

impl ServerSession {
  pub fn new(
    ctx: Arc<LibContext>,
    config: Arc<ServerConfig>,
    record: Box<dyn RecordLayer>,
  ) -> Result<ServerSession, Error> {
    let is_datagram = config.versions.min.is_datagram();
    let mut cookie_secret = [0u8; 32];
    ctx.provider.random(&mut cookie_secret)?;

    Ok(ServerSession {
      common: SessionCommon::new(ctx.provider.clone(), record, false, is_datagram),
      ctx,
      config,
      hs: Some(ServerHandshakeData::new(false)),
      state: ConnState::ExpectClientHello,
      resumption_master_secret: Vec::new(),
      retained_transcript: None,
      pha: None,
      client_offered_pha: false,
      dtls_cookie_secret: cookie_secret,
      terminal: None,
    })
  }

  pub fn is_handshaking(&self) -> bool {
    !matches!(self.state, ConnState::Traffic | ConnState::Closed)
  }

  pub fn negotiated_version(&self) -> Option<ProtocolVersion> {
    self.common.negotiated_version
  }

  pub fn alpn_protocol(&self) -> Option<&[u8]> {
    self.common.alpn_protocol.as_deref()
  }

  pub fn sni_hostname(&self) -> Option<&str> {
    self.hs.as_ref().and_then(|hs| hs.sni.as_deref())
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
    } else if self.state == ConnState::Traffic {
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

    // TLS 1.3 middlebox compatibility: one plaintext CCS after a
    // ClientHello that offered 1.3.
    if m.typ == ContentType::ChangeCipherSpec
      && self.common.middlebox_ccs_ok
      && self.common.is_tls13()
    {
      self.common.middlebox_ccs_ok = false;
      return Ok(());
    }

    if self.common.is_datagram && m.typ == ContentType::Handshake {
      self.common.start_flight();
    }

    let handler = server_hs::state_handler(self.state);
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

  /// Ask the client for a fresh handshake with a HelloRequest.
  pub fn renegotiate(&mut self) -> Result<(), Error> {
    if self.state != ConnState::Traffic
      || self.common.is_tls13()
      || !self.config.renegotiation_allowed
    {
      return Err(Error::HandshakeNotComplete);
    }

    let m = self
      .common
      .build_hs(HandshakeType::HelloRequest, crate::msgs::handshake::HandshakePayload::HelloRequest);
    // HelloRequest never enters the transcript
    self.common.send_msg(m);
    self.common.record.flush();
    Ok(())
  }

  /// TLS 1.3 KeyUpdate.
  pub fn key_update(&mut self, request_peer_update: bool) -> Result<(), Error> {
    server_hs::emit_key_update(self, request_peer_update)
  }

  /// TLS 1.3 post-handshake client authentication: inject a
  /// CertificateRequest into the established connection.
  pub fn post_handshake_auth_request(&mut self) -> Result<(), Error> {
    server_hs::request_post_handshake_auth(self)
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
