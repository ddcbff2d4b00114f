use crate::error::Error;
use crate::key_schedule::{KeySchedule, SecretKind};
use crate::kx;
use crate::msgs::base::{Payload, PayloadU16, PayloadU8};
use crate::msgs::codec::{Codec, Reader};
use crate::msgs::enums::{
  AlertDescription, ContentType, ECPointFormat, HandshakeType, KeyUpdateRequest, NamedGroup,
  ProtocolVersion, PSKKeyExchangeMode, SignatureScheme,
};
use crate::msgs::handshake::{
  CertificatePayloadTLS13, CertificateRequestPayload, CertificateRequestPayloadTLS13,
  CertReqExtension, ClientECDHParams, ClientHelloPayload, DigitallySignedStruct,
  HandshakePayload, HelloRetryExtension, HelloRetryRequest, HelloVerifyRequestPayload,
  KeyExchangeAlgorithm, KeyShareEntry, NewSessionTicketPayload, NewSessionTicketPayloadTLS13,
  PresharedKeyOffer, PskServerKeyExchange, Random, ServerDHParams, ServerECDHParams,
  ServerExtension, ServerHelloPayload, ServerKeyExchangePayload, SessionID,
  SupportedSignatureSchemes, TlcpClientKeyExchange, TlcpServerKeyExchange,
  DOWNGRADE_SENTINEL_TLS12,
};
use crate::msgs::handshake::{ClientCertificateTypes, DHEServerKeyExchange, ECDHEServerKeyExchange};
use crate::msgs::message::{Message, MessagePayload};
use crate::msgs::persist::SessionValue;
use crate::negotiation;
use crate::provider::{CertError, CertUsage};
use crate::server::{
  ClientAuthMode, ConnState, PhaProgress, ServerHandshakeData, ServerSession,
};
use crate::session::{CallbackAction, Expectation, SessionSecrets};
use crate::ticketer::TimeBase;
use crate::util;

macro_rules! extract_handshake(
  ( $m:expr, $t:path ) => (
    match $m.payload {
      MessagePayload::Handshake(ref hsp) => match hsp.payload {
        $t(ref hm) => Some(hm),
        _ => None
      },
      _ => None
    }
  )
);

pub type HandleFunction = fn(&mut ServerSession, m: Message) -> Result<ConnState, Error>;

/* These are effectively operations on the ServerSession, variant on the
 * connection state.  They must not have state of their own -- so they're
 * functions rather than a trait. */
pub struct Handler {
  pub expect: Expectation,
  pub handle: HandleFunction,
}

pub fn state_handler(state: ConnState) -> &'static Handler {
  match state {
    ConnState::ExpectClientHello => &EXPECT_CLIENT_HELLO,
    ConnState::ExpectSecondClientHello13 => &EXPECT_SECOND_CLIENT_HELLO_13,
    ConnState::ExpectCertificate12 => &EXPECT_CERTIFICATE_12,
    ConnState::ExpectClientKx => &EXPECT_CLIENT_KX,
    ConnState::ExpectCertificateVerify12 => &EXPECT_CERTIFICATE_VERIFY_12,
    ConnState::ExpectCcs => &EXPECT_CCS,
    ConnState::ExpectFinished12 => &EXPECT_FINISHED_12,
    ConnState::ExpectCertificate13 => &EXPECT_CERTIFICATE_13,
    ConnState::ExpectCertificateVerify13 => &EXPECT_CERTIFICATE_VERIFY_13,
    ConnState::ExpectFinished13 => &EXPECT_FINISHED_13,
    ConnState::Traffic => &TRAFFIC,
    ConnState::Closed => &CLOSED,
  }
}

fn hs_of(sess: &mut ServerSession) -> &mut ServerHandshakeData {
  sess.hs.as_mut().expect("no server handshake in progress")
}

fn send_hs_msg(sess: &mut ServerSession, typ: HandshakeType, payload: HandshakePayload) {
  let m = sess.common.build_hs(typ, payload);
  hs_of(sess).transcript().add_message(&m);
  sess.common.send_msg(m);
}

fn incompatible(why: &'static str) -> Error {
  Error::HandshakeFailure(why)
}

/// ALPN selection: the callback decides if present, otherwise list
/// intersection; an offer we cannot satisfy is fatal.
fn select_alpn(sess: &ServerSession, hello: &ClientHelloPayload) -> Result<Option<Vec<u8>>, Error> {
  use crate::msgs::handshake::ConvertProtocolNameList;

  let offered = match hello.get_alpn_extension() {
    Some(protos) => protos.to_vecs(),
    None => return Ok(None),
  };

  if offered.iter().any(|proto| proto.is_empty()) {
    return Err(Error::PeerMisbehaved("client offered empty ALPN protocol"));
  }

  if let Some(ref callback) = sess.config.alpn_callback {
    return match callback(&offered) {
      crate::server::AlpnDecision::Select(proto) => {
        if offered.contains(&proto) {
          Ok(Some(proto))
        } else {
          Err(Error::Internal("ALPN callback chose unoffered protocol"))
        }
      }
      crate::server::AlpnDecision::Noack => Ok(None),
      crate::server::AlpnDecision::Refuse => Err(Error::RejectedByCallback(
        AlertDescription::NoApplicationProtocol,
      )),
    };
  }

  if sess.config.alpn_protocols.is_empty() {
    return Ok(None);
  }

  match util::first_in_both(&sess.config.alpn_protocols, &offered) {
    Some(proto) => Ok(Some(proto)),
    None => Err(Error::RejectedByCallback(
      AlertDescription::NoApplicationProtocol,
    )),
  }
}

/// The ServerHello / EncryptedExtensions extension block for the
/// TLS 1.2 family.
fn process_extensions_12(
  sess: &mut ServerSession,
  hello: &ClientHelloPayload,
) -> Result<Vec<ServerExtension>, Error> {
  let mut ret = Vec::new();

  if let Some(proto) = select_alpn(sess, hello)? {
    info!("Chosen ALPN protocol {:?}", proto);
    ret.push(ServerExtension::make_alpn(&proto));
    sess.common.alpn_protocol = Some(proto);
  }

  if hello.get_sni_extension().is_some() && hs_of(sess).sni_acknowledged {
    ret.push(ServerExtension::ServerNameAcknowledgement);
  }

  /* Secure renegotiation: answer empty on the initial handshake, the
   * joined verify data when renegotiating. */
  let offered_secure_reneg =
    hello.get_renegotiation_info().is_some() || hello.offers_scsv();
  if offered_secure_reneg {
    let body = if hs_of(sess).renegotiating {
      let mut body = sess.common.client_verify_data.clone();
      body.extend_from_slice(&sess.common.server_verify_data);
      body
    } else {
      Vec::new()
    };
    ret.push(ServerExtension::RenegotiationInfo(PayloadU8::new(body)));
  }

  if sess.common.ems {
    ret.push(ServerExtension::ExtendedMasterSecretAck);
  }

  if sess.common.etm {
    ret.push(ServerExtension::EncryptThenMacAck);
  }

  /* Tickets: ack when the client talks tickets and we can issue them. */
  if hello.get_ticket_extension().is_some()
    && sess.config.ticket_support
    && sess.ctx.ticketer.is_some()
  {
    hs_of(sess).send_ticket = true;
    ret.push(ServerExtension::SessionTicketAcknowledgement);
  }

  Ok(ret)
}

/* --- ClientHello --- */

fn dtls_cookie_for(sess: &ServerSession, hello: &ClientHelloPayload) -> Result<Vec<u8>, Error> {
  let mac = sess.common.provider.hmac(
    crate::msgs::enums::HashAlgorithm::SHA256,
    &sess.dtls_cookie_secret,
    &hello.random.0,
  )?;
  Ok(mac[..16].to_vec())
}

fn emit_hello_verify_request(sess: &mut ServerSession, cookie: Vec<u8>) {
  let m = sess.common.build_hs(
    HandshakeType::HelloVerifyRequest,
    HandshakePayload::HelloVerifyRequest(HelloVerifyRequestPayload {
      server_version: ProtocolVersion::DTLSv1_2,
      cookie: PayloadU8::new(cookie),
    }),
  );
  /* The cookie exchange stays out of the transcript. */
  sess.common.send_msg(m);
  sess.common.record.flush();
}

fn handle_client_hello(sess: &mut ServerSession, m: Message) -> Result<ConnState, Error> {
  let client_hello = extract_handshake!(m, HandshakePayload::ClientHello)
    .unwrap()
    .clone();
  debug!("we got a clienthello {:?}", client_hello);

  if !client_hello
    .compression_methods
    .contains(&crate::msgs::enums::Compression::Null)
  {
    return Err(Error::IllegalParameter("client did not offer Null compression"));
  }

  if client_hello.has_duplicate_extension() {
    return Err(Error::DecodeError("client sent duplicate extensions"));
  }

  if client_hello.get_psk().is_some() && !client_hello.psk_offered_last() {
    return Err(Error::IllegalParameter("pre_shared_key is not the last extension"));
  }

  if let Some(ref callback) = sess.config.client_hello_callback {
    if let CallbackAction::Fatal(alert) = callback(&client_hello) {
      return Err(Error::RejectedByCallback(alert));
    }
  }

  /* SNI, with the application's say. */
  let sni = client_hello.get_sni_hostname().map(str::to_string);
  let mut sni_acknowledged = sni.is_some();
  if let (Some(ref name), Some(ref callback)) = (&sni, &sess.config.sni_callback) {
    match callback(name) {
      CallbackAction::Ok => (),
      CallbackAction::Noack => sni_acknowledged = false,
      CallbackAction::Fatal(alert) => return Err(Error::RejectedByCallback(alert)),
    }
  }

  let default_sigalgs = SupportedSignatureSchemes::default();
  let sigalgs_ext = client_hello
    .get_sigalgs_extension()
    .cloned()
    .unwrap_or(default_sigalgs);

  /* Resolve our identity before version selection: TLS 1.3 requires a
   * usable certificate or an acceptable PSK. */
  let identity = sess
    .config
    .cert_resolver
    .resolve(sni.as_deref(), &sigalgs_ext);

  let renegotiating = sess
    .hs
    .as_ref()
    .map(|hs| hs.renegotiating)
    .unwrap_or(false);

  let can_do_tls13 = !renegotiating
    && !sess.config.tls13_cipher_suites.is_empty()
    && (identity.is_some()
      || client_hello.get_psk().is_some() && tls13_psk_offer_resolvable(sess, &client_hello));

  let version = negotiation::select_version(&client_hello, sess.config.versions, can_do_tls13)?;
  sess.common.negotiated_version = Some(version);

  /* Secure renegotiation checks on the hello itself. */
  let reneg_info = client_hello
    .get_renegotiation_info()
    .map(|info| info.0.as_slice());
  if renegotiating {
    negotiation::check_renegotiation_info(
      reneg_info,
      client_hello.offers_scsv(),
      &sess.common.client_verify_data,
    )?;
  } else {
    negotiation::check_initial_renegotiation_info(reneg_info)?;
  }

  /* DTLS: demand a valid cookie before doing anything stateful. */
  if sess.common.is_datagram {
    let expected = dtls_cookie_for(sess, &client_hello)?;
    let presented = client_hello
      .cookie
      .as_ref()
      .map(|cookie| cookie.0.clone())
      .unwrap_or_default();

    if presented.is_empty() {
      emit_hello_verify_request(sess, expected);
      return Ok(ConnState::ExpectClientHello);
    }

    if !sess.common.provider.constant_time_eq(&presented, &expected) {
      return Err(Error::IllegalParameter("bad DTLS cookie"));
    }
  }

  {
    let hs = hs_of(sess);
    hs.sni = sni;
    hs.sni_acknowledged = sni_acknowledged;
    hs.client_sigalgs = sigalgs_ext;
    hs.client_legacy_version = client_hello.client_version;
    hs.client_offered_pha = client_hello.post_handshake_auth_offered();
    hs.identity = identity;
    client_hello.random.write_slice(&mut hs.randoms.client);
  }

  /* Suite selection. */
  let mut suitable = sess.config.suites_for_version(version);

  if version != ProtocolVersion::TLSv1_3 {
    if let Some(identity) = hs_of(sess).identity.as_ref() {
      let sign = identity.signer.algorithm();
      let has_decrypter = identity.decrypter.is_some();
      suitable.retain(|scs| {
        let sig_ok =
          scs.sign == crate::msgs::enums::SignatureAlgorithm::Anonymous || scs.sign == sign;
        let transport_ok = !matches!(
          scs.kx,
          KeyExchangeAlgorithm::RSA | KeyExchangeAlgorithm::RSA_PSK | KeyExchangeAlgorithm::ECC_TLCP
        ) || has_decrypter;
        sig_ok && transport_ok
      });
    } else {
      // no certificate: only certless PSK suites can work
      suitable.retain(|scs| scs.kx.is_psk() && scs.kx != KeyExchangeAlgorithm::RSA_PSK);
    }

    if !sess.config.has_psk_source() {
      suitable.retain(|scs| !scs.kx.is_psk());
    }
  }

  /* A resolvable TLS 1.3 PSK constrains the hash; prefer suites it can
   * actually resume under. */
  if version == ProtocolVersion::TLSv1_3 {
    if let Some(hash) = preferred_psk_hash(sess, &client_hello) {
      let (matching, rest): (Vec<_>, Vec<_>) =
        suitable.into_iter().partition(|scs| scs.get_hash() == hash);
      suitable = if matching.is_empty() { rest } else { matching };
    }
  }

  let suite = if sess.config.ignore_client_order {
    crate::suites::choose_ciphersuite_preferring_server(&client_hello.cipher_suites, &suitable)
  } else {
    crate::suites::choose_ciphersuite_preferring_client(&client_hello.cipher_suites, &suitable)
  }
  .ok_or_else(|| incompatible("no ciphersuites in common"))?;

  info!("decided upon suite {:?}", suite.suite);

  // a second 1.3 hello after our HRR cannot shift the suite;
  // renegotiation may pick afresh
  if hs_of(sess).hrr_issued {
    if let Some(existing) = sess.common.get_suite_opt() {
      if existing.suite != suite.suite {
        return Err(Error::IllegalParameter("suite changed between hellos"));
      }
    }
  }
  sess.common.set_suite(suite);

  /* Fresh server random.  A 1.3-capable server negotiating 1.2 with a
   * legacy client stamps the downgrade sentinel. */
  {
    let provider = sess.common.provider.clone();
    let offered_13 = client_hello
      .get_versions_extension()
      .map(|versions| versions.contains(&ProtocolVersion::TLSv1_3))
      .unwrap_or(false);
    let we_support_13 = sess.config.versions.contains(ProtocolVersion::TLSv1_3);
    let hs = hs_of(sess);
    provider.random(&mut hs.randoms.server)?;
    if version != ProtocolVersion::TLSv1_3 && we_support_13 && !offered_13 {
      hs.randoms.server[24..].copy_from_slice(&DOWNGRADE_SENTINEL_TLS12);
    }
  }

  /* Start the transcript (CH2 after an HRR continues the existing one). */
  {
    let provider = sess.common.provider.clone();
    let client_auth_wanted = sess.config.client_auth != ClientAuthMode::None;
    let hs = hs_of(sess);
    if hs.transcript.is_none() {
      let mut buffer = hs
        .transcript_buffer
        .take()
        .ok_or(Error::Internal("transcript already converted"))?;
      if client_auth_wanted {
        buffer.set_client_auth_enabled();
      }
      hs.transcript = Some(buffer.start_hash(provider, suite.get_hash())?);
    }
  }

  if version == ProtocolVersion::TLSv1_3 {
    handle_client_hello_tls13(sess, &client_hello, &m)
  } else {
    handle_client_hello_tls12(sess, &client_hello, &m)
  }
}

pub static EXPECT_CLIENT_HELLO: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::Handshake],
    handshake_types: &[HandshakeType::ClientHello],
  },
  handle: handle_client_hello,
};

pub static EXPECT_SECOND_CLIENT_HELLO_13: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::Handshake],
    handshake_types: &[HandshakeType::ClientHello],
  },
  handle: handle_client_hello,
};

/* --- TLS 1.3 --- */

/// Can any offered PSK identity be resolved at all?  Used only for
/// version selection; the real resolution and binder check follow.
fn tls13_psk_offer_resolvable(sess: &ServerSession, hello: &ClientHelloPayload) -> bool {
  let offer = match hello.get_psk() {
    Some(offer) => offer,
    None => return false,
  };

  offer
    .identities
    .iter()
    .any(|identity| resolve_psk_identity(sess, &identity.identity.0).is_some())
}

/// The hash the first resolvable PSK identity demands, if any.  Suite
/// selection must respect it: a PSK only resumes under a suite with the
/// same hash.
fn preferred_psk_hash(
  sess: &ServerSession,
  hello: &ClientHelloPayload,
) -> Option<crate::msgs::enums::HashAlgorithm> {
  hello.get_psk().and_then(|offer| {
    offer.identities.iter().find_map(|identity| {
      resolve_psk_identity(sess, &identity.identity.0).map(|(_, _, hash)| hash)
    })
  })
}

/// External store first, then ticket decryption.  `(psk, external,
/// hash)`: external PSKs are SHA-256 by convention, resumption PSKs
/// carry their original suite's hash.
pub(crate) fn resolve_psk_identity(
  sess: &ServerSession,
  identity: &[u8],
) -> Option<(Vec<u8>, bool, crate::msgs::enums::HashAlgorithm)> {
  for external in &sess.config.external_psks {
    if external.identity == identity {
      return Some((
        external.key.clone(),
        true,
        crate::msgs::enums::HashAlgorithm::SHA256,
      ));
    }
  }

  let ticketer = sess.ctx.ticketer.as_ref()?;
  let now = TimeBase::now().ok()?;
  let (session, _needs_renew) = ticketer.decrypt(identity, now);
  let session = session?;

  if session.version != ProtocolVersion::TLSv1_3 {
    return None;
  }

  let suite = crate::suites::lookup(session.cipher_suite)?;
  Some((session.master_secret.0.clone(), false, suite.get_hash()))
}

fn check_binder(
  sess: &mut ServerSession,
  offer: &PresharedKeyOffer,
  index: usize,
  psk: &[u8],
  external: bool,
  raw_hello: &Message,
) -> Result<KeySchedule, Error> {
  let suite = sess.common.get_suite();

  let encoded = match raw_hello.payload {
    MessagePayload::Handshake(ref hmp) => hmp.get_encoding(),
    _ => return Err(Error::Internal("client hello is not a handshake message")),
  };
  let binders_len = offer.binders_encoded_len();
  let truncated = &encoded[..encoded.len() - binders_len];

  let base_hash = hs_of(sess).transcript().fork_hash_given(truncated);

  let mut ks = KeySchedule::new(sess.common.provider.clone(), suite.get_hash());
  ks.input_secret(psk)?;
  let binder_key = ks.derive_binder_key(external)?;
  let expected = ks.sign_verify_data_from(&binder_key, &base_hash)?;

  let offered = &offer.binders[index].0;
  if !sess.common.provider.constant_time_eq(&expected, offered) {
    return Err(Error::DecryptError);
  }

  Ok(ks)
}

fn emit_hello_retry_request(sess: &mut ServerSession, group: NamedGroup, session_id: SessionID) -> Result<(), Error> {
  let suite = sess.common.get_suite();

  hs_of(sess).transcript().rollup_for_hrr()?;

  let req = HelloRetryRequest {
    legacy_version: ProtocolVersion::TLSv1_2,
    session_id,
    cipher_suite: suite.suite,
    extensions: vec![
      HelloRetryExtension::SupportedVersions(ProtocolVersion::TLSv1_3),
      HelloRetryExtension::KeyShare(group),
    ],
  };

  send_hs_msg(
    sess,
    HandshakeType::HelloRetryRequest,
    HandshakePayload::HelloRetryRequest(req),
  );
  sess.common.send_ccs(); // middlebox compatibility
  sess.common.record.flush();
  Ok(())
}

fn handle_client_hello_tls13(
  sess: &mut ServerSession,
  client_hello: &ClientHelloPayload,
  m: &Message,
) -> Result<ConnState, Error> {
  let suite = sess.common.get_suite();

  let groups_ext = client_hello.get_namedgroups_extension().cloned();
  let shares = client_hello
    .get_keyshare_extension()
    .cloned()
    .unwrap_or_default();

  negotiation::check_key_shares(&shares, groups_ext.as_deref())?;

  /* PSK: first resolvable identity wins; its binder must verify before
   * anything else happens. */
  let mut chosen_psk: Option<(usize, Vec<u8>, bool)> = None;
  let mut psk_modes: Vec<PSKKeyExchangeMode> = Vec::new();

  if let Some(offer) = client_hello.get_psk() {
    psk_modes = client_hello
      .get_psk_modes()
      .cloned()
      .ok_or(Error::MissingExtension(
        "pre_shared_key without psk_key_exchange_modes",
      ))?;

    if offer.binders.len() != offer.identities.len() {
      return Err(Error::DecodeError("PSK identity/binder count mismatch"));
    }

    for (index, identity) in offer.identities.iter().enumerate() {
      if let Some((psk, external, hash)) = resolve_psk_identity(sess, &identity.identity.0) {
        // a PSK only resumes under a suite with its own hash
        if hash != suite.get_hash() {
          continue;
        }

        /* Identities after the chosen one are deliberately not
         * examined. */
        let offer = offer.clone();
        let ks = check_binder(sess, &offer, index, &psk, external, m)?;
        hs_of(sess).early_ks = Some(ks);
        chosen_psk = Some((index, psk, external));
        break;
      }
    }
  }

  /* Now the hello can enter the transcript. */
  hs_of(sess).transcript().add_message(m);
  sess.common.middlebox_ccs_ok = true;

  let psk_accepted = chosen_psk.is_some();

  if !psk_accepted {
    // certificate authentication requires signature_algorithms
    if client_hello.get_sigalgs_extension().is_none() {
      return Err(Error::MissingExtension("signature_algorithms"));
    }
    if hs_of(sess).identity.is_none() {
      return Err(incompatible("no certificate and no acceptable PSK"));
    }
  }

  /* Key-share selection, HRR if the client guessed wrong. */
  let want_dhe = psk_modes.is_empty() || psk_modes.contains(&PSKKeyExchangeMode::PSK_DHE_KE);
  let want_psk_only = psk_modes.contains(&PSKKeyExchangeMode::PSK_KE);

  let chosen_share = sess
    .config
    .groups
    .iter()
    .find_map(|group| shares.iter().find(|share| share.group == *group))
    .cloned();

  if let Some(expected_group) = hs_of(sess).hrr_group {
    /* This is the second ClientHello: exactly one share, for the group
     * we demanded. */
    if shares.len() != 1 || shares[0].group != expected_group {
      return Err(Error::IllegalParameter(
        "second ClientHello key_share mismatch",
      ));
    }
  }

  let use_dhe = match (psk_accepted, chosen_share.is_some()) {
    (true, true) if want_dhe => true,
    (true, _) if want_psk_only => false,
    (true, false) if want_dhe => {
      // PSK wants a share we don't have yet
      return retry_or_fail(sess, client_hello, groups_ext.as_deref());
    }
    (true, _) => return Err(incompatible("no usable psk_key_exchange_mode")),
    (false, true) => true,
    (false, false) => {
      return retry_or_fail(sess, client_hello, groups_ext.as_deref());
    }
  };

  /* Complete the exchange and answer. */
  let (shared_secret, our_share) = if use_dhe {
    let share = chosen_share.expect("dhe without share");
    let kx = sess
      .common
      .provider
      .start_kx(share.group)
      .map_err(|_| incompatible("cannot start key exchange"))?;
    let our_public = kx.pub_key().to_vec();
    let result = kx::complete_kx(kx, &share.payload.0)?;
    (
      Some(result.shared_secret.clone()),
      Some(KeyShareEntry::new(share.group, &our_public)),
    )
  } else {
    (None, None)
  };

  let mut extensions = Vec::new();
  if let Some(share) = our_share {
    extensions.push(ServerExtension::KeyShare(share));
  }
  if let Some((index, _, _)) = chosen_psk.as_ref() {
    extensions.push(ServerExtension::PresharedKey(*index as u16));
  }
  extensions.push(ServerExtension::SupportedVersions(ProtocolVersion::TLSv1_3));

  let randoms = hs_of(sess).randoms.clone();
  let sh = ServerHelloPayload {
    legacy_version: ProtocolVersion::TLSv1_2,
    random: Random(randoms.server),
    session_id: client_hello.session_id.clone(),
    cipher_suite: suite.suite,
    compression_method: crate::msgs::enums::Compression::Null,
    extensions,
  };

  debug!("sending server hello {:?}", sh);
  let hrr_issued = hs_of(sess).hrr_issued;
  send_hs_msg(sess, HandshakeType::ServerHello, HandshakePayload::ServerHello(sh));
  if !hrr_issued {
    sess.common.send_ccs(); // middlebox compatibility
  }

  /* Key schedule: early secret from the PSK (or zeroes), then the
   * (EC)DHE secret (or zeroes). */
  let mut key_schedule = match hs_of(sess).early_ks.take() {
    Some(ks) => ks,
    None => {
      let mut ks = KeySchedule::new(sess.common.provider.clone(), suite.get_hash());
      ks.input_empty()?;
      ks
    }
  };

  match shared_secret {
    Some(ref secret) => key_schedule.input_secret(secret)?,
    None => key_schedule.input_empty()?,
  }

  let handshake_hash = hs_of(sess).transcript().get_current_hash();
  let write_key =
    key_schedule.derive(SecretKind::ServerHandshakeTrafficSecret, &handshake_hash)?;
  let read_key = key_schedule.derive(SecretKind::ClientHandshakeTrafficSecret, &handshake_hash)?;

  key_schedule.current_server_traffic_secret = write_key.clone();
  key_schedule.current_client_traffic_secret = read_key.clone();
  sess.common.key_schedule = Some(key_schedule);

  sess.common.install_write_key(write_key);
  sess.common.install_read_key(read_key);

  if let Some((_, _, external)) = chosen_psk.as_ref() {
    hs_of(sess).doing_resume = !external;
  }

  /* EncryptedExtensions. */
  let mut encrypted_exts = Vec::new();
  if let Some(proto) = select_alpn(sess, client_hello)? {
    info!("Chosen ALPN protocol {:?}", proto);
    encrypted_exts.push(ServerExtension::make_alpn(&proto));
    sess.common.alpn_protocol = Some(proto);
  }
  if client_hello.get_sni_extension().is_some() && hs_of(sess).sni_acknowledged {
    encrypted_exts.push(ServerExtension::ServerNameAcknowledgement);
  }
  send_hs_msg(
    sess,
    HandshakeType::EncryptedExtensions,
    HandshakePayload::EncryptedExtensions(encrypted_exts),
  );

  /* Certificate flight, unless a PSK authenticated us. */
  if !psk_accepted {
    if sess.config.client_auth != ClientAuthMode::None {
      let certreq = CertificateRequestPayloadTLS13 {
        context: PayloadU8::empty(),
        extensions: vec![CertReqExtension::SignatureAlgorithms(
          sess.config.sig_algs.clone(),
        )],
      };
      send_hs_msg(
        sess,
        HandshakeType::CertificateRequest,
        HandshakePayload::CertificateRequestTLS13(certreq),
      );
      hs_of(sess).doing_client_auth = true;
    }

    let identity = hs_of(sess)
      .identity
      .clone()
      .ok_or(Error::Internal("identity vanished"))?;

    send_hs_msg(
      sess,
      HandshakeType::Certificate,
      HandshakePayload::CertificateTLS13(CertificatePayloadTLS13::new(&identity.chain)),
    );

    /* CertificateVerify. */
    let scheme = identity
      .signer
      .choose_scheme(&hs_of(sess).client_sigalgs)
      .ok_or(incompatible("no overlapping sigschemes"))?;

    let mut message = vec![0x20u8; 64];
    message.extend_from_slice(b"TLS 1.3, server CertificateVerify\x00");
    message.extend_from_slice(&hs_of(sess).transcript().get_current_hash());

    let sig = identity.signer.sign(scheme, &message)?;
    send_hs_msg(
      sess,
      HandshakeType::CertificateVerify,
      HandshakePayload::CertificateVerify(DigitallySignedStruct::new(scheme, sig)),
    );
  }

  /* Finished. */
  let handshake_hash = hs_of(sess).transcript().get_current_hash();
  let verify_data = sess
    .common
    .key_schedule
    .as_ref()
    .expect("no key schedule")
    .sign_verify_data(SecretKind::ServerHandshakeTrafficSecret, &handshake_hash)?;
  send_hs_msg(
    sess,
    HandshakeType::Finished,
    HandshakePayload::Finished(Payload::new(verify_data)),
  );
  sess.common.record.flush();

  /* Application secrets hang off the transcript through our Finished.
   * Our write side flips now; the read side waits for the client's
   * Finished. */
  let flight_hash = hs_of(sess).transcript().get_current_hash();
  {
    let key_schedule = sess.common.key_schedule.as_mut().expect("no key schedule");
    key_schedule.input_empty()?;

    let write_key =
      key_schedule.derive(SecretKind::ServerApplicationTrafficSecret, &flight_hash)?;
    let read_key =
      key_schedule.derive(SecretKind::ClientApplicationTrafficSecret, &flight_hash)?;
    let exporter = key_schedule.derive(SecretKind::ExporterMasterSecret, &flight_hash)?;

    key_schedule.current_server_traffic_secret = write_key.clone();
    key_schedule.current_exporter_secret = exporter;
    /* nb. current_client_traffic_secret still holds the handshake
     * secret: the client Finished verifies against it. */
    hs_of(sess).pending_client_app_secret = read_key;

    sess.common.install_write_key(write_key);
  }

  if hs_of(sess).doing_client_auth {
    Ok(ConnState::ExpectCertificate13)
  } else {
    Ok(ConnState::ExpectFinished13)
  }
}

fn retry_or_fail(
  sess: &mut ServerSession,
  client_hello: &ClientHelloPayload,
  groups_ext: Option<&[NamedGroup]>,
) -> Result<ConnState, Error> {
  if hs_of(sess).hrr_issued {
    return Err(Error::IllegalParameter(
      "client ignored our HelloRetryRequest",
    ));
  }

  let retry_group = groups_ext
    .and_then(|groups| negotiation::choose_group(&sess.config.groups, groups))
    .ok_or(incompatible("no kx group overlap with client"))?;

  {
    let hs = hs_of(sess);
    hs.hrr_issued = true;
    hs.hrr_group = Some(retry_group);
  }

  emit_hello_retry_request(sess, retry_group, client_hello.session_id.clone())?;
  Ok(ConnState::ExpectSecondClientHello13)
}

/* --- TLS 1.3 client auth and Finished --- */

fn handle_certificate_13(sess: &mut ServerSession, m: Message) -> Result<ConnState, Error> {
  let cert = extract_handshake!(m, HandshakePayload::CertificateTLS13)
    .unwrap()
    .clone();

  if !cert.request_context.0.is_empty() {
    return Err(Error::IllegalParameter(
      "certificate response carries a context",
    ));
  }

  let chain = cert.convert();
  hs_of(sess).transcript().add_message(&m);

  if chain.is_empty() {
    return match sess.config.client_auth {
      ClientAuthMode::Required => Err(Error::Certificate(CertError::Required)),
      _ => {
        info!("client declined client auth");
        hs_of(sess).doing_client_auth = false;
        Ok(ConnState::ExpectFinished13)
      }
    };
  }

  sess
    .ctx
    .verifier
    .verify_chain(&chain[0], &chain[1..], None, CertUsage::ClientAuth)?;

  hs_of(sess).valid_client_cert_chain = Some(chain);
  Ok(ConnState::ExpectCertificateVerify13)
}

pub static EXPECT_CERTIFICATE_13: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::Handshake],
    handshake_types: &[HandshakeType::Certificate],
  },
  handle: handle_certificate_13,
};

fn handle_certificate_verify_13(sess: &mut ServerSession, m: Message) -> Result<ConnState, Error> {
  let cert_verify = extract_handshake!(m, HandshakePayload::CertificateVerify)
    .unwrap()
    .clone();

  let handshake_hash = hs_of(sess).transcript().get_current_hash();
  let chain = hs_of(sess)
    .valid_client_cert_chain
    .clone()
    .ok_or(Error::Internal("no client chain"))?;

  let mut message = vec![0x20u8; 64];
  message.extend_from_slice(b"TLS 1.3, client CertificateVerify\x00");
  message.extend_from_slice(&handshake_hash);

  let public_key = sess.ctx.verifier.public_key(&chain[0])?;
  sess
    .common
    .provider
    .verify(cert_verify.scheme, &public_key, &message, &cert_verify.sig.0)
    .map_err(|_| Error::DecryptError)?;

  hs_of(sess).transcript().add_message(&m);
  Ok(ConnState::ExpectFinished13)
}

pub static EXPECT_CERTIFICATE_VERIFY_13: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::Handshake],
    handshake_types: &[HandshakeType::CertificateVerify],
  },
  handle: handle_certificate_verify_13,
};

fn emit_ticket_13(sess: &mut ServerSession) -> Result<(), Error> {
  if !sess.config.ticket_support {
    return Ok(());
  }

  let ticketer = match sess.ctx.ticketer.as_ref() {
    Some(ticketer) => ticketer,
    None => return Ok(()),
  };

  let suite = sess.common.get_suite();
  let key_schedule = sess.common.key_schedule.as_ref().expect("no key schedule");

  let mut nonce = [0u8; 8];
  sess.common.provider.random(&mut nonce)?;
  let mut age_add_bytes = [0u8; 4];
  sess.common.provider.random(&mut age_add_bytes)?;
  let age_add = u32::from_be_bytes(age_add_bytes);

  let psk = key_schedule.derive_ticket_psk(&sess.resumption_master_secret, &nonce)?;

  let now = TimeBase::now()?;
  let lifetime = ticketer.get_lifetime();

  let sni = sess
    .hs
    .as_ref()
    .and_then(|hs| hs.sni.clone())
    .unwrap_or_default();

  let mut session = SessionValue::new(
    ProtocolVersion::TLSv1_3,
    suite.suite,
    SessionID::empty(),
    psk,
    false,
    &sni,
    &sess.config.sid_ctx,
    now,
    lifetime,
  );
  session.age_add = age_add;
  if let Some(chain) = sess.hs.as_ref().and_then(|hs| hs.valid_client_cert_chain.clone()) {
    session.client_cert_chain = Some(chain);
  }

  let ticket = match ticketer.encrypt(&session) {
    Some(ticket) => ticket,
    None => return Ok(()),
  };

  let payload = NewSessionTicketPayloadTLS13::new(lifetime, age_add, nonce.to_vec(), ticket);
  let m = sess.common.build_hs(
    HandshakeType::NewSessionTicket,
    HandshakePayload::NewSessionTicketTLS13(payload),
  );
  /* post-handshake: not part of any transcript */
  sess.common.send_msg(m);
  sess.common.record.flush();
  Ok(())
}

fn handle_finished_13(sess: &mut ServerSession, m: Message) -> Result<ConnState, Error> {
  let finished = extract_handshake!(m, HandshakePayload::Finished)
    .unwrap()
    .clone();

  let handshake_hash = hs_of(sess).transcript().get_current_hash();
  let expect_verify_data = sess
    .common
    .key_schedule
    .as_ref()
    .expect("no key schedule")
    .sign_verify_data(SecretKind::ClientHandshakeTrafficSecret, &handshake_hash)?;

  if !sess
    .common
    .provider
    .constant_time_eq(&expect_verify_data, &finished.0)
  {
    error!("Finished wrong");
    return Err(Error::DecryptError);
  }

  hs_of(sess).transcript().add_message(&m);

  /* Client Finished contributes to the resumption secret. */
  let full_hash = hs_of(sess).transcript().get_current_hash();
  let pending_read = std::mem::take(&mut hs_of(sess).pending_client_app_secret);
  {
    let key_schedule = sess.common.key_schedule.as_mut().expect("no key schedule");
    sess.resumption_master_secret =
      key_schedule.derive(SecretKind::ResumptionMasterSecret, &full_hash)?;
    key_schedule.current_client_traffic_secret = pending_read.clone();
  }
  sess.common.install_read_key(pending_read);

  /* Tickets go out while the workspace (SNI, client chain) is still
   * around. */
  emit_ticket_13(sess)?;

  let mut hs = sess.hs.take().expect("no handshake");
  sess.retained_transcript = Some(hs.transcript().fork());
  sess.client_offered_pha = hs.client_offered_pha;
  sess.common.peer_certificates = hs.valid_client_cert_chain.clone();

  sess.common.middlebox_ccs_ok = false;
  sess.common.traffic = true;
  sess.common.flush_plaintext();

  Ok(ConnState::Traffic)
}

pub static EXPECT_FINISHED_13: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::Handshake],
    handshake_types: &[HandshakeType::Finished],
  },
  handle: handle_finished_13,
};

/* --- TLS 1.2 family --- */

fn handle_client_hello_tls12(
  sess: &mut ServerSession,
  client_hello: &ClientHelloPayload,
  m: &Message,
) -> Result<ConnState, Error> {
  let suite = sess.common.get_suite();

  /* Point formats: uncompressed or nothing. */
  if matches!(
    suite.kx,
    KeyExchangeAlgorithm::ECDHE | KeyExchangeAlgorithm::ECDHE_PSK
  ) {
    if let Some(ecpoints) = client_hello.get_ecpoints_extension() {
      if !ecpoints.contains(&ECPointFormat::Uncompressed) {
        return Err(Error::IllegalParameter(
          "client cannot do uncompressed ec points",
        ));
      }
    }
  }

  /* Extended master secret and encrypt-then-MAC: both sticky. */
  let renegotiating = hs_of(sess).renegotiating;
  let ems_offered = client_hello.ems_offered();
  let etm_offered = client_hello.etm_offered() && suite.bulk.is_cbc();
  if renegotiating {
    negotiation::check_ems_continuity(sess.common.ems, ems_offered)?;
    negotiation::check_etm_continuity(sess.common.etm, etm_offered)?;
  }
  sess.common.ems = ems_offered;
  sess.common.etm = etm_offered;

  hs_of(sess).transcript().add_message(m);

  /* -- Resumption --
   * Either a ticket that decrypts, or a session-id in our cache.  A
   * ticket suppresses the session-id path entirely. */
  let may_resume = !renegotiating || sess.config.resume_on_renego;
  let now = TimeBase::now()?;

  let mut ticket_received = false;
  if let Some(ext) = client_hello.get_ticket_extension() {
    if let crate::msgs::handshake::ClientExtension::SessionTicketOffer(ticket) = ext {
      ticket_received = true;
      info!("Ticket received");

      let decrypted = sess
        .ctx
        .ticketer
        .as_ref()
        .map(|ticketer| ticketer.decrypt(&ticket.0, now));

      if let Some((maybe_session, needs_renew)) = decrypted {
        if let Some(session) = maybe_session {
          if may_resume && resumption_acceptable(sess, client_hello, &session, now)? {
            hs_of(sess).send_ticket |= needs_renew;
            return start_resumption(sess, client_hello, &client_hello.session_id, session);
          }
        } else {
          info!("Ticket didn't decrypt or validate; full handshake");
        }
      }
    }
  }

  if may_resume
    && !ticket_received
    && !client_hello.session_id.is_empty()
    && sess.config.session_cache_mode.server_enabled()
  {
    let maybe_session = sess
      .ctx
      .server_sessions
      .lookup(client_hello.session_id.as_bytes(), now)
      .map(|arc| (*arc).clone());

    if let Some(session) = maybe_session {
      if resumption_acceptable(sess, client_hello, &session, now)? {
        let id = client_hello.session_id.clone();
        return start_resumption(sess, client_hello, &id, session);
      }
    }
  }

  /* -- Full handshake -- */

  if sess.config.session_cache_mode.server_enabled() && !sess.common.is_datagram {
    let mut id = [0u8; 32];
    sess.common.provider.random(&mut id)?;
    hs_of(sess).session_id = SessionID::new(&id);
  }

  let sigscheme = if suite.sign != crate::msgs::enums::SignatureAlgorithm::Anonymous
    && suite.requires_server_kx()
  {
    let client_sigalgs = hs_of(sess).client_sigalgs.clone();
    let offered: Vec<SignatureScheme> = client_sigalgs
      .into_iter()
      .filter(|scheme| sess.config.sig_algs.contains(scheme))
      .collect();
    Some(
      suite
        .resolve_sig_scheme(&offered)
        .ok_or(incompatible("no supported sig scheme"))?,
    )
  } else {
    None
  };

  let group = match suite.kx {
    KeyExchangeAlgorithm::ECDHE | KeyExchangeAlgorithm::ECDHE_PSK => {
      let groups_ext = client_hello
        .get_namedgroups_extension()
        .ok_or_else(|| incompatible("client didn't describe groups"))?;
      let ec_groups: Vec<NamedGroup> = sess
        .config
        .groups
        .iter()
        .filter(|group| !group.is_ffdhe())
        .copied()
        .collect();
      Some(
        negotiation::choose_group(&ec_groups, groups_ext)
          .ok_or(incompatible("no supported group"))?,
      )
    }
    KeyExchangeAlgorithm::DHE | KeyExchangeAlgorithm::DHE_PSK => Some(NamedGroup::FFDHE2048),
    _ => None,
  };

  emit_server_hello_12(sess, client_hello)?;
  if suite.requires_server_cert() {
    emit_certificate_12(sess)?;
  }
  emit_server_kx(sess, sigscheme, group)?;
  emit_certificate_req_12(sess)?;
  emit_server_hello_done(sess);
  sess.common.record.flush();

  if hs_of(sess).doing_client_auth {
    Ok(ConnState::ExpectCertificate12)
  } else {
    Ok(ConnState::ExpectClientKx)
  }
}

/// All the gates between "the session decrypted/was found" and "we will
/// actually resume it".
fn resumption_acceptable(
  sess: &mut ServerSession,
  client_hello: &ClientHelloPayload,
  session: &SessionValue,
  now: TimeBase,
) -> Result<bool, Error> {
  let suite = sess.common.get_suite();

  if !session.can_resume_with(suite, &sess.config.sid_ctx, now) {
    return Ok(false);
  }

  /* SNI must be stable across resumption. */
  negotiation::check_resumption_sni(client_hello.get_sni_hostname(), session.sni_str())?;

  /* An EMS session resumed without EMS is fatal; a non-EMS session with
   * EMS offered falls back to a full handshake. */
  if session.extended_ms && !client_hello.ems_offered() {
    return Err(Error::HandshakeFailure(
      "EMS session resumed without extended master secret",
    ));
  }
  if !session.extended_ms && client_hello.ems_offered() {
    return Ok(false);
  }

  Ok(true)
}

fn emit_server_hello_12(
  sess: &mut ServerSession,
  client_hello: &ClientHelloPayload,
) -> Result<(), Error> {
  let suite = sess.common.get_suite();
  let extensions = process_extensions_12(sess, client_hello)?;
  let wire_version = sess.common.wire_version();

  let hs = hs_of(sess);
  let sh = ServerHelloPayload {
    legacy_version: wire_version,
    random: Random(hs.randoms.server),
    session_id: hs.session_id.clone(),
    cipher_suite: suite.suite,
    compression_method: crate::msgs::enums::Compression::Null,
    extensions,
  };

  debug!("sending server hello {:?}", sh);
  send_hs_msg(sess, HandshakeType::ServerHello, HandshakePayload::ServerHello(sh));
  Ok(())
}

fn emit_certificate_12(sess: &mut ServerSession) -> Result<(), Error> {
  let chain = hs_of(sess)
    .identity
    .as_ref()
    .map(|identity| identity.chain.clone())
    .ok_or(Error::Internal("no server identity"))?;

  send_hs_msg(sess, HandshakeType::Certificate, HandshakePayload::Certificate(chain));
  Ok(())
}

fn emit_server_kx(
  sess: &mut ServerSession,
  sigscheme: Option<SignatureScheme>,
  group: Option<NamedGroup>,
) -> Result<(), Error> {
  let suite = sess.common.get_suite();
  let provider = sess.common.provider.clone();

  let hint = sess
    .config
    .psk_identity_hint
    .clone()
    .map(PayloadU16::new)
    .unwrap_or_else(PayloadU16::empty);

  let skx = match suite.kx {
    KeyExchangeAlgorithm::RSA => return Ok(()),

    KeyExchangeAlgorithm::PSK | KeyExchangeAlgorithm::RSA_PSK => {
      if sess.config.psk_identity_hint.is_none() {
        return Ok(());
      }
      ServerKeyExchangePayload::Psk(PskServerKeyExchange {
        hint,
        ecdh_params: None,
        dh_params: None,
      })
    }

    KeyExchangeAlgorithm::ECDHE | KeyExchangeAlgorithm::ECDHE_PSK => {
      let group = group.ok_or(Error::Internal("missing group"))?;
      let kx = provider
        .start_kx(group)
        .map_err(|_| incompatible("cannot start key exchange"))?;
      let params = ServerECDHParams::new(group, kx.pub_key());

      let skx = if suite.kx == KeyExchangeAlgorithm::ECDHE {
        let scheme = sigscheme.ok_or(Error::Internal("missing sigscheme"))?;
        let sig = sign_kx_params(sess, scheme, &params.get_encoding())?;
        ServerKeyExchangePayload::ECDHE(ECDHEServerKeyExchange {
          params,
          dss: sig,
        })
      } else {
        ServerKeyExchangePayload::Psk(PskServerKeyExchange {
          hint,
          ecdh_params: Some(params),
          dh_params: None,
        })
      };

      hs_of(sess).kx_data = Some(kx);
      skx
    }

    KeyExchangeAlgorithm::DHE | KeyExchangeAlgorithm::DHE_PSK => {
      let group = group.ok_or(Error::Internal("missing group"))?;
      let (p, g) = kx::ffdhe_params(group).ok_or(Error::Internal("unknown ffdhe group"))?;
      let kx = provider
        .start_kx(group)
        .map_err(|_| incompatible("cannot start key exchange"))?;
      let params = ServerDHParams {
        dh_p: PayloadU16::new(p.to_vec()),
        dh_g: PayloadU16::new(g.to_vec()),
        dh_ys: PayloadU16::new(kx.pub_key().to_vec()),
      };

      let skx = if suite.kx == KeyExchangeAlgorithm::DHE {
        let scheme = sigscheme.ok_or(Error::Internal("missing sigscheme"))?;
        let sig = sign_kx_params(sess, scheme, &params.get_encoding())?;
        ServerKeyExchangePayload::DHE(DHEServerKeyExchange { params, dss: sig })
      } else {
        ServerKeyExchangePayload::Psk(PskServerKeyExchange {
          hint,
          ecdh_params: None,
          dh_params: Some(params),
        })
      };

      hs_of(sess).kx_data = Some(kx);
      skx
    }

    KeyExchangeAlgorithm::ECC_TLCP => {
      /* TLCP signs the randoms and the encryption certificate. */
      let enc_cert = {
        let identity = hs_of(sess)
          .identity
          .as_ref()
          .ok_or(Error::Internal("no server identity"))?;
        if identity.chain.len() < 2 {
          return Err(Error::Internal("TLCP identity lacks encryption certificate"));
        }
        identity.chain[1].clone()
      };

      let mut signed = Vec::new();
      crate::msgs::codec::encode_u24(enc_cert.0.len() as u32, &mut signed);
      signed.extend_from_slice(&enc_cert.0);

      let sig = sign_kx_params(sess, SignatureScheme::SM2SIG_SM3, &signed)?;
      ServerKeyExchangePayload::Tlcp(TlcpServerKeyExchange { dss: sig })
    }

    KeyExchangeAlgorithm::BulkOnly => return Err(Error::Internal("TLS 1.3 suite in 1.2 flow")),
  };

  send_hs_msg(
    sess,
    HandshakeType::ServerKeyExchange,
    HandshakePayload::ServerKeyExchange(skx),
  );
  Ok(())
}

/// Sign `client_random || server_random || params` with our key.
fn sign_kx_params(
  sess: &mut ServerSession,
  scheme: SignatureScheme,
  params: &[u8],
) -> Result<DigitallySignedStruct, Error> {
  let mut message = Vec::new();
  {
    let hs = hs_of(sess);
    message.extend_from_slice(&hs.randoms.client);
    message.extend_from_slice(&hs.randoms.server);
  }
  message.extend_from_slice(params);

  let signer = hs_of(sess)
    .identity
    .as_ref()
    .map(|identity| identity.signer.clone())
    .ok_or(Error::Internal("no signer"))?;

  let sig = signer.sign(scheme, &message)?;
  Ok(DigitallySignedStruct::new(scheme, sig))
}

fn emit_certificate_req_12(sess: &mut ServerSession) -> Result<(), Error> {
  if sess.config.client_auth == ClientAuthMode::None {
    return Ok(());
  }

  let suite = sess.common.get_suite();
  if suite.kx.is_psk() {
    // RFC 4279 forbids client auth under PSK key exchange
    return Ok(());
  }

  let certtypes: ClientCertificateTypes = vec![
    crate::msgs::enums::ClientCertificateType::RSASign,
    crate::msgs::enums::ClientCertificateType::ECDSASign,
  ];

  let cr = CertificateRequestPayload {
    certtypes,
    sigschemes: sess.config.sig_algs.clone(),
    canames: Vec::new(),
  };

  debug!("Sending CertificateRequest {:?}", cr);
  send_hs_msg(
    sess,
    HandshakeType::CertificateRequest,
    HandshakePayload::CertificateRequest(cr),
  );
  hs_of(sess).doing_client_auth = true;
  Ok(())
}

fn emit_server_hello_done(sess: &mut ServerSession) {
  send_hs_msg(
    sess,
    HandshakeType::ServerHelloDone,
    HandshakePayload::ServerHelloDone,
  );
}

fn start_resumption(
  sess: &mut ServerSession,
  client_hello: &ClientHelloPayload,
  id: &SessionID,
  session: SessionValue,
) -> Result<ConnState, Error> {
  info!("Resuming session");

  let suite = sess.common.get_suite();

  {
    let hs = hs_of(sess);
    hs.session_id = id.clone();
    hs.doing_resume = true;
    hs.valid_client_cert_chain = session.client_cert_chain.clone();
  }

  emit_server_hello_12(sess, client_hello)?;

  let secrets = SessionSecrets::new_resume(
    sess.common.provider.clone(),
    suite.get_hash(),
    &hs_of(sess).randoms.clone(),
    &session.master_secret.0,
  );
  sess.common.secrets = Some(secrets);
  sess.common.start_encryption_tls12()?;

  emit_ticket_12(sess)?;
  sess.common.send_ccs();
  emit_finished_12(sess)?;
  sess.common.record.flush();

  Ok(ConnState::ExpectCcs)
}

/* --- client's second flight --- */

fn handle_certificate_12(sess: &mut ServerSession, m: Message) -> Result<ConnState, Error> {
  hs_of(sess).transcript().add_message(&m);
  let cert_chain = extract_handshake!(m, HandshakePayload::Certificate)
    .unwrap()
    .clone();

  if cert_chain.is_empty() {
    return match sess.config.client_auth {
      ClientAuthMode::Required => Err(Error::Certificate(CertError::AccessDenied)),
      _ => {
        info!("client auth requested but no certificate supplied");
        let hs = hs_of(sess);
        hs.doing_client_auth = false;
        hs.transcript().abandon_client_auth();
        Ok(ConnState::ExpectClientKx)
      }
    };
  }

  sess
    .ctx
    .verifier
    .verify_chain(&cert_chain[0], &cert_chain[1..], None, CertUsage::ClientAuth)?;

  hs_of(sess).valid_client_cert_chain = Some(cert_chain);
  Ok(ConnState::ExpectClientKx)
}

pub static EXPECT_CERTIFICATE_12: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::Handshake],
    handshake_types: &[HandshakeType::Certificate],
  },
  handle: handle_certificate_12,
};

fn lookup_psk(sess: &ServerSession, identity: &[u8]) -> Result<Vec<u8>, Error> {
  if let Some(ref callback) = sess.config.psk_server_callback {
    if let Some(psk) = callback(identity) {
      return Ok(psk);
    }
  }

  for external in &sess.config.external_psks {
    if external.identity == identity {
      return Ok(external.key.clone());
    }
  }

  Err(Error::UnknownPskIdentity)
}

/// Unseal a key-transport premaster.  A failed decryption or a version
/// mismatch substitutes random bytes so the failure surfaces as a
/// Finished mismatch rather than an oracle.
fn unseal_premaster(sess: &mut ServerSession, sealed: &[u8]) -> Result<Vec<u8>, Error> {
  let provider = sess.common.provider.clone();
  let expected_version = hs_of(sess).client_legacy_version;

  let decrypter = hs_of(sess)
    .identity
    .as_ref()
    .and_then(|identity| identity.decrypter.clone())
    .ok_or(Error::Internal("no decryption key"))?;

  let mut premaster = match decrypter.decrypt(sealed) {
    Ok(plain) => plain,
    Err(_) => Vec::new(),
  };

  let version_ok = premaster.len() == 48
    && premaster[..2] == expected_version.get_u16().to_be_bytes();

  if !version_ok {
    warn!("premaster unseal failed; substituting random");
    let mut random = vec![0u8; 48];
    provider.random(&mut random)?;
    let v = expected_version.get_u16().to_be_bytes();
    random[0] = v[0];
    random[1] = v[1];
    premaster = random;
  }

  Ok(premaster)
}

fn handle_client_kx(sess: &mut ServerSession, m: Message) -> Result<ConnState, Error> {
  let client_kx = extract_handshake!(m, HandshakePayload::ClientKeyExchange)
    .unwrap()
    .clone();
  hs_of(sess).transcript().add_message(&m);

  let suite = sess.common.get_suite();
  let mut rd = Reader::init(&client_kx.0);

  let premaster = match suite.kx {
    KeyExchangeAlgorithm::ECDHE => {
      let params =
        ClientECDHParams::read(&mut rd).ok_or(Error::DecodeError("bad ClientKeyExchange"))?;
      let kx = hs_of(sess)
        .kx_data
        .take()
        .ok_or(Error::Internal("no kx in progress"))?;
      kx::complete_kx(kx, &params.public.0)?.shared_secret.clone()
    }

    KeyExchangeAlgorithm::DHE => {
      let yc = PayloadU16::read(&mut rd).ok_or(Error::DecodeError("bad ClientKeyExchange"))?;
      let kx = hs_of(sess)
        .kx_data
        .take()
        .ok_or(Error::Internal("no kx in progress"))?;
      kx::complete_kx(kx, &yc.0)?.shared_secret.clone()
    }

    KeyExchangeAlgorithm::RSA => {
      let sealed = PayloadU16::read(&mut rd).ok_or(Error::DecodeError("bad ClientKeyExchange"))?;
      unseal_premaster(sess, &sealed.0)?
    }

    KeyExchangeAlgorithm::ECC_TLCP => {
      let tlcp = TlcpClientKeyExchange::read(&mut rd)
        .ok_or(Error::DecodeError("bad ClientKeyExchange"))?;
      unseal_premaster(sess, &tlcp.encrypted_premaster.0)?
    }

    KeyExchangeAlgorithm::PSK => {
      let identity =
        PayloadU16::read(&mut rd).ok_or(Error::DecodeError("bad ClientKeyExchange"))?;
      let psk = lookup_psk(sess, &identity.0)?;
      kx::plain_psk_premaster(&psk)
    }

    KeyExchangeAlgorithm::ECDHE_PSK => {
      let identity =
        PayloadU16::read(&mut rd).ok_or(Error::DecodeError("bad ClientKeyExchange"))?;
      let params =
        ClientECDHParams::read(&mut rd).ok_or(Error::DecodeError("bad ClientKeyExchange"))?;
      let psk = lookup_psk(sess, &identity.0)?;
      let kx = hs_of(sess)
        .kx_data
        .take()
        .ok_or(Error::Internal("no kx in progress"))?;
      let shared = kx::complete_kx(kx, &params.public.0)?;
      kx::psk_premaster(&shared.shared_secret, &psk)
    }

    KeyExchangeAlgorithm::DHE_PSK => {
      let identity =
        PayloadU16::read(&mut rd).ok_or(Error::DecodeError("bad ClientKeyExchange"))?;
      let yc = PayloadU16::read(&mut rd).ok_or(Error::DecodeError("bad ClientKeyExchange"))?;
      let psk = lookup_psk(sess, &identity.0)?;
      let kx = hs_of(sess)
        .kx_data
        .take()
        .ok_or(Error::Internal("no kx in progress"))?;
      let shared = kx::complete_kx(kx, &yc.0)?;
      kx::psk_premaster(&shared.shared_secret, &psk)
    }

    KeyExchangeAlgorithm::RSA_PSK => {
      let identity =
        PayloadU16::read(&mut rd).ok_or(Error::DecodeError("bad ClientKeyExchange"))?;
      let sealed = PayloadU16::read(&mut rd).ok_or(Error::DecodeError("bad ClientKeyExchange"))?;
      let psk = lookup_psk(sess, &identity.0)?;
      let premaster = unseal_premaster(sess, &sealed.0)?;
      kx::psk_premaster(&premaster, &psk)
    }

    KeyExchangeAlgorithm::BulkOnly => return Err(Error::Internal("TLS 1.3 suite in 1.2 flow")),
  };

  if rd.any_left() {
    return Err(Error::DecodeError("trailing bytes in ClientKeyExchange"));
  }

  /* Derive the master secret.  With EMS it binds to the transcript
   * through this very message. */
  let provider = sess.common.provider.clone();
  let randoms = hs_of(sess).randoms.clone();
  let secrets = if sess.common.ems {
    let session_hash = hs_of(sess).transcript().get_current_hash();
    SessionSecrets::new_ems(provider, suite.get_hash(), &randoms, &premaster, &session_hash)?
  } else {
    SessionSecrets::new(provider, suite.get_hash(), &randoms, &premaster)?
  };
  sess.common.secrets = Some(secrets);
  sess.common.start_encryption_tls12()?;

  if hs_of(sess).doing_client_auth {
    Ok(ConnState::ExpectCertificateVerify12)
  } else {
    Ok(ConnState::ExpectCcs)
  }
}

pub static EXPECT_CLIENT_KX: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::Handshake],
    handshake_types: &[HandshakeType::ClientKeyExchange],
  },
  handle: handle_client_kx,
};

fn handle_certificate_verify_12(sess: &mut ServerSession, m: Message) -> Result<ConnState, Error> {
  let sig = extract_handshake!(m, HandshakePayload::CertificateVerify)
    .unwrap()
    .clone();

  if !sess.config.sig_algs.contains(&sig.scheme) {
    return Err(Error::IllegalParameter("client signed with unoffered scheme"));
  }

  let chain = hs_of(sess)
    .valid_client_cert_chain
    .clone()
    .ok_or(Error::Internal("no client chain"))?;
  let handshake_msgs = hs_of(sess)
    .transcript()
    .take_handshake_buf()
    .ok_or(Error::Internal("client auth buffer missing"))?;

  let public_key = sess.ctx.verifier.public_key(&chain[0])?;
  if sess
    .common
    .provider
    .verify(sig.scheme, &public_key, &handshake_msgs, &sig.sig.0)
    .is_err()
  {
    return Err(Error::Certificate(CertError::AccessDenied));
  }

  debug!("client CertificateVerify OK");
  hs_of(sess).transcript().add_message(&m);
  Ok(ConnState::ExpectCcs)
}

pub static EXPECT_CERTIFICATE_VERIFY_12: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::Handshake],
    handshake_types: &[HandshakeType::CertificateVerify],
  },
  handle: handle_certificate_verify_12,
};

fn handle_ccs(_sess: &mut ServerSession, _m: Message) -> Result<ConnState, Error> {
  /* nb. the record layer validates CCS contents and switches its read
   * state. */
  Ok(ConnState::ExpectFinished12)
}

pub static EXPECT_CCS: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::ChangeCipherSpec],
    handshake_types: &[],
  },
  handle: handle_ccs,
};

fn emit_ticket_12(sess: &mut ServerSession) -> Result<(), Error> {
  if !hs_of(sess).send_ticket {
    return Ok(());
  }

  /* If a ticket cannot be produced we cannot report an error here; an
   * empty one tells the client not to bother storing it. */
  let ctx = sess.ctx.clone();
  let (lifetime, ticket) = match ctx.ticketer.as_ref() {
    Some(ticketer) => {
      let session = server_session_value(sess)?;
      (
        ticketer.get_lifetime(),
        ticketer.encrypt(&session).unwrap_or_default(),
      )
    }
    None => (0, Vec::new()),
  };

  let payload = NewSessionTicketPayload::new(lifetime, ticket);
  send_hs_msg(
    sess,
    HandshakeType::NewSessionTicket,
    HandshakePayload::NewSessionTicket(payload),
  );
  Ok(())
}

fn emit_finished_12(sess: &mut ServerSession) -> Result<(), Error> {
  let vh = hs_of(sess).transcript().get_current_hash();
  let verify_data = sess
    .common
    .secrets
    .as_ref()
    .expect("no secrets")
    .server_verify_data(&vh)?;

  sess.common.server_verify_data = verify_data.clone();

  let f = sess.common.build_hs(
    HandshakeType::Finished,
    HandshakePayload::Finished(Payload::new(verify_data)),
  );
  hs_of(sess).transcript().add_message(&f);
  sess.common.send_msg(f);
  Ok(())
}

fn server_session_value(sess: &mut ServerSession) -> Result<SessionValue, Error> {
  let suite = sess.common.get_suite();
  let master = sess
    .common
    .secrets
    .as_ref()
    .expect("no secrets")
    .get_master_secret();
  let now = TimeBase::now()?;
  let version = sess
    .common
    .negotiated_version
    .ok_or(Error::Internal("version not negotiated"))?;
  let ems = sess.common.ems;

  let (sni, session_id, client_cert_chain) = {
    let hs = hs_of(sess);
    (
      hs.sni.clone().unwrap_or_default(),
      hs.session_id.clone(),
      hs.valid_client_cert_chain.clone(),
    )
  };

  let mut session = SessionValue::new(
    version,
    suite.suite,
    session_id,
    master,
    ems,
    &sni,
    &sess.config.sid_ctx,
    now,
    7200,
  );
  session.client_cert_chain = client_cert_chain;
  Ok(session)
}

fn handle_finished_12(sess: &mut ServerSession, m: Message) -> Result<ConnState, Error> {
  let finished = extract_handshake!(m, HandshakePayload::Finished)
    .unwrap()
    .clone();

  let vh = hs_of(sess).transcript().get_current_hash();
  let expect_verify_data = sess
    .common
    .secrets
    .as_ref()
    .expect("no secrets")
    .client_verify_data(&vh)?;

  if !sess
    .common
    .provider
    .constant_time_eq(&expect_verify_data, &finished.0)
  {
    error!("Finished wrong");
    return Err(Error::DecryptError);
  }

  sess.common.client_verify_data = finished.0.clone();
  hs_of(sess).transcript().add_message(&m);

  let doing_resume = hs_of(sess).doing_resume;

  /* Only now, with the client proven, may the session enter the shared
   * cache. */
  if !doing_resume
    && !hs_of(sess).session_id.is_empty()
    && sess.config.session_cache_mode.server_enabled()
  {
    let session = server_session_value(sess)?;
    if sess.ctx.server_sessions.insert(session) {
      info!("Session saved");
    }
  }

  if !doing_resume {
    emit_ticket_12(sess)?;
    sess.common.send_ccs();
    emit_finished_12(sess)?;
  }
  sess.common.record.flush();

  let hs = sess.hs.take().expect("no handshake");
  sess.common.peer_certificates = hs.valid_client_cert_chain.clone();
  sess.common.traffic = true;
  sess.common.flush_plaintext();

  Ok(ConnState::Traffic)
}

pub static EXPECT_FINISHED_12: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::Handshake],
    handshake_types: &[HandshakeType::Finished],
  },
  handle: handle_finished_12,
};

/* --- Traffic --- */

pub fn emit_key_update(sess: &mut ServerSession, request_peer_update: bool) -> Result<(), Error> {
  if !sess.common.traffic || !sess.common.is_tls13() {
    return Err(Error::HandshakeNotComplete);
  }

  let request = if request_peer_update {
    KeyUpdateRequest::UpdateRequested
  } else {
    KeyUpdateRequest::UpdateNotRequested
  };

  let m = sess
    .common
    .build_hs(HandshakeType::KeyUpdate, HandshakePayload::KeyUpdate(request));
  sess.common.send_msg(m);
  sess.common.record.flush();

  let ks = sess.common.key_schedule.as_mut().expect("no key schedule");
  let next = ks.next_traffic_secret(&ks.current_server_traffic_secret)?;
  ks.current_server_traffic_secret = next.clone();
  sess.common.install_write_key(next);
  Ok(())
}

/// Inject a post-handshake CertificateRequest (TLS 1.3 only, and only if
/// the client advertised support).
pub fn request_post_handshake_auth(sess: &mut ServerSession) -> Result<(), Error> {
  if !sess.common.traffic || !sess.common.is_tls13() {
    return Err(Error::HandshakeNotComplete);
  }
  if !sess.client_offered_pha {
    return Err(Error::HandshakeFailure(
      "client did not offer post-handshake auth",
    ));
  }
  if sess.pha.is_some() {
    return Err(Error::HandshakeFailure("post-handshake auth already running"));
  }

  let mut context = vec![0u8; 16];
  sess.common.provider.random(&mut context)?;
  let context = PayloadU8::new(context);

  let certreq = CertificateRequestPayloadTLS13 {
    context: context.clone(),
    extensions: vec![CertReqExtension::SignatureAlgorithms(
      sess.config.sig_algs.clone(),
    )],
  };

  let m = sess.common.build_hs(
    HandshakeType::CertificateRequest,
    HandshakePayload::CertificateRequestTLS13(certreq),
  );

  let mut transcript = sess
    .retained_transcript
    .as_ref()
    .ok_or(Error::Internal("no retained transcript"))?
    .fork();
  transcript.add_message(&m);

  sess.common.send_msg(m);
  sess.common.record.flush();

  sess.pha = Some(PhaProgress::ExpectCertificate {
    transcript,
    context,
  });
  Ok(())
}

fn handle_key_update(sess: &mut ServerSession, m: &Message) -> Result<(), Error> {
  let request = *extract_handshake!(m, HandshakePayload::KeyUpdate).unwrap();

  {
    let ks = sess.common.key_schedule.as_mut().expect("no key schedule");
    let next = ks.next_traffic_secret(&ks.current_client_traffic_secret)?;
    ks.current_client_traffic_secret = next.clone();
    sess.common.install_read_key(next);
  }

  if request == KeyUpdateRequest::UpdateRequested {
    emit_key_update(sess, false)?;
  }

  Ok(())
}

fn handle_pha_message(sess: &mut ServerSession, m: &Message) -> Result<(), Error> {
  let progress = sess
    .pha
    .take()
    .ok_or(Error::InappropriateHandshakeMessage {
      expect_types: vec![HandshakeType::KeyUpdate],
      got_type: m.handshake_type().unwrap_or(HandshakeType::Unknown(0)),
    })?;

  match progress {
    PhaProgress::ExpectCertificate {
      mut transcript,
      context,
    } => {
      let cert = extract_handshake!(m, HandshakePayload::CertificateTLS13)
        .ok_or(Error::InappropriateHandshakeMessage {
          expect_types: vec![HandshakeType::Certificate],
          got_type: m.handshake_type().unwrap_or(HandshakeType::Unknown(0)),
        })?
        .clone();

      if cert.request_context != context {
        return Err(Error::IllegalParameter("certificate context mismatch"));
      }

      transcript.add_message(m);
      let chain = cert.convert();

      if chain.is_empty() {
        if sess.config.client_auth == ClientAuthMode::Required {
          return Err(Error::Certificate(CertError::Required));
        }
        sess.pha = Some(PhaProgress::ExpectFinished {
          transcript,
          chain,
        });
        return Ok(());
      }

      sess
        .ctx
        .verifier
        .verify_chain(&chain[0], &chain[1..], None, CertUsage::ClientAuth)?;

      sess.pha = Some(PhaProgress::ExpectCertificateVerify { transcript, chain });
      Ok(())
    }

    PhaProgress::ExpectCertificateVerify {
      mut transcript,
      chain,
    } => {
      let cert_verify = extract_handshake!(m, HandshakePayload::CertificateVerify)
        .ok_or(Error::InappropriateHandshakeMessage {
          expect_types: vec![HandshakeType::CertificateVerify],
          got_type: m.handshake_type().unwrap_or(HandshakeType::Unknown(0)),
        })?
        .clone();

      let mut message = vec![0x20u8; 64];
      message.extend_from_slice(b"TLS 1.3, client CertificateVerify\x00");
      message.extend_from_slice(&transcript.get_current_hash());

      let public_key = sess.ctx.verifier.public_key(&chain[0])?;
      sess
        .common
        .provider
        .verify(cert_verify.scheme, &public_key, &message, &cert_verify.sig.0)
        .map_err(|_| Error::DecryptError)?;

      transcript.add_message(m);
      sess.pha = Some(PhaProgress::ExpectFinished { transcript, chain });
      Ok(())
    }

    PhaProgress::ExpectFinished { transcript, chain } => {
      let finished = extract_handshake!(m, HandshakePayload::Finished)
        .ok_or(Error::InappropriateHandshakeMessage {
          expect_types: vec![HandshakeType::Finished],
          got_type: m.handshake_type().unwrap_or(HandshakeType::Unknown(0)),
        })?
        .clone();

      let expect = sess
        .common
        .key_schedule
        .as_ref()
        .expect("no key schedule")
        .sign_verify_data(
          SecretKind::ClientApplicationTrafficSecret,
          &transcript.get_current_hash(),
        )?;

      if !sess.common.provider.constant_time_eq(&expect, &finished.0) {
        return Err(Error::DecryptError);
      }

      if !chain.is_empty() {
        sess.common.peer_certificates = Some(chain);
      }
      info!("post-handshake client auth complete");
      Ok(())
    }
  }
}

fn handle_traffic(sess: &mut ServerSession, mut m: Message) -> Result<ConnState, Error> {
  if m.is_content_type(ContentType::ApplicationData) {
    let payload = m.take_opaque_payload().expect("opaque payload");
    sess.common.take_received_plaintext(&payload.0);
    return Ok(ConnState::Traffic);
  }

  if m.is_handshake_type(HandshakeType::ClientHello) {
    if sess.common.is_tls13() {
      return Err(Error::InappropriateHandshakeMessage {
        expect_types: vec![HandshakeType::KeyUpdate],
        got_type: HandshakeType::ClientHello,
      });
    }

    if !sess.config.renegotiation_allowed {
      /* Observed server behaviour in the wild is split between warning
       * and silence; we warn and carry on. */
      sess
        .common
        .send_warning_alert(AlertDescription::NoRenegotiation);
      return Ok(ConnState::Traffic);
    }

    info!("Client requested renegotiation");
    sess.common.traffic = false;
    sess.hs = Some(ServerHandshakeData::new(true));
    return handle_client_hello(sess, m);
  }

  if !sess.common.is_tls13() {
    return Err(Error::InappropriateHandshakeMessage {
      expect_types: vec![HandshakeType::ClientHello],
      got_type: m.handshake_type().unwrap_or(HandshakeType::Unknown(0)),
    });
  }

  if m.is_handshake_type(HandshakeType::KeyUpdate) && sess.pha.is_none() {
    handle_key_update(sess, &m)?;
    return Ok(ConnState::Traffic);
  }

  handle_pha_message(sess, &m)?;
  Ok(ConnState::Traffic)
}

pub static TRAFFIC: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::ApplicationData, ContentType::Handshake],
    handshake_types: &[
      HandshakeType::ClientHello,
      HandshakeType::KeyUpdate,
      HandshakeType::Certificate,
      HandshakeType::CertificateVerify,
      HandshakeType::Finished,
    ],
  },
  handle: handle_traffic,
};

fn handle_closed(_sess: &mut ServerSession, _m: Message) -> Result<ConnState, Error> {
  Err(Error::HandshakeNotComplete)
}

pub static CLOSED: Handler = Handler {
  expect: Expectation {
    content_types: &[],
    handshake_types: &[],
  },
  handle: handle_closed,
};
