use crate::client::{
  default_sig_algs, ClientHandshakeData, ClientSession, ConnState, OfferedPsk,
};
use crate::error::Error;
use crate::key_schedule::{KeySchedule, SecretKind};
use crate::kx;
use crate::msgs::base::{Payload, PayloadU16, PayloadU8};
use crate::msgs::codec::Codec;
use crate::msgs::enums::{
  AlertDescription, ContentType, ExtensionType, HandshakeType, KeyUpdateRequest, NamedGroup,
  ProtocolVersion,
};
use crate::msgs::handshake::{
  CertificatePayloadTLS13, ClientExtension, ClientHelloPayload, ClientECDHParams,
  ConvertProtocolNameList, DecomposedSignatureScheme, DigitallySignedStruct, ECPointFormatList,
  HandshakePayload, HasServerExtensions, HelloRetryRequest, KeyShareEntry, PresharedKeyIdentity,
  PresharedKeyOffer, ProtocolNameList, ServerHelloPayload, ServerKeyExchangePayload, SessionID,
  SupportedPointFormats, TlcpClientKeyExchange,
};
use crate::msgs::handshake::KeyExchangeAlgorithm;
use crate::msgs::message::{Message, MessagePayload};
use crate::msgs::persist::SessionValue;
use crate::negotiation;
use crate::provider::{CertUsage, KeyTransport};
use crate::session::{Expectation, SessionSecrets};
use crate::ticketer::TimeBase;

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

pub type HandleFunction = fn(&mut ClientSession, m: Message) -> Result<ConnState, Error>;

/* These are effectively operations on the ClientSession, variant on the
 * connection state.  They must not have state of their own -- so they're
 * functions rather than a trait. */
pub struct Handler {
  pub expect: Expectation,
  pub handle: HandleFunction,
}

pub fn state_handler(state: ConnState) -> &'static Handler {
  match state {
    ConnState::ExpectServerHello => &EXPECT_SERVER_HELLO,
    ConnState::ExpectEncryptedExtensions => &EXPECT_ENCRYPTED_EXTENSIONS,
    ConnState::ExpectCertOrCertReq13 => &EXPECT_CERT_OR_CERTREQ_13,
    ConnState::ExpectCertificate13 => &EXPECT_CERTIFICATE_13,
    ConnState::ExpectCertificateVerify13 => &EXPECT_CERTIFICATE_VERIFY_13,
    ConnState::ExpectFinished13 => &EXPECT_FINISHED_13,
    ConnState::ExpectCertificate12 => &EXPECT_CERTIFICATE_12,
    ConnState::ExpectServerKx => &EXPECT_SERVER_KX,
    ConnState::ExpectDoneOrCertReq => &EXPECT_DONE_OR_CERTREQ,
    ConnState::ExpectCcs => &EXPECT_CCS,
    ConnState::ExpectFinished12 => &EXPECT_FINISHED_12,
    ConnState::ExpectNewTicket => &EXPECT_NEW_TICKET,
    ConnState::ExpectCcsResume => &EXPECT_CCS_RESUME,
    ConnState::ExpectFinishedResume => &EXPECT_FINISHED_RESUME,
    ConnState::ExpectNewTicketResume => &EXPECT_NEW_TICKET_RESUME,
    ConnState::Traffic12 => &TRAFFIC_12,
    ConnState::Traffic13 => &TRAFFIC_13,
    ConnState::Closed => &CLOSED,
  }
}

/// Choose the session we shall try to resume, if any.
fn find_session(sess: &ClientSession) -> Option<SessionValue> {
  let now = TimeBase::now().ok()?;

  let candidate = sess
    .config
    .resumption_session
    .clone()
    .or_else(|| {
      if sess.config.session_cache_mode.client_enabled() {
        sess.ctx.client_session_for(&sess.server_name)
      } else {
        None
      }
    })?;

  if candidate.has_expired(now) {
    sess.ctx.forget_client_session(&sess.server_name);
    return None;
  }

  if !sess.config.versions.contains(candidate.version) {
    return None;
  }

  Some(candidate)
}

/// Begin (or begin again, for renegotiation and HRR) by sending a
/// ClientHello.
pub fn start_handshake(sess: &mut ClientSession, renegotiating: bool) -> Result<(), Error> {
  let mut hs = ClientHandshakeData::new();
  hs.renegotiating = renegotiating;

  if sess.config.client_auth_cert.is_some() {
    if let Some(buffer) = hs.transcript_buffer.as_mut() {
      buffer.set_client_auth_enabled();
    }
  }

  sess.common.provider.random(&mut hs.randoms.client)?;

  // Resumption is disabled during renegotiation.
  if !renegotiating {
    hs.resuming_session = find_session(sess);
  }

  sess.hs = Some(hs);
  emit_client_hello(sess, None)
}

fn offers_tls13(sess: &ClientSession) -> bool {
  sess.config.versions.contains(ProtocolVersion::TLSv1_3) && !sess.common.is_datagram
}

fn legacy_hello_version(sess: &ClientSession) -> ProtocolVersion {
  if sess.common.is_datagram {
    ProtocolVersion::DTLSv1_2
  } else if sess.config.versions.max == ProtocolVersion::TLCPv1_1 {
    ProtocolVersion::TLCPv1_1
  } else {
    ProtocolVersion::TLSv1_2
  }
}

/// Build and send the ClientHello.  `retry` carries the HelloRetryRequest
/// when this is the second hello of a 1.3 exchange.
fn emit_client_hello(
  sess: &mut ClientSession,
  retry: Option<&HelloRetryRequest>,
) -> Result<(), Error> {
  let offers13 = offers_tls13(sess);
  let support_tls12_family = sess.config.versions.min != ProtocolVersion::TLSv1_3;

  let mut hs = sess.hs.take().expect("no handshake in progress");

  // Which session-id to put on the wire.
  let (session_id, ticket) = match hs.resuming_session.as_mut() {
    Some(resuming) if resuming.version.is_tls12_family() => {
      let ticket = resuming.ticket.0.clone();
      if !ticket.is_empty() && resuming.session_id.is_empty() {
        /* Our ticket is the credential; a random session-id lets us
         * detect the server accepting it.  See RFC 5077 §3.4. */
        let mut random_id = [0u8; 16];
        sess.common.provider.random(&mut random_id)?;
        resuming.session_id = SessionID::new(&random_id);
      }
      (resuming.session_id.clone(), ticket)
    }
    _ if offers13 && !hs.renegotiating => {
      // middlebox-compatible random legacy session-id
      let mut random_id = [0u8; 32];
      sess.common.provider.random(&mut random_id)?;
      (SessionID::new(&random_id), Vec::new())
    }
    _ => (SessionID::empty(), Vec::new()),
  };
  // A second ClientHello (HRR, DTLS cookie) repeats the first one's id.
  if hs.session_id.is_empty() {
    hs.session_id = session_id;
  }
  let session_id = hs.session_id.clone();

  let mut exts = Vec::new();

  if offers13 {
    let mut versions = vec![ProtocolVersion::TLSv1_3];
    if sess.config.versions.contains(ProtocolVersion::TLSv1_2) {
      versions.push(ProtocolVersion::TLSv1_2);
    }
    exts.push(ClientExtension::SupportedVersions(versions));
  }

  if !sess.server_name.is_empty() {
    exts.push(ClientExtension::make_sni(&sess.server_name));
  }

  exts.push(ClientExtension::ECPointFormats(
    ECPointFormatList::supported(),
  ));
  exts.push(ClientExtension::NamedGroups(sess.config.groups.clone()));
  exts.push(ClientExtension::SignatureAlgorithms(
    sess.config.sig_algs.clone(),
  ));

  if !sess.config.alpn_protocols.is_empty() {
    let protos: Vec<&[u8]> = sess
      .config
      .alpn_protocols
      .iter()
      .map(|p| p.as_slice())
      .collect();
    exts.push(ClientExtension::Protocols(ProtocolNameList::from_slices(
      &protos,
    )));
  }

  if support_tls12_family {
    if sess.config.offer_ems {
      exts.push(ClientExtension::ExtendedMasterSecretRequest);
    }
    if sess.config.offer_etm
      && sess
        .config
        .cipher_suites
        .iter()
        .any(|scs| scs.bulk.is_cbc())
    {
      exts.push(ClientExtension::EncryptThenMacRequest);
    }

    // Secure renegotiation: empty on the initial handshake, our stored
    // verify_data afterwards.
    let reneg = if hs.renegotiating {
      sess.common.client_verify_data.clone()
    } else {
      Vec::new()
    };
    exts.push(ClientExtension::RenegotiationInfo(PayloadU8::new(reneg)));

    if sess.config.enable_tickets {
      if ticket.is_empty() {
        exts.push(ClientExtension::SessionTicketRequest);
      } else {
        exts.push(ClientExtension::SessionTicketOffer(Payload::new(ticket)));
      }
    }
  }

  if offers13 {
    // key shares: everything configured, or exactly what the HRR asked
    hs.offered_key_shares.clear();
    let share_groups: Vec<NamedGroup> =
      match retry.and_then(|r| r.get_requested_key_share_group()) {
        Some(group) => vec![group],
        None => sess
          .config
          .key_share_groups
          .clone()
          .unwrap_or_else(|| sess.config.groups.clone()),
      };

    let mut key_shares = Vec::new();
    for group in share_groups {
      if let Ok(share) = sess.common.provider.start_kx(group) {
        key_shares.push(KeyShareEntry::new(group, share.pub_key()));
        hs.offered_key_shares.push(share);
      }
    }
    exts.push(ClientExtension::KeyShare(key_shares));

    exts.push(ClientExtension::PresharedKeyModes(vec![
      crate::msgs::enums::PSKKeyExchangeMode::PSK_DHE_KE,
      crate::msgs::enums::PSKKeyExchangeMode::PSK_KE,
    ]));

    if sess.config.post_handshake_auth {
      exts.push(ClientExtension::PostHandshakeAuth);
    }

    if let Some(cookie) = retry.and_then(|r| r.get_cookie()) {
      exts.push(ClientExtension::Cookie(cookie.clone()));
    }
  }

  /* Decide what PSK to offer for TLS 1.3.  External keys win over
   * resumption; the pre_shared_key extension must come last. */
  let psk_offer = if offers13 {
    choose_tls13_psk(sess, &hs)
  } else {
    None
  };

  let hash_len_for_psk = psk_offer.as_ref().map(|(_, _, _, hash, _)| {
    sess.common.provider.hash_len(*hash)
  });

  if let Some((identity, _, _, _, age)) = psk_offer.as_ref() {
    exts.push(ClientExtension::PresharedKey(PresharedKeyOffer::new(
      PresharedKeyIdentity::new(identity.clone(), *age),
      vec![0u8; hash_len_for_psk.unwrap_or(32)],
    )));
  }

  hs.sent_extensions = exts.iter().map(|ext| ext.get_type()).collect();

  let mut chp = ClientHelloPayload {
    client_version: legacy_hello_version(sess),
    random: crate::msgs::handshake::Random(hs.randoms.client),
    session_id,
    cookie: if sess.common.is_datagram {
      Some(PayloadU8::new(hs.dtls_cookie.clone()))
    } else {
      None
    },
    cipher_suites: sess
      .config
      .all_suites()
      .iter()
      .map(|scs| scs.suite)
      .collect(),
    compression_methods: vec![crate::msgs::enums::Compression::Null],
    extensions: exts,
  };

  /* Compute the real binder over the truncated hello, then patch it into
   * the offer before anything is hashed or sent. */
  if let Some((identity, psk, external, hash, age)) = psk_offer {
    let mut ks = KeySchedule::new(sess.common.provider.clone(), hash);
    ks.input_secret(&psk)?;
    let binder_key = ks.derive_binder_key(external)?;

    let probe = sess.common.build_hs(
      HandshakeType::ClientHello,
      HandshakePayload::ClientHello(chp.clone()),
    );
    let encoded = match probe.payload {
      MessagePayload::Handshake(ref hmp) => hmp.get_encoding(),
      _ => unreachable!(),
    };
    let binders_len = chp.get_psk().map(|o| o.binders_encoded_len()).unwrap_or(0);
    let truncated = &encoded[..encoded.len() - binders_len];

    let base_hash = match hs.transcript.as_ref() {
      Some(transcript) => transcript.fork_hash_given(truncated),
      None => hs
        .transcript_buffer
        .as_ref()
        .expect("no transcript at all")
        .get_hash_given(sess.common.provider.as_ref(), hash, truncated)?,
    };

    let binder = ks.sign_verify_data_from(&binder_key, &base_hash)?;

    if let Some(ext) = chp.extensions.last_mut() {
      if let ClientExtension::PresharedKey(offer) = ext {
        *offer = PresharedKeyOffer::new(PresharedKeyIdentity::new(identity.clone(), age), binder);
      }
    }

    hs.offered_psk = Some(OfferedPsk {
      identity,
      psk,
      external,
    });
    hs.early_key_schedule = Some(ks);
  }

  let ch = sess.common.build_hs(
    HandshakeType::ClientHello,
    HandshakePayload::ClientHello(chp),
  );

  debug!("Sending ClientHello {:?}", ch);

  match hs.transcript.as_mut() {
    Some(transcript) => {
      transcript.add_message(&ch);
    }
    None => hs
      .transcript_buffer
      .as_mut()
      .expect("transcript buffer missing")
      .add_message(&ch),
  }

  sess.common.send_msg(ch);
  sess.common.record.flush();
  sess.hs = Some(hs);
  Ok(())
}

/// (identity, psk, external, hash, obfuscated age)
type PskChoice = (Vec<u8>, Vec<u8>, bool, crate::msgs::enums::HashAlgorithm, u32);

fn choose_tls13_psk(sess: &ClientSession, hs: &ClientHandshakeData) -> Option<PskChoice> {
  if let Some(ref external) = sess.config.external_psk {
    return Some((
      external.identity.clone(),
      external.key.clone(),
      true,
      crate::msgs::enums::HashAlgorithm::SHA256,
      0,
    ));
  }

  let resuming = hs.resuming_session.as_ref()?;
  if resuming.version != ProtocolVersion::TLSv1_3 || resuming.ticket.0.is_empty() {
    return None;
  }

  let suite = crate::suites::lookup(resuming.cipher_suite)?;
  let now = TimeBase::now().ok()?;
  let age_millis = now.secs().saturating_sub(resuming.creation_time) as u32 * 1000;
  let obfuscated = age_millis.wrapping_add(resuming.age_add);

  Some((
    resuming.ticket.0.clone(),
    resuming.master_secret.0.clone(),
    false,
    suite.get_hash(),
    obfuscated,
  ))
}

fn sent_unsolicited_extensions(
  hs: &ClientHandshakeData,
  received: &[ExtensionType],
) -> bool {
  let allowed_unsolicited = [ExtensionType::RenegotiationInfo];

  for ext in received {
    if !hs.sent_extensions.contains(ext) && !allowed_unsolicited.contains(ext) {
      debug!("Unsolicited extension {:?}", ext);
      return true;
    }
  }

  false
}

/* --- ServerHello, HelloRetryRequest, HelloVerifyRequest --- */

fn handle_hello_verify_request(sess: &mut ClientSession, m: Message) -> Result<ConnState, Error> {
  let hvr = extract_handshake!(m, HandshakePayload::HelloVerifyRequest).unwrap();

  if !sess.common.is_datagram {
    return Err(Error::InappropriateHandshakeMessage {
      expect_types: vec![HandshakeType::ServerHello],
      got_type: HandshakeType::HelloVerifyRequest,
    });
  }

  {
    let hs = sess.hs.as_mut().expect("no handshake");
    if !hs.dtls_cookie.is_empty() {
      return Err(Error::PeerMisbehaved("second HelloVerifyRequest"));
    }

    if hvr.cookie.0.is_empty() {
      return Err(Error::DecodeError("empty cookie in HelloVerifyRequest"));
    }

    hs.dtls_cookie = hvr.cookie.0.clone();

    /* The first ClientHello and this HelloVerifyRequest are excluded
     * from the transcript: start afresh. */
    if let Some(buffer) = hs.transcript_buffer.as_mut() {
      buffer.reset();
    }
  }

  emit_client_hello(sess, None)?;
  Ok(ConnState::ExpectServerHello)
}

fn handle_hello_retry_request(sess: &mut ClientSession, m: Message) -> Result<ConnState, Error> {
  let hrr = extract_handshake!(m, HandshakePayload::HelloRetryRequest)
    .unwrap()
    .clone();

  if !offers_tls13(sess) {
    return Err(Error::PeerMisbehaved("HelloRetryRequest without TLS 1.3 offer"));
  }

  if hrr.has_duplicate_extension() {
    return Err(Error::DecodeError("duplicate extension in HelloRetryRequest"));
  }

  if hrr.get_supported_versions() != Some(ProtocolVersion::TLSv1_3) {
    return Err(Error::IllegalParameter(
      "HelloRetryRequest did not select TLS 1.3",
    ));
  }

  let suite = sess
    .config
    .find_cipher_suite(hrr.cipher_suite)
    .filter(|scs| scs.is_tls13())
    .ok_or(Error::IllegalParameter("HelloRetryRequest chose bad suite"))?;

  {
    let hs = sess.hs.as_mut().expect("no handshake");

    if hs.hrr_seen {
      return Err(Error::PeerMisbehaved("second HelloRetryRequest"));
    }
    hs.hrr_seen = true;

    let group = hrr
      .get_requested_key_share_group()
      .ok_or(Error::MissingExtension("HelloRetryRequest without key_share"))?;

    if !sess.config.groups.contains(&group) {
      return Err(Error::IllegalParameter(
        "HelloRetryRequest for a group we never offered",
      ));
    }

    if hs.offered_key_shares.iter().any(|kx| kx.group() == group) {
      return Err(Error::IllegalParameter(
        "HelloRetryRequest for a share we already sent",
      ));
    }

    /* Transcript rebuild: message_hash(CH1) || HRR || CH2 ... */
    let buffer = hs
      .transcript_buffer
      .take()
      .ok_or(Error::Internal("transcript already converted"))?;
    let mut transcript = buffer.start_hash(sess.common.provider.clone(), suite.get_hash())?;
    transcript.rollup_for_hrr()?;
    transcript.add_message(&m);
    hs.transcript = Some(transcript);
  }

  sess.common.set_suite(suite);
  sess.common.middlebox_ccs_ok = true;

  /* The compatibility CCS precedes our second flight. */
  sess.common.send_ccs();
  emit_client_hello(sess, Some(&hrr))?;
  Ok(ConnState::ExpectServerHello)
}

fn handle_server_hello(sess: &mut ClientSession, m: Message) -> Result<ConnState, Error> {
  if m.is_handshake_type(HandshakeType::HelloRetryRequest) {
    return handle_hello_retry_request(sess, m);
  }
  if m.is_handshake_type(HandshakeType::HelloVerifyRequest) {
    return handle_hello_verify_request(sess, m);
  }

  let server_hello = extract_handshake!(m, HandshakePayload::ServerHello)
    .unwrap()
    .clone();
  debug!("We got ServerHello {:?}", server_hello);

  if server_hello.has_duplicate_extension() {
    return Err(Error::DecodeError("server sent duplicate extensions"));
  }

  {
    let received: Vec<ExtensionType> = server_hello
      .extensions
      .iter()
      .map(|ext| ext.get_type())
      .collect();
    let hs = sess.hs.as_ref().expect("no handshake");
    if sent_unsolicited_extensions(hs, &received) {
      return Err(Error::UnsupportedExtension("server sent unsolicited extension"));
    }
  }

  if server_hello.compression_method != crate::msgs::enums::Compression::Null {
    return Err(Error::IllegalParameter("server chose compression"));
  }

  // Version selection.
  let version = match server_hello.get_supported_versions() {
    Some(v) => {
      if v != ProtocolVersion::TLSv1_3 || !offers_tls13(sess) {
        return Err(Error::ProtocolVersion);
      }
      v
    }
    None => {
      let legacy = server_hello.legacy_version;
      if !sess.config.versions.contains(legacy) || legacy == ProtocolVersion::TLSv1_3 {
        return Err(Error::ProtocolVersion);
      }
      legacy
    }
  };

  // Downgrade sentinel (RFC 8446 §4.1.3).
  if offers_tls13(sess)
    && version != ProtocolVersion::TLSv1_3
    && server_hello.random.has_downgrade_sentinel()
  {
    return Err(Error::IllegalParameter("downgrade sentinel in ServerHello.random"));
  }

  sess.common.negotiated_version = Some(version);

  let suite = sess
    .config
    .find_cipher_suite(server_hello.cipher_suite)
    .filter(|scs| scs.usable_for_version(version))
    .ok_or(Error::HandshakeFailure("server chose non-offered ciphersuite"))?;

  // after HRR the suite cannot change; renegotiation may pick afresh
  let hrr_seen = sess.hs.as_ref().map(|hs| hs.hrr_seen).unwrap_or(false);
  if hrr_seen {
    if let Some(existing) = sess.common.get_suite_opt() {
      if existing.suite != suite.suite {
        return Err(Error::IllegalParameter("suite changed after HelloRetryRequest"));
      }
    }
  }
  sess.common.set_suite(suite);
  info!("Using ciphersuite {:?}", server_hello.cipher_suite);

  /* ALPN */
  sess.common.alpn_protocol = server_hello.get_alpn_protocol();
  if let Some(ref proto) = sess.common.alpn_protocol {
    if !sess.config.alpn_protocols.contains(proto) {
      return Err(Error::IllegalParameter("server sent non-offered ALPN protocol"));
    }
  }

  /* Start (or continue) the transcript and feed this ServerHello. */
  {
    let hs = sess.hs.as_mut().expect("no handshake");
    if hs.transcript.is_none() {
      let buffer = hs
        .transcript_buffer
        .take()
        .ok_or(Error::Internal("transcript already converted"))?;
      hs.transcript = Some(buffer.start_hash(sess.common.provider.clone(), suite.get_hash())?);
    }
    hs.transcript().add_message(&m);
  }

  if version == ProtocolVersion::TLSv1_3 {
    start_handshake_traffic_tls13(sess, &server_hello)?;
    return Ok(ConnState::ExpectEncryptedExtensions);
  }

  handle_server_hello_tls12(sess, &server_hello)
}

fn start_handshake_traffic_tls13(
  sess: &mut ClientSession,
  server_hello: &ServerHelloPayload,
) -> Result<(), Error> {
  let suite = sess.common.get_suite();
  let hs = sess.hs.as_mut().expect("no handshake");

  /* Did the server take our PSK? */
  let psk_accepted = match server_hello.get_psk_index() {
    Some(0) if hs.offered_psk.is_some() => true,
    Some(0) | None => false,
    Some(_) => {
      return Err(Error::IllegalParameter(
        "server selected non-offered PSK identity",
      ))
    }
  };

  /* Work out the shared secret, if key_share was used. */
  let shared_secret = match server_hello.get_key_share() {
    Some(server_share) => {
      let our_share_idx = hs
        .offered_key_shares
        .iter()
        .position(|kx| kx.group() == server_share.group)
        .ok_or(Error::IllegalParameter("wrong group for key share"))?;
      let our_share = hs.offered_key_shares.swap_remove(our_share_idx);
      hs.offered_key_shares.clear();
      Some(kx::complete_kx(our_share, &server_share.payload.0)?.shared_secret.clone())
    }
    None if psk_accepted => None, // psk_ke
    None => {
      return Err(Error::MissingExtension("no key_share in ServerHello"));
    }
  };

  let mut key_schedule = if psk_accepted {
    hs.doing_resume = hs.offered_psk.as_ref().map(|p| !p.external).unwrap_or(false);
    hs.early_key_schedule
      .take()
      .ok_or(Error::Internal("psk accepted but no early schedule"))?
  } else {
    hs.offered_psk = None;
    hs.early_key_schedule = None;
    let mut ks = KeySchedule::new(sess.common.provider.clone(), suite.get_hash());
    ks.input_empty()?;
    ks
  };

  if key_schedule.algorithm() != suite.get_hash() {
    return Err(Error::IllegalParameter("suite hash differs from PSK hash"));
  }

  match shared_secret {
    Some(ref secret) => key_schedule.input_secret(secret)?,
    None => key_schedule.input_empty()?,
  }

  let handshake_hash = hs.transcript().get_current_hash();
  let write_key = key_schedule.derive(SecretKind::ClientHandshakeTrafficSecret, &handshake_hash)?;
  let read_key = key_schedule.derive(SecretKind::ServerHandshakeTrafficSecret, &handshake_hash)?;

  key_schedule.current_client_traffic_secret = write_key.clone();
  key_schedule.current_server_traffic_secret = read_key.clone();
  sess.common.key_schedule = Some(key_schedule);

  sess.common.install_write_key(write_key);
  sess.common.install_read_key(read_key);

  sess.common.middlebox_ccs_ok = true;
  hs.send_ccs_before_finished = !hs.hrr_seen; // after HRR, CCS went out with CH2 path
  Ok(())
}

fn handle_server_hello_tls12(
  sess: &mut ClientSession,
  server_hello: &ServerHelloPayload,
) -> Result<ConnState, Error> {
  let suite = sess.common.get_suite();

  /* Secure renegotiation. */
  let reneg_info = server_hello.get_renegotiation_info().map(|p| p.0.as_slice());
  let renegotiating = sess.hs.as_ref().map(|hs| hs.renegotiating).unwrap_or(false);
  if renegotiating {
    let mut expected = sess.common.client_verify_data.clone();
    expected.extend_from_slice(&sess.common.server_verify_data);
    negotiation::check_renegotiation_info(reneg_info, false, &expected)?;
  } else {
    negotiation::check_initial_renegotiation_info(reneg_info)?;
  }

  /* Extended master secret: sticky. */
  let ems_offered = sess.config.offer_ems;
  let ems_now = server_hello.ems_acked() && ems_offered;
  let previous_ems = sess.common.ems
    || sess
      .hs
      .as_ref()
      .and_then(|hs| hs.resuming_session.as_ref())
      .map(|s| s.extended_ms)
      .unwrap_or(false);
  negotiation::check_ems_continuity(previous_ems, ems_now)?;

  /* Encrypt-then-MAC: CBC suites only, and sticky across renegotiation. */
  let etm_now = server_hello.etm_acked();
  if etm_now && !suite.bulk.is_cbc() {
    return Err(Error::IllegalParameter(
      "encrypt-then-MAC selected for a non-CBC suite",
    ));
  }
  negotiation::check_etm_continuity(sess.common.etm, etm_now)?;

  sess.common.ems = ems_now;
  sess.common.etm = etm_now;

  let provider = sess.common.provider.clone();
  let hs = sess.hs.as_mut().expect("no handshake");

  server_hello.random.write_slice(&mut hs.randoms.server);
  hs.session_id = server_hello.session_id.clone();

  if server_hello
    .find_extension(ExtensionType::SessionTicket)
    .is_some()
  {
    info!("Server supports tickets");
    hs.must_issue_new_ticket = true;
  }

  /* Abbreviated handshake? */
  let mut abbreviated = false;
  if let Some(ref resuming) = hs.resuming_session {
    if !resuming.session_id.is_empty() && resuming.session_id == hs.session_id {
      info!("Server agreed to resume");

      if resuming.cipher_suite != suite.suite {
        return Err(Error::PeerMisbehaved("abbreviated handshake with varied suite"));
      }
      if resuming.extended_ms != ems_now {
        return Err(Error::HandshakeFailure("EMS flag changed across resumption"));
      }

      abbreviated = true;
      sess.common.secrets = Some(SessionSecrets::new_resume(
        provider,
        suite.get_hash(),
        &hs.randoms,
        &resuming.master_secret.0,
      ));
    }
  }

  if abbreviated {
    hs.doing_resume = true;
    sess.common.start_encryption_tls12()?;

    if hs.must_issue_new_ticket {
      Ok(ConnState::ExpectNewTicketResume)
    } else {
      Ok(ConnState::ExpectCcsResume)
    }
  } else if suite.requires_server_cert() {
    Ok(ConnState::ExpectCertificate12)
  } else {
    Ok(ConnState::ExpectServerKx)
  }
}

pub static EXPECT_SERVER_HELLO: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::Handshake],
    handshake_types: &[
      HandshakeType::ServerHello,
      HandshakeType::HelloRetryRequest,
      HandshakeType::HelloVerifyRequest,
    ],
  },
  handle: handle_server_hello,
};

/* --- TLS 1.3 EncryptedExtensions --- */
fn handle_encrypted_extensions(sess: &mut ClientSession, m: Message) -> Result<ConnState, Error> {
  let exts = extract_handshake!(m, HandshakePayload::EncryptedExtensions)
    .unwrap()
    .clone();
  info!("TLS 1.3 encrypted extensions: {:?}", exts);

  if exts.has_duplicate_extension() {
    return Err(Error::DecodeError("duplicate encrypted extension"));
  }

  {
    let received: Vec<ExtensionType> = exts.iter().map(|ext| ext.get_type()).collect();
    let hs = sess.hs.as_ref().expect("no handshake");
    if sent_unsolicited_extensions(hs, &received) {
      return Err(Error::UnsupportedExtension("unsolicited encrypted extension"));
    }
  }

  if let Some(proto) = exts.get_alpn_protocol() {
    if !sess.config.alpn_protocols.contains(&proto) {
      return Err(Error::IllegalParameter("server sent non-offered ALPN protocol"));
    }
    sess.common.alpn_protocol = Some(proto);
  }

  let hs = sess.hs.as_mut().expect("no handshake");
  hs.transcript().add_message(&m);

  if hs.offered_psk.is_some() {
    // PSK handshakes carry no certificate flight.
    Ok(ConnState::ExpectFinished13)
  } else {
    Ok(ConnState::ExpectCertOrCertReq13)
  }
}

pub static EXPECT_ENCRYPTED_EXTENSIONS: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::Handshake],
    handshake_types: &[HandshakeType::EncryptedExtensions],
  },
  handle: handle_encrypted_extensions,
};

/* --- TLS 1.3 server Certificate / CertificateRequest --- */
fn handle_certificate_13(sess: &mut ClientSession, m: Message) -> Result<ConnState, Error> {
  let cert_chain = extract_handshake!(m, HandshakePayload::CertificateTLS13)
    .unwrap()
    .convert();

  if cert_chain.is_empty() {
    return Err(Error::Certificate(crate::provider::CertError::BadCertificate));
  }

  sess.ctx.verifier.verify_chain(
    &cert_chain[0],
    &cert_chain[1..],
    Some(&sess.server_name),
    CertUsage::ServerAuth,
  )?;

  let hs = sess.hs.as_mut().expect("no handshake");
  hs.server_cert_chain = cert_chain;
  hs.transcript().add_message(&m);
  Ok(ConnState::ExpectCertificateVerify13)
}

fn handle_cert_or_certreq_13(sess: &mut ClientSession, m: Message) -> Result<ConnState, Error> {
  if m.is_handshake_type(HandshakeType::CertificateRequest) {
    let certreq = extract_handshake!(m, HandshakePayload::CertificateRequestTLS13)
      .unwrap()
      .clone();
    info!("Got CertificateRequest {:?}", certreq);

    if !certreq.context.0.is_empty() {
      return Err(Error::IllegalParameter(
        "in-handshake CertificateRequest with context",
      ));
    }

    let hs = sess.hs.as_mut().expect("no handshake");
    hs.doing_client_auth = true;
    hs.tls13_cert_request = Some(certreq);
    hs.transcript().add_message(&m);
    return Ok(ConnState::ExpectCertificate13);
  }

  handle_certificate_13(sess, m)
}

pub static EXPECT_CERT_OR_CERTREQ_13: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::Handshake],
    handshake_types: &[HandshakeType::Certificate, HandshakeType::CertificateRequest],
  },
  handle: handle_cert_or_certreq_13,
};

pub static EXPECT_CERTIFICATE_13: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::Handshake],
    handshake_types: &[HandshakeType::Certificate],
  },
  handle: handle_certificate_13,
};

/* --- TLS 1.3 CertificateVerify --- */
fn handle_certificate_verify_13(sess: &mut ClientSession, m: Message) -> Result<ConnState, Error> {
  let cert_verify = extract_handshake!(m, HandshakePayload::CertificateVerify)
    .unwrap()
    .clone();

  if !sess.config.sig_algs.contains(&cert_verify.scheme) {
    return Err(Error::IllegalParameter("server signed with non-offered scheme"));
  }

  let (handshake_hash, end_entity) = {
    let hs = sess.hs.as_mut().expect("no handshake");
    (
      hs.transcript().get_current_hash(),
      hs.server_cert_chain[0].clone(),
    )
  };

  let mut message = vec![0x20u8; 64];
  message.extend_from_slice(b"TLS 1.3, server CertificateVerify\x00");
  message.extend_from_slice(&handshake_hash);

  let public_key = sess.ctx.verifier.public_key(&end_entity)?;
  sess
    .common
    .provider
    .verify(cert_verify.scheme, &public_key, &message, &cert_verify.sig.0)
    .map_err(|_| Error::DecryptError)?;

  let hs = sess.hs.as_mut().expect("no handshake");
  hs.transcript().add_message(&m);
  Ok(ConnState::ExpectFinished13)
}

pub static EXPECT_CERTIFICATE_VERIFY_13: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::Handshake],
    handshake_types: &[HandshakeType::CertificateVerify],
  },
  handle: handle_certificate_verify_13,
};

/* --- TLS 1.3 server Finished --- */

fn emit_certificate_13(sess: &mut ClientSession, context: PayloadU8) -> Result<(), Error> {
  let chain = sess
    .config
    .client_auth_cert
    .as_ref()
    .map(|(chain, _)| chain.clone())
    .unwrap_or_default();

  let mut body = CertificatePayloadTLS13::new(&chain);
  body.request_context = context;

  let cert_msg = sess.common.build_hs(
    HandshakeType::Certificate,
    HandshakePayload::CertificateTLS13(body),
  );
  let hs = sess.hs.as_mut().expect("no handshake");
  hs.transcript().add_message(&cert_msg);
  sess.common.send_msg(cert_msg);
  Ok(())
}

fn emit_certificate_verify_13(sess: &mut ClientSession) -> Result<(), Error> {
  let (chain_empty, signer) = match sess.config.client_auth_cert.as_ref() {
    Some((chain, signer)) => (chain.is_empty(), signer.clone()),
    None => return Ok(()),
  };

  if chain_empty {
    return Ok(());
  }

  let schemes = sess
    .hs
    .as_ref()
    .and_then(|hs| hs.tls13_cert_request.as_ref())
    .and_then(|cr| cr.get_sigalgs_extension().cloned())
    .unwrap_or_else(default_sig_algs);

  let scheme = signer
    .choose_scheme(&schemes)
    .ok_or(Error::HandshakeFailure("no overlapping sigschemes for client auth"))?;

  let handshake_hash = {
    let hs = sess.hs.as_mut().expect("no handshake");
    hs.transcript().get_current_hash()
  };

  let mut message = vec![0x20u8; 64];
  message.extend_from_slice(b"TLS 1.3, client CertificateVerify\x00");
  message.extend_from_slice(&handshake_hash);

  let sig = signer.sign(scheme, &message)?;
  let body = DigitallySignedStruct::new(scheme, sig);

  let m = sess.common.build_hs(
    HandshakeType::CertificateVerify,
    HandshakePayload::CertificateVerify(body),
  );
  let hs = sess.hs.as_mut().expect("no handshake");
  hs.transcript().add_message(&m);
  sess.common.send_msg(m);
  Ok(())
}

fn emit_finished_13(sess: &mut ClientSession) -> Result<(), Error> {
  let handshake_hash = {
    let hs = sess.hs.as_mut().expect("no handshake");
    hs.transcript().get_current_hash()
  };

  let verify_data = sess
    .common
    .key_schedule
    .as_ref()
    .expect("no key schedule")
    .sign_verify_data(SecretKind::ClientHandshakeTrafficSecret, &handshake_hash)?;

  let m = sess.common.build_hs(
    HandshakeType::Finished,
    HandshakePayload::Finished(Payload::new(verify_data)),
  );
  let hs = sess.hs.as_mut().expect("no handshake");
  hs.transcript().add_message(&m);
  sess.common.send_msg(m);
  Ok(())
}

fn handle_finished_13(sess: &mut ClientSession, m: Message) -> Result<ConnState, Error> {
  let finished = extract_handshake!(m, HandshakePayload::Finished)
    .unwrap()
    .clone();

  let handshake_hash = {
    let hs = sess.hs.as_mut().expect("no handshake");
    hs.transcript().get_current_hash()
  };

  let expect_verify_data = sess
    .common
    .key_schedule
    .as_ref()
    .expect("no key schedule")
    .sign_verify_data(SecretKind::ServerHandshakeTrafficSecret, &handshake_hash)?;

  if !sess
    .common
    .provider
    .constant_time_eq(&expect_verify_data, &finished.0)
  {
    return Err(Error::DecryptError);
  }

  {
    let hs = sess.hs.as_mut().expect("no handshake");
    hs.transcript().add_message(&m);
  }

  /* The server flight hash keys the application secrets; our own
   * Finished is in the resumption secret only. */
  let server_flight_hash = {
    let hs = sess.hs.as_mut().expect("no handshake");
    hs.transcript().get_current_hash()
  };

  let send_ccs = {
    let hs = sess.hs.as_mut().expect("no handshake");
    std::mem::take(&mut hs.send_ccs_before_finished)
  };
  if send_ccs {
    // middlebox compatibility
    sess.common.send_ccs();
  }

  let doing_client_auth = sess
    .hs
    .as_ref()
    .map(|hs| hs.doing_client_auth)
    .unwrap_or(false);
  if doing_client_auth {
    let context = sess
      .hs
      .as_ref()
      .and_then(|hs| hs.tls13_cert_request.as_ref())
      .map(|cr| cr.context.clone())
      .unwrap_or_else(PayloadU8::empty);
    emit_certificate_13(sess, context)?;
    emit_certificate_verify_13(sess)?;
  }

  emit_finished_13(sess)?;

  let full_hash = {
    let hs = sess.hs.as_mut().expect("no handshake");
    hs.transcript().get_current_hash()
  };

  {
    let key_schedule = sess.common.key_schedule.as_mut().expect("no key schedule");
    key_schedule.input_empty()?;

    let write_key =
      key_schedule.derive(SecretKind::ClientApplicationTrafficSecret, &server_flight_hash)?;
    let read_key =
      key_schedule.derive(SecretKind::ServerApplicationTrafficSecret, &server_flight_hash)?;
    let exporter =
      key_schedule.derive(SecretKind::ExporterMasterSecret, &server_flight_hash)?;
    let resumption = key_schedule.derive(SecretKind::ResumptionMasterSecret, &full_hash)?;

    key_schedule.current_client_traffic_secret = write_key.clone();
    key_schedule.current_server_traffic_secret = read_key.clone();
    key_schedule.current_exporter_secret = exporter;
    sess.resumption_master_secret = resumption;

    sess.common.install_write_key(write_key);
    sess.common.install_read_key(read_key);
  }

  let mut hs = sess.hs.take().expect("no handshake");
  sess.common.peer_certificates = if hs.server_cert_chain.is_empty() {
    None
  } else {
    Some(hs.server_cert_chain.clone())
  };
  sess.retained_transcript = Some(hs.transcript().fork());

  sess.common.middlebox_ccs_ok = false;
  sess.common.traffic = true;
  sess.common.flush_plaintext();

  Ok(ConnState::Traffic13)
}

pub static EXPECT_FINISHED_13: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::Handshake],
    handshake_types: &[HandshakeType::Finished],
  },
  handle: handle_finished_13,
};

/* --- TLS 1.2 family: Certificate --- */
fn handle_certificate_12(sess: &mut ClientSession, m: Message) -> Result<ConnState, Error> {
  let cert_chain = extract_handshake!(m, HandshakePayload::Certificate)
    .unwrap()
    .clone();

  if cert_chain.is_empty() {
    return Err(Error::Certificate(crate::provider::CertError::BadCertificate));
  }

  let suite = sess.common.get_suite();
  if suite.is_tlcp() && cert_chain.len() < 2 {
    return Err(Error::Certificate(crate::provider::CertError::BadCertificate));
  }

  let hs = sess.hs.as_mut().expect("no handshake");
  hs.server_cert_chain = cert_chain;
  hs.transcript().add_message(&m);

  // PSK-family suites may interpose an identity-hint ServerKeyExchange
  if suite.requires_server_kx() || suite.kx.is_psk() {
    Ok(ConnState::ExpectServerKx)
  } else {
    Ok(ConnState::ExpectDoneOrCertReq)
  }
}

pub static EXPECT_CERTIFICATE_12: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::Handshake],
    handshake_types: &[HandshakeType::Certificate],
  },
  handle: handle_certificate_12,
};

/* --- TLS 1.2 family: ServerKeyExchange (or straight to Done for
 * hint-less PSK suites) --- */
fn handle_server_kx(sess: &mut ClientSession, m: Message) -> Result<ConnState, Error> {
  if m.is_handshake_type(HandshakeType::ServerHelloDone) {
    return handle_server_hello_done(sess, m);
  }
  if m.is_handshake_type(HandshakeType::CertificateRequest) {
    return handle_certificate_req(sess, m);
  }

  let opaque_kx = extract_handshake!(m, HandshakePayload::ServerKeyExchange)
    .unwrap()
    .clone();
  let suite = sess.common.get_suite();

  let decoded_kx = opaque_kx
    .unwrap_given_kxa(suite.kx)
    .ok_or(Error::DecodeError("cannot decode server kx"))?;

  if let ServerKeyExchangePayload::ECDHE(ref ecdhe) = decoded_kx {
    info!("ECDHE curve is {:?}", ecdhe.params.curve_params);
    if !sess
      .config
      .groups
      .contains(&ecdhe.params.curve_params.named_group)
    {
      return Err(Error::IllegalParameter("server chose non-offered group"));
    }
  }

  if let ServerKeyExchangePayload::Psk(ref psk) = decoded_kx {
    if let Some(ref params) = psk.ecdh_params {
      if !sess.config.groups.contains(&params.curve_params.named_group) {
        return Err(Error::IllegalParameter("server chose non-offered group"));
      }
    }
  }

  let hs = sess.hs.as_mut().expect("no handshake");
  hs.transcript().add_message(&m);
  hs.server_kx = Some(decoded_kx);

  Ok(ConnState::ExpectDoneOrCertReq)
}

pub static EXPECT_SERVER_KX: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::Handshake],
    handshake_types: &[
      HandshakeType::ServerKeyExchange,
      HandshakeType::ServerHelloDone,
      HandshakeType::CertificateRequest,
    ],
  },
  handle: handle_server_kx,
};

/* --- CertificateRequest or ServerHelloDone --- */
fn handle_certificate_req(sess: &mut ClientSession, m: Message) -> Result<ConnState, Error> {
  let certreq = extract_handshake!(m, HandshakePayload::CertificateRequest)
    .unwrap()
    .clone();
  info!("Got CertificateRequest {:?}", certreq);

  let hs = sess.hs.as_mut().expect("no handshake");
  hs.transcript().add_message(&m);

  let suite = sess.common.get_suite();
  if suite.kx.is_psk() {
    return Err(Error::PeerMisbehaved("client auth requested under a PSK suite"));
  }

  hs.doing_client_auth = true;

  if let Some((_, ref signer)) = sess.config.client_auth_cert {
    hs.client_auth_sigscheme = signer.choose_scheme(&certreq.sigschemes);
    if hs.client_auth_sigscheme.is_none() {
      info!("Client auth requested but no usable sigscheme");
    }
  } else {
    info!("Client auth requested but no cert configured");
  }

  Ok(ConnState::ExpectDoneOrCertReq)
}

fn handle_done_or_certreq(sess: &mut ClientSession, m: Message) -> Result<ConnState, Error> {
  if m.is_handshake_type(HandshakeType::CertificateRequest) {
    let already = sess
      .hs
      .as_ref()
      .map(|hs| hs.doing_client_auth)
      .unwrap_or(false);
    if already {
      return Err(Error::PeerMisbehaved("second CertificateRequest"));
    }
    handle_certificate_req(sess, m)
  } else {
    let hs = sess.hs.as_mut().expect("no handshake");
    if !hs.doing_client_auth {
      hs.transcript().abandon_client_auth();
    }
    handle_server_hello_done(sess, m)
  }
}

pub static EXPECT_DONE_OR_CERTREQ: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::Handshake],
    handshake_types: &[
      HandshakeType::CertificateRequest,
      HandshakeType::ServerHelloDone,
    ],
  },
  handle: handle_done_or_certreq,
};

/* --- the ≤1.2 client second flight --- */

fn emit_certificate_12(sess: &mut ClientSession) {
  let chosen_cert = sess
    .config
    .client_auth_cert
    .as_ref()
    .map(|(chain, _)| chain.clone())
    .unwrap_or_default();

  let cert = sess.common.build_hs(
    HandshakeType::Certificate,
    HandshakePayload::Certificate(chosen_cert),
  );
  let hs = sess.hs.as_mut().expect("no handshake");
  hs.transcript().add_message(&cert);
  sess.common.send_msg(cert);
}

fn emit_clientkx(sess: &mut ClientSession, body: Vec<u8>) {
  let ckx = sess.common.build_hs(
    HandshakeType::ClientKeyExchange,
    HandshakePayload::ClientKeyExchange(Payload::new(body)),
  );
  let hs = sess.hs.as_mut().expect("no handshake");
  hs.transcript().add_message(&ckx);
  sess.common.send_msg(ckx);
}

fn emit_certverify_12(sess: &mut ClientSession) -> Result<(), Error> {
  let sigscheme = {
    let hs = sess.hs.as_mut().expect("no handshake");
    match hs.client_auth_sigscheme {
      Some(scheme) => scheme,
      None => {
        debug!("Not sending CertificateVerify, no key");
        hs.transcript().abandon_client_auth();
        return Ok(());
      }
    }
  };

  let message = {
    let hs = sess.hs.as_mut().expect("no handshake");
    hs.transcript()
      .take_handshake_buf()
      .ok_or(Error::Internal("client auth buffer missing"))?
  };

  let signer = sess
    .config
    .client_auth_cert
    .as_ref()
    .map(|(_, signer)| signer.clone())
    .ok_or(Error::Internal("client auth key missing"))?;
  let sig = signer.sign(sigscheme, &message)?;
  let body = DigitallySignedStruct::new(sigscheme, sig);

  let m = sess.common.build_hs(
    HandshakeType::CertificateVerify,
    HandshakePayload::CertificateVerify(body),
  );
  let hs = sess.hs.as_mut().expect("no handshake");
  hs.transcript().add_message(&m);
  sess.common.send_msg(m);
  Ok(())
}

fn emit_finished_12(sess: &mut ClientSession) -> Result<(), Error> {
  let vh = {
    let hs = sess.hs.as_mut().expect("no handshake");
    hs.transcript().get_current_hash()
  };
  let verify_data = sess
    .common
    .secrets
    .as_ref()
    .expect("no secrets")
    .client_verify_data(&vh)?;

  sess.common.client_verify_data = verify_data.clone();

  let f = sess.common.build_hs(
    HandshakeType::Finished,
    HandshakePayload::Finished(Payload::new(verify_data)),
  );
  let hs = sess.hs.as_mut().expect("no handshake");
  hs.transcript().add_message(&f);
  sess.common.send_msg(f);
  Ok(())
}

/// Everything the ≤1.2 key-exchange modes differ on: what we put in the
/// ClientKeyExchange and what premaster comes out.
fn client_kx_for_suite(sess: &mut ClientSession) -> Result<(Vec<u8>, Vec<u8>), Error> {
  let suite = sess.common.get_suite();
  let provider = sess.common.provider.clone();
  let offered_version = legacy_hello_version(sess);

  let hs = sess.hs.as_ref().expect("no handshake");

  let psk_for = |hint: Option<&Vec<u8>>,
                 config: &crate::client::ClientConfig|
   -> Result<(Vec<u8>, Vec<u8>), Error> {
    if let Some(ref external) = config.external_psk {
      return Ok((external.identity.clone(), external.key.clone()));
    }
    if let Some(ref callback) = config.psk_client_callback {
      if let Some((identity, key)) = callback(hint.map(|h| h.as_slice())) {
        return Ok((identity, key));
      }
    }
    Err(Error::HandshakeFailure("no PSK available for PSK suite"))
  };

  match suite.kx {
    KeyExchangeAlgorithm::ECDHE => {
      let params = match hs.server_kx {
        Some(ServerKeyExchangePayload::ECDHE(ref ecdhe)) => ecdhe.params.clone(),
        _ => return Err(Error::PeerMisbehaved("missing ServerKeyExchange")),
      };
      let kxr = kx::client_ecdhe(provider.as_ref(), &params)?;
      let mut body = Vec::new();
      ClientECDHParams {
        public: PayloadU8::new(kxr.pubkey.clone()),
      }
      .encode(&mut body);
      Ok((body, kxr.shared_secret.clone()))
    }

    KeyExchangeAlgorithm::DHE => {
      let params = match hs.server_kx {
        Some(ServerKeyExchangePayload::DHE(ref dhe)) => dhe.params.clone(),
        _ => return Err(Error::PeerMisbehaved("missing ServerKeyExchange")),
      };
      let kxr = kx::client_dhe(provider.as_ref(), &params)?;
      let mut body = Vec::new();
      PayloadU16::new(kxr.pubkey.clone()).encode(&mut body);
      Ok((body, kxr.shared_secret.clone()))
    }

    KeyExchangeAlgorithm::RSA => {
      let premaster = kx::transport_premaster(provider.as_ref(), offered_version)?;
      let server_key = sess.ctx.verifier.public_key(&hs.server_cert_chain[0])?;
      let sealed = provider
        .encapsulate(KeyTransport::Rsa, &server_key, &premaster)
        .map_err(|_| Error::HandshakeFailure("RSA key transport unavailable"))?;
      let mut body = Vec::new();
      PayloadU16::new(sealed).encode(&mut body);
      Ok((body, premaster))
    }

    KeyExchangeAlgorithm::ECC_TLCP => {
      let premaster = kx::transport_premaster(provider.as_ref(), offered_version)?;
      // encryption certificate is the second in the TLCP chain
      let enc_cert = &hs.server_cert_chain[1];
      let enc_key = sess.ctx.verifier.public_key(enc_cert)?;
      let sealed = provider
        .encapsulate(KeyTransport::Sm2, &enc_key, &premaster)
        .map_err(|_| Error::HandshakeFailure("SM2 key transport unavailable"))?;
      let body = TlcpClientKeyExchange::new(sealed).get_encoding();
      Ok((body, premaster))
    }

    KeyExchangeAlgorithm::PSK => {
      let hint = match hs.server_kx {
        Some(ServerKeyExchangePayload::Psk(ref psk)) => Some(psk.hint.0.clone()),
        _ => None,
      };
      let (identity, psk) = psk_for(hint.as_ref(), &sess.config)?;
      let mut body = Vec::new();
      PayloadU16::new(identity).encode(&mut body);
      Ok((body, kx::plain_psk_premaster(&psk)))
    }

    KeyExchangeAlgorithm::ECDHE_PSK => {
      let (hint, params) = match hs.server_kx {
        Some(ServerKeyExchangePayload::Psk(ref skx)) => (
          Some(skx.hint.0.clone()),
          skx
            .ecdh_params
            .clone()
            .ok_or(Error::PeerMisbehaved("ECDHE_PSK without curve params"))?,
        ),
        _ => return Err(Error::PeerMisbehaved("missing ServerKeyExchange")),
      };
      let (identity, psk) = psk_for(hint.as_ref(), &sess.config)?;
      let kxr = kx::client_ecdhe(provider.as_ref(), &params)?;

      let mut body = Vec::new();
      PayloadU16::new(identity).encode(&mut body);
      ClientECDHParams {
        public: PayloadU8::new(kxr.pubkey.clone()),
      }
      .encode(&mut body);
      Ok((body, kx::psk_premaster(&kxr.shared_secret, &psk)))
    }

    KeyExchangeAlgorithm::DHE_PSK => {
      let (hint, params) = match hs.server_kx {
        Some(ServerKeyExchangePayload::Psk(ref skx)) => (
          Some(skx.hint.0.clone()),
          skx
            .dh_params
            .clone()
            .ok_or(Error::PeerMisbehaved("DHE_PSK without DH params"))?,
        ),
        _ => return Err(Error::PeerMisbehaved("missing ServerKeyExchange")),
      };
      let (identity, psk) = psk_for(hint.as_ref(), &sess.config)?;
      let kxr = kx::client_dhe(provider.as_ref(), &params)?;

      let mut body = Vec::new();
      PayloadU16::new(identity).encode(&mut body);
      PayloadU16::new(kxr.pubkey.clone()).encode(&mut body);
      Ok((body, kx::psk_premaster(&kxr.shared_secret, &psk)))
    }

    KeyExchangeAlgorithm::RSA_PSK => {
      let hint = match hs.server_kx {
        Some(ServerKeyExchangePayload::Psk(ref psk)) => Some(psk.hint.0.clone()),
        _ => None,
      };
      let (identity, psk) = psk_for(hint.as_ref(), &sess.config)?;
      let premaster = kx::transport_premaster(provider.as_ref(), offered_version)?;
      let server_key = sess.ctx.verifier.public_key(&hs.server_cert_chain[0])?;
      let sealed = provider
        .encapsulate(KeyTransport::Rsa, &server_key, &premaster)
        .map_err(|_| Error::HandshakeFailure("RSA key transport unavailable"))?;

      let mut body = Vec::new();
      PayloadU16::new(identity).encode(&mut body);
      PayloadU16::new(sealed).encode(&mut body);
      Ok((body, kx::psk_premaster(&premaster, &psk)))
    }

    KeyExchangeAlgorithm::BulkOnly => Err(Error::Internal("TLS 1.3 suite in 1.2 flow")),
  }
}

fn verify_server_kx_signature(sess: &mut ClientSession) -> Result<(), Error> {
  let suite = sess.common.get_suite();

  let (sig, signed) = {
    let hs = sess.hs.as_ref().expect("no handshake");
    let kx = match hs.server_kx {
      Some(ref kx) => kx,
      None => return Ok(()), // PSK modes without signature
    };

    let sig = match kx.get_sig() {
      Some(sig) => sig,
      None => return Ok(()),
    };

    /* The signed blob is ClientHello.random || ServerHello.random ||
     * params; TLCP replaces params with the encryption certificate. */
    let mut message = Vec::new();
    message.extend_from_slice(&hs.randoms.client);
    message.extend_from_slice(&hs.randoms.server);

    if suite.is_tlcp() {
      let enc_cert = &hs.server_cert_chain[1];
      crate::msgs::codec::encode_u24(enc_cert.0.len() as u32, &mut message);
      message.extend_from_slice(&enc_cert.0);
    } else {
      let mut params = Vec::new();
      kx.encode_params(&mut params);
      message.extend_from_slice(&params);
    }

    (sig, message)
  };

  if sig.scheme.sign() != suite.sign {
    return Err(Error::PeerMisbehaved("peer signed kx with wrong algorithm"));
  }
  if !sess.config.sig_algs.contains(&sig.scheme) {
    return Err(Error::IllegalParameter("server signed with non-offered scheme"));
  }

  let end_entity = sess.hs.as_ref().expect("no handshake").server_cert_chain[0].clone();
  let public_key = sess.ctx.verifier.public_key(&end_entity)?;
  sess
    .common
    .provider
    .verify(sig.scheme, &public_key, &signed, &sig.sig.0)
    .map_err(|_| Error::DecryptError)?;
  Ok(())
}

fn handle_server_hello_done(sess: &mut ClientSession, m: Message) -> Result<ConnState, Error> {
  {
    let hs = sess.hs.as_mut().expect("no handshake");
    hs.transcript().add_message(&m);
  }

  let suite = sess.common.get_suite();

  /* 1. Verify the certificate chain (suites that present one).
   * 2. Verify the kx signature.
   * 3. If doing client auth, send our Certificate.
   * 4. Send ClientKeyExchange, CertificateVerify, CCS.
   * 5. Derive secrets and send Finished under the new keys. */

  if suite.requires_server_cert() {
    let (end_entity, intermediates) = {
      let hs = sess.hs.as_ref().expect("no handshake");
      if hs.server_cert_chain.is_empty() {
        return Err(Error::Certificate(crate::provider::CertError::BadCertificate));
      }
      (
        hs.server_cert_chain[0].clone(),
        hs.server_cert_chain[1..].to_vec(),
      )
    };

    sess.ctx.verifier.verify_chain(
      &end_entity,
      &intermediates,
      Some(&sess.server_name),
      CertUsage::ServerAuth,
    )?;

    if suite.is_tlcp() {
      let enc_cert = sess.hs.as_ref().expect("no handshake").server_cert_chain[1].clone();
      sess
        .ctx
        .verifier
        .verify_chain(&enc_cert, &[], Some(&sess.server_name), CertUsage::KeyEncipherment)?;
    }
  }

  verify_server_kx_signature(sess)?;

  let doing_client_auth = sess
    .hs
    .as_ref()
    .expect("no handshake")
    .doing_client_auth;

  if doing_client_auth {
    emit_certificate_12(sess);
  }

  let (kx_body, premaster) = client_kx_for_suite(sess)?;
  emit_clientkx(sess, kx_body);

  if doing_client_auth {
    emit_certverify_12(sess)?;
  }

  sess.common.send_ccs();

  /* Now commit secrets.  With EMS the master binds to the transcript
   * through the ClientKeyExchange. */
  let provider = sess.common.provider.clone();
  let hashalg = suite.get_hash();
  let secrets = if sess.common.ems {
    let session_hash = {
      let hs = sess.hs.as_mut().expect("no handshake");
      hs.transcript().get_current_hash()
    };
    let randoms = sess.hs.as_ref().expect("no handshake").randoms.clone();
    SessionSecrets::new_ems(provider, hashalg, &randoms, &premaster, &session_hash)?
  } else {
    let randoms = sess.hs.as_ref().expect("no handshake").randoms.clone();
    SessionSecrets::new(provider, hashalg, &randoms, &premaster)?
  };
  sess.common.secrets = Some(secrets);
  sess.common.start_encryption_tls12()?;

  emit_finished_12(sess)?;

  let must_issue_new_ticket = sess
    .hs
    .as_ref()
    .expect("no handshake")
    .must_issue_new_ticket;
  if must_issue_new_ticket {
    Ok(ConnState::ExpectNewTicket)
  } else {
    Ok(ConnState::ExpectCcs)
  }
}

/* --- Waiting for their CCS --- */
fn handle_ccs(_sess: &mut ClientSession, _m: Message) -> Result<ConnState, Error> {
  /* nb. the record layer validates CCS contents and switches its read
   * state; nothing to do at this layer. */
  Ok(ConnState::ExpectFinished12)
}

pub static EXPECT_CCS: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::ChangeCipherSpec],
    handshake_types: &[],
  },
  handle: handle_ccs,
};

fn handle_ccs_resume(sess: &mut ClientSession, m: Message) -> Result<ConnState, Error> {
  handle_ccs(sess, m).and(Ok(ConnState::ExpectFinishedResume))
}

pub static EXPECT_CCS_RESUME: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::ChangeCipherSpec],
    handshake_types: &[],
  },
  handle: handle_ccs_resume,
};

fn handle_new_ticket(sess: &mut ClientSession, m: Message) -> Result<ConnState, Error> {
  let ticket = extract_handshake!(m, HandshakePayload::NewSessionTicket)
    .unwrap()
    .clone();
  let hs = sess.hs.as_mut().expect("no handshake");
  hs.transcript().add_message(&m);
  hs.new_ticket = ticket.ticket.0;
  hs.new_ticket_lifetime = ticket.lifetime_hint;
  Ok(ConnState::ExpectCcs)
}

pub static EXPECT_NEW_TICKET: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::Handshake],
    handshake_types: &[HandshakeType::NewSessionTicket],
  },
  handle: handle_new_ticket,
};

fn handle_new_ticket_resume(sess: &mut ClientSession, m: Message) -> Result<ConnState, Error> {
  handle_new_ticket(sess, m).and(Ok(ConnState::ExpectCcsResume))
}

pub static EXPECT_NEW_TICKET_RESUME: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::Handshake],
    handshake_types: &[HandshakeType::NewSessionTicket],
  },
  handle: handle_new_ticket_resume,
};

/* --- Waiting for their Finished --- */
fn save_session_12(sess: &mut ClientSession) -> Result<(), Error> {
  if !sess.config.session_cache_mode.client_enabled() {
    return Ok(());
  }

  let mut hs = match sess.hs.take() {
    Some(hs) => hs,
    None => return Ok(()),
  };

  /* Save a ticket.  If we got a new ticket, save that.  Otherwise, keep
   * presenting the original. */
  let mut ticket = std::mem::take(&mut hs.new_ticket);
  if ticket.is_empty() {
    if let Some(resuming) = hs.resuming_session.as_mut() {
      ticket = resuming.take_ticket();
    }
  }

  if hs.session_id.is_empty() && ticket.is_empty() {
    info!("Session not saved: server didn't allocate id or ticket");
    sess.hs = Some(hs);
    return Ok(());
  }

  let suite = sess.common.get_suite();
  let master_secret = sess
    .common
    .secrets
    .as_ref()
    .expect("no secrets")
    .get_master_secret();
  let now = TimeBase::now()?;

  let lifetime = if hs.new_ticket_lifetime > 0 {
    hs.new_ticket_lifetime
  } else {
    7200
  };

  let mut session = SessionValue::new(
    sess.common.negotiated_version.expect("no version"),
    suite.suite,
    hs.session_id.clone(),
    master_secret,
    sess.common.ems,
    &sess.server_name,
    b"",
    now,
    lifetime,
  );
  session.set_ticket(ticket);

  sess.ctx.remember_client_session(&sess.server_name, session);
  info!("Session saved");
  sess.hs = Some(hs);
  Ok(())
}

fn handle_finished_12(sess: &mut ClientSession, m: Message) -> Result<ConnState, Error> {
  let finished = extract_handshake!(m, HandshakePayload::Finished)
    .unwrap()
    .clone();

  let vh = {
    let hs = sess.hs.as_mut().expect("no handshake");
    hs.transcript().get_current_hash()
  };
  let expect_verify_data = sess
    .common
    .secrets
    .as_ref()
    .expect("no secrets")
    .server_verify_data(&vh)?;

  if !sess
    .common
    .provider
    .constant_time_eq(&expect_verify_data, &finished.0)
  {
    return Err(Error::DecryptError);
  }

  sess.common.server_verify_data = finished.0.clone();

  {
    let hs = sess.hs.as_mut().expect("no handshake");
    hs.transcript().add_message(&m);
  }

  save_session_12(sess)?;

  let chain = std::mem::take(
    &mut sess.hs.as_mut().expect("no handshake").server_cert_chain,
  );
  sess.common.peer_certificates = if chain.is_empty() { None } else { Some(chain) };

  sess.hs = None;
  sess.common.traffic = true;
  sess.common.flush_plaintext();
  Ok(ConnState::Traffic12)
}

fn handle_finished_resume(sess: &mut ClientSession, m: Message) -> Result<ConnState, Error> {
  /* Server finishes first on resumption; our CCS and Finished close the
   * exchange. */
  let finished = extract_handshake!(m, HandshakePayload::Finished)
    .unwrap()
    .clone();

  let vh = {
    let hs = sess.hs.as_mut().expect("no handshake");
    hs.transcript().get_current_hash()
  };
  let expect_verify_data = sess
    .common
    .secrets
    .as_ref()
    .expect("no secrets")
    .server_verify_data(&vh)?;

  if !sess
    .common
    .provider
    .constant_time_eq(&expect_verify_data, &finished.0)
  {
    return Err(Error::DecryptError);
  }

  sess.common.server_verify_data = finished.0.clone();

  {
    let hs = sess.hs.as_mut().expect("no handshake");
    hs.transcript().add_message(&m);
  }

  sess.common.send_ccs();
  emit_finished_12(sess)?;

  save_session_12(sess)?;
  sess.hs = None;
  sess.common.traffic = true;
  sess.common.flush_plaintext();
  Ok(ConnState::Traffic12)
}

pub static EXPECT_FINISHED_12: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::Handshake],
    handshake_types: &[HandshakeType::Finished],
  },
  handle: handle_finished_12,
};

pub static EXPECT_FINISHED_RESUME: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::Handshake],
    handshake_types: &[HandshakeType::Finished],
  },
  handle: handle_finished_resume,
};

/* --- Traffic (TLS 1.2 family) --- */
fn handle_traffic_12(sess: &mut ClientSession, mut m: Message) -> Result<ConnState, Error> {
  if m.is_content_type(ContentType::ApplicationData) {
    let payload = m.take_opaque_payload().expect("opaque payload");
    sess.common.take_received_plaintext(&payload.0);
    return Ok(ConnState::Traffic12);
  }

  if m.is_handshake_type(HandshakeType::HelloRequest) {
    if !sess.config.renegotiation_allowed {
      sess
        .common
        .send_warning_alert(AlertDescription::NoRenegotiation);
      return Ok(ConnState::Traffic12);
    }

    info!("Server requested renegotiation");
    sess.common.traffic = false;
    start_handshake(sess, true)?;
    return Ok(ConnState::ExpectServerHello);
  }

  Ok(ConnState::Traffic12)
}

pub static TRAFFIC_12: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::ApplicationData, ContentType::Handshake],
    handshake_types: &[HandshakeType::HelloRequest],
  },
  handle: handle_traffic_12,
};

/* --- Traffic (TLS 1.3): tickets, key updates, post-handshake auth --- */

pub fn emit_key_update(sess: &mut ClientSession, request_peer_update: bool) -> Result<(), Error> {
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
  let next = ks.next_traffic_secret(&ks.current_client_traffic_secret)?;
  ks.current_client_traffic_secret = next.clone();
  sess.common.install_write_key(next);
  Ok(())
}

fn handle_key_update(sess: &mut ClientSession, m: &Message) -> Result<(), Error> {
  let request = *extract_handshake!(m, HandshakePayload::KeyUpdate).unwrap();

  {
    let ks = sess.common.key_schedule.as_mut().expect("no key schedule");
    let next = ks.next_traffic_secret(&ks.current_server_traffic_secret)?;
    ks.current_server_traffic_secret = next.clone();
    sess.common.install_read_key(next);
  }

  if request == KeyUpdateRequest::UpdateRequested {
    emit_key_update(sess, false)?;
  }

  Ok(())
}

fn handle_new_ticket_13(sess: &mut ClientSession, m: &Message) -> Result<(), Error> {
  let nst = extract_handshake!(m, HandshakePayload::NewSessionTicketTLS13)
    .unwrap()
    .clone();

  if !sess.config.session_cache_mode.client_enabled() {
    return Ok(());
  }

  let suite = sess.common.get_suite();
  let psk = sess
    .common
    .key_schedule
    .as_ref()
    .expect("no key schedule")
    .derive_ticket_psk(&sess.resumption_master_secret, &nst.nonce.0)?;

  let now = TimeBase::now()?;
  let mut session = SessionValue::new(
    ProtocolVersion::TLSv1_3,
    suite.suite,
    SessionID::empty(),
    psk,
    false,
    &sess.server_name,
    b"",
    now,
    nst.lifetime,
  );
  session.age_add = nst.age_add;
  session.set_ticket(nst.ticket.0.clone());

  sess.ctx.remember_client_session(&sess.server_name, session);
  info!("TLS 1.3 ticket stored");
  Ok(())
}

fn handle_post_handshake_certreq(sess: &mut ClientSession, m: &Message) -> Result<(), Error> {
  let certreq = extract_handshake!(m, HandshakePayload::CertificateRequestTLS13)
    .unwrap()
    .clone();

  if !sess.config.post_handshake_auth {
    return Err(Error::PeerMisbehaved(
      "post-handshake auth without advertisement",
    ));
  }

  /* RFC 8446 §4.6.2: the transcript is the full handshake plus this
   * CertificateRequest and our response, keyed under the application
   * traffic secret. */
  let mut transcript = sess
    .retained_transcript
    .as_ref()
    .ok_or(Error::Internal("no retained transcript"))?
    .fork();
  transcript.add_message(m);

  let chain = sess
    .config
    .client_auth_cert
    .as_ref()
    .map(|(chain, _)| chain.clone())
    .unwrap_or_default();

  let mut body = CertificatePayloadTLS13::new(&chain);
  body.request_context = certreq.context.clone();
  let cert_msg = sess.common.build_hs(
    HandshakeType::Certificate,
    HandshakePayload::CertificateTLS13(body),
  );
  transcript.add_message(&cert_msg);
  sess.common.send_msg(cert_msg);

  if let Some((chain, signer)) = sess.config.client_auth_cert.as_ref() {
    if !chain.is_empty() {
      let schemes = certreq
        .get_sigalgs_extension()
        .cloned()
        .unwrap_or_else(default_sig_algs);
      let scheme = signer
        .choose_scheme(&schemes)
        .ok_or(Error::HandshakeFailure("no overlapping sigschemes for client auth"))?;

      let mut message = vec![0x20u8; 64];
      message.extend_from_slice(b"TLS 1.3, client CertificateVerify\x00");
      message.extend_from_slice(&transcript.get_current_hash());

      let sig = signer.sign(scheme, &message)?;
      let cv = sess.common.build_hs(
        HandshakeType::CertificateVerify,
        HandshakePayload::CertificateVerify(DigitallySignedStruct::new(scheme, sig)),
      );
      transcript.add_message(&cv);
      sess.common.send_msg(cv);
    }
  }

  let verify_data = {
    let ks = sess.common.key_schedule.as_ref().expect("no key schedule");
    ks.sign_verify_data(
      SecretKind::ClientApplicationTrafficSecret,
      &transcript.get_current_hash(),
    )?
  };
  let f = sess.common.build_hs(
    HandshakeType::Finished,
    HandshakePayload::Finished(Payload::new(verify_data)),
  );
  sess.common.send_msg(f);
  sess.common.record.flush();
  Ok(())
}

fn handle_traffic_13(sess: &mut ClientSession, mut m: Message) -> Result<ConnState, Error> {
  if m.is_content_type(ContentType::ApplicationData) {
    let payload = m.take_opaque_payload().expect("opaque payload");
    sess.common.take_received_plaintext(&payload.0);
  } else if m.is_handshake_type(HandshakeType::NewSessionTicket) {
    handle_new_ticket_13(sess, &m)?;
  } else if m.is_handshake_type(HandshakeType::KeyUpdate) {
    handle_key_update(sess, &m)?;
  } else if m.is_handshake_type(HandshakeType::CertificateRequest) {
    handle_post_handshake_certreq(sess, &m)?;
  }

  Ok(ConnState::Traffic13)
}

pub static TRAFFIC_13: Handler = Handler {
  expect: Expectation {
    content_types: &[ContentType::ApplicationData, ContentType::Handshake],
    handshake_types: &[
      HandshakeType::NewSessionTicket,
      HandshakeType::KeyUpdate,
      HandshakeType::CertificateRequest,
    ],
  },
  handle: handle_traffic_13,
};

fn handle_closed(_sess: &mut ClientSession, _m: Message) -> Result<ConnState, Error> {
  Err(Error::HandshakeNotComplete)
}

pub static CLOSED: Handler = Handler {
  expect: Expectation {
    content_types: &[],
    handshake_types: &[],
  },
  handle: handle_closed,
};
