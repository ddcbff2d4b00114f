/* Things we don't expect to work. */

mod common;

use std::sync::Arc;

use common::*;
use veiltls::msgs::base::PayloadU8;
use veiltls::msgs::codec::Codec;
use veiltls::msgs::enums::{Compression, ContentType, HandshakeType};
use veiltls::msgs::handshake::{
  ClientExtension, ClientHelloPayload, HandshakeMessagePayload, HandshakePayload, KeyShareEntry,
  PresharedKeyIdentity, PresharedKeyOffer, Random, SessionID,
};
use veiltls::provider::RecordLayer;
use veiltls::suites;
use veiltls::{
  AlertDescription, AlertLevel, AlwaysResolvesChain, CipherSuite, ClientConfig, Error,
  ExternalPsk, NamedGroup, ProtocolVersion, ResolvesNoCert, ServerConfig, ServerExternalPsk,
  ServerSession, SignatureScheme, VersionRange,
};

#[test]
fn tls13_only_client_against_unauthenticatable_server() {
  // server has neither certificate nor PSK; a 1.3-only client cannot be
  // satisfied
  let ctx = test_context();

  let mut ccfg = ClientConfig::new();
  ccfg.versions = VersionRange::single(ProtocolVersion::TLSv1_3);

  let scfg = ServerConfig::new(Arc::new(ResolvesNoCert));

  let mut ep = connect(&ctx, &ctx, Arc::new(ccfg), Arc::new(scfg), "example.com").unwrap();
  let (client_result, server_result) = drive_to_failure(&mut ep.client, &mut ep.server);

  assert!(matches!(server_result, Err(Error::HandshakeFailure(_))));
  assert_eq!(
    client_result,
    Err(Error::AlertReceived(AlertDescription::HandshakeFailure))
  );
}

#[test]
fn psk_binder_mismatch_is_fatal() {
  let ctx = test_context();

  let mut ccfg = ClientConfig::new();
  ccfg.tls13_cipher_suites = vec![&suites::TLS13_AES_128_GCM_SHA256];
  ccfg.external_psk = Some(ExternalPsk {
    identity: b"demo".to_vec(),
    key: b"client thinks this".to_vec(),
  });

  let mut scfg = ServerConfig::new(Arc::new(ResolvesNoCert));
  scfg.tls13_cipher_suites = vec![&suites::TLS13_AES_128_GCM_SHA256];
  scfg.external_psks = vec![ServerExternalPsk {
    identity: b"demo".to_vec(),
    key: b"server thinks that".to_vec(),
  }];

  let mut ep = connect(&ctx, &ctx, Arc::new(ccfg), Arc::new(scfg), "example.com").unwrap();
  let (client_result, server_result) = drive_to_failure(&mut ep.client, &mut ep.server);

  assert_eq!(server_result, Err(Error::DecryptError));
  assert_eq!(
    client_result,
    Err(Error::AlertReceived(AlertDescription::DecryptError))
  );
}

#[test]
fn alpn_without_overlap_is_fatal() {
  let ctx = test_context();

  let mut ccfg = ClientConfig::new();
  ccfg.alpn_protocols = vec![b"h2".to_vec()];

  let mut scfg = ServerConfig::new(Arc::new(AlwaysResolvesChain(ecdsa_identity())));
  scfg.alpn_protocols = vec![b"http/1.1".to_vec()];

  let mut ep = connect(&ctx, &ctx, Arc::new(ccfg), Arc::new(scfg), "example.com").unwrap();
  let (client_result, server_result) = drive_to_failure(&mut ep.client, &mut ep.server);

  assert_eq!(
    server_result,
    Err(Error::RejectedByCallback(
      AlertDescription::NoApplicationProtocol
    ))
  );
  assert_eq!(
    client_result,
    Err(Error::AlertReceived(AlertDescription::NoApplicationProtocol))
  );
}

#[test]
fn renegotiation_refused_with_warning() {
  let ctx = test_context();

  let mut ccfg = ClientConfig::new();
  ccfg.versions = VersionRange::single(ProtocolVersion::TLSv1_2);

  let mut scfg = ServerConfig::new(Arc::new(AlwaysResolvesChain(rsa_identity())));
  scfg.versions = VersionRange::single(ProtocolVersion::TLSv1_2);
  scfg.renegotiation_allowed = false;

  let mut ep = connect(&ctx, &ctx, Arc::new(ccfg), Arc::new(scfg), "example.com").unwrap();
  drive(&mut ep.client, &mut ep.server).unwrap();

  // client asks; the server warns and carries on
  ep.client.renegotiate().unwrap();
  ep.server.step().unwrap();
  ep.client.step().unwrap();

  let alert = ep.client.last_alert_received().expect("warning expected");
  assert_eq!(alert.level, AlertLevel::Warning);
  assert_eq!(alert.description, AlertDescription::NoRenegotiation);
}

fn raw_server() -> (ServerSession, MemRecord) {
  let ctx = test_context();
  let scfg = Arc::new(ServerConfig::new(Arc::new(AlwaysResolvesChain(
    ecdsa_identity(),
  ))));

  let (client_record, server_record, _clog, _slog) = record_pair();
  let server = ServerSession::new(ctx, scfg, Box::new(server_record)).unwrap();
  (server, client_record)
}

fn base_hello() -> ClientHelloPayload {
  ClientHelloPayload {
    client_version: ProtocolVersion::TLSv1_2,
    random: Random([0x42; 32]),
    session_id: SessionID::empty(),
    cookie: None,
    cipher_suites: vec![
      CipherSuite::TLS13_AES_128_GCM_SHA256,
      CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    ],
    compression_methods: vec![Compression::Null],
    extensions: vec![
      ClientExtension::SupportedVersions(vec![ProtocolVersion::TLSv1_3]),
      ClientExtension::NamedGroups(vec![NamedGroup::X25519]),
      ClientExtension::SignatureAlgorithms(vec![SignatureScheme::ECDSA_NISTP256_SHA256]),
      ClientExtension::KeyShare(vec![KeyShareEntry::new(NamedGroup::X25519, &[0xab; 32])]),
    ],
  }
}

fn send_hello(record: &mut MemRecord, hello: ClientHelloPayload) {
  let hmp = HandshakeMessagePayload::build(
    HandshakeType::ClientHello,
    HandshakePayload::ClientHello(hello),
  );
  record.send(ContentType::Handshake, &hmp.get_encoding());
}

#[test]
fn pre_shared_key_not_last_is_illegal() {
  let (mut server, mut wire) = raw_server();

  let mut hello = base_hello();
  hello.extensions.push(ClientExtension::PresharedKeyModes(vec![
    veiltls::msgs::enums::PSKKeyExchangeMode::PSK_DHE_KE,
  ]));
  hello.extensions.insert(
    0,
    ClientExtension::PresharedKey(PresharedKeyOffer::new(
      PresharedKeyIdentity::new(b"id".to_vec(), 0),
      vec![0; 32],
    )),
  );
  send_hello(&mut wire, hello);

  assert_eq!(
    server.step(),
    Err(Error::IllegalParameter("pre_shared_key is not the last extension"))
  );
  let alert = server.last_alert_sent().expect("alert expected");
  assert_eq!(alert.description, AlertDescription::IllegalParameter);
}

#[test]
fn duplicate_extension_is_decode_error() {
  let (mut server, mut wire) = raw_server();

  let mut hello = base_hello();
  hello
    .extensions
    .push(ClientExtension::NamedGroups(vec![NamedGroup::X25519]));
  send_hello(&mut wire, hello);

  assert!(matches!(server.step(), Err(Error::DecodeError(_))));
  let alert = server.last_alert_sent().expect("alert expected");
  assert_eq!(alert.description, AlertDescription::DecodeError);
}

#[test]
fn key_share_outside_supported_groups_is_illegal() {
  let (mut server, mut wire) = raw_server();

  let mut hello = base_hello();
  // share for a group absent from supported_groups
  hello.extensions[3] =
    ClientExtension::KeyShare(vec![KeyShareEntry::new(NamedGroup::secp384r1, &[0xab; 97])]);
  send_hello(&mut wire, hello);

  assert!(matches!(server.step(), Err(Error::IllegalParameter(_))));
}

#[test]
fn truncated_message_is_decode_error() {
  let (mut server, mut wire) = raw_server();

  let hmp = HandshakeMessagePayload::build(
    HandshakeType::ClientHello,
    HandshakePayload::ClientHello(base_hello()),
  );
  let mut bytes = hmp.get_encoding();
  bytes.truncate(bytes.len() - 3);
  wire.send(ContentType::Handshake, &bytes);

  assert!(matches!(server.step(), Err(Error::DecodeError(_))));
}

#[test]
fn unexpected_message_is_fatal() {
  let (mut server, mut wire) = raw_server();

  // a Finished before anything else
  let hmp = HandshakeMessagePayload::build(
    HandshakeType::Finished,
    HandshakePayload::Finished(veiltls::msgs::base::Payload::new(vec![0; 12])),
  );
  wire.send(ContentType::Handshake, &hmp.get_encoding());

  assert!(matches!(
    server.step(),
    Err(Error::InappropriateHandshakeMessage { .. })
  ));
  let alert = server.last_alert_sent().expect("alert expected");
  assert_eq!(alert.description, AlertDescription::UnexpectedMessage);

  // sink state: further messages are refused outright
  send_hello(&mut wire, base_hello());
  assert!(server.step().is_err());
}

#[test]
fn empty_alpn_protocol_is_rejected() {
  let (mut server, mut wire) = raw_server();

  let mut hello = base_hello();
  hello.extensions.push(ClientExtension::Protocols(vec![
    PayloadU8::new(Vec::new()),
  ]));
  send_hello(&mut wire, hello);

  assert!(matches!(server.step(), Err(Error::PeerMisbehaved(_))));
}
