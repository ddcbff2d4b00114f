//! Mock-peer handshakes: both endpoints of each exchange run in-process
//! over an in-memory record layer.

mod common;

use std::sync::Arc;

use common::*;
use veiltls::suites;
use veiltls::{
  AlwaysResolvesChain, ClientAuthMode, ClientConfig, ExternalPsk, NamedGroup, ProtocolVersion,
  ResolvesNoCert, ServerConfig, ServerExternalPsk, SessionCacheMode, SignatureScheme,
  VersionRange,
};

const CLIENT_HELLO: u8 = 1;
const SERVER_HELLO: u8 = 2;
const HELLO_VERIFY_REQUEST: u8 = 3;
const NEW_SESSION_TICKET: u8 = 4;
const CERTIFICATE: u8 = 11;

fn tls12_only() -> VersionRange {
  VersionRange::single(ProtocolVersion::TLSv1_2)
}

#[test]
fn tls13_full_handshake_without_hrr() {
  // client offers shares for x25519 and p256; the server only speaks
  // p256, but a share for it is on the table, so no retry is needed
  let ctx = test_context();

  let mut ccfg = ClientConfig::new();
  ccfg.groups = vec![NamedGroup::X25519, NamedGroup::secp256r1];

  let mut scfg = ServerConfig::new(Arc::new(AlwaysResolvesChain(ecdsa_identity())));
  scfg.groups = vec![NamedGroup::secp256r1];

  let mut ep = connect(&ctx, &ctx, Arc::new(ccfg), Arc::new(scfg), "example.com").unwrap();
  drive(&mut ep.client, &mut ep.server).unwrap();

  assert_eq!(
    ep.client.negotiated_version(),
    Some(ProtocolVersion::TLSv1_3)
  );
  assert_eq!(
    ep.server.negotiated_version(),
    Some(ProtocolVersion::TLSv1_3)
  );

  // exactly one ServerHello: no HelloRetryRequest happened
  assert_eq!(sent_count(&ep.server_log, SERVER_HELLO), 1);
  assert_eq!(sent_count(&ep.client_log, CLIENT_HELLO), 1);

  assert!(exporters_match(&ep.client, &ep.server));
  assert!(ep.client.peer_certificates().is_some());
}

#[test]
fn tls13_hello_retry_request_path() {
  // the client guesses p256 for its share; the server only takes x25519,
  // which the client listed in supported_groups
  let ctx = test_context();

  let mut ccfg = ClientConfig::new();
  ccfg.groups = vec![NamedGroup::secp256r1, NamedGroup::X25519];
  ccfg.key_share_groups = Some(vec![NamedGroup::secp256r1]);

  let mut scfg = ServerConfig::new(Arc::new(AlwaysResolvesChain(ecdsa_identity())));
  scfg.groups = vec![NamedGroup::X25519];

  let mut ep = connect(&ctx, &ctx, Arc::new(ccfg), Arc::new(scfg), "example.com").unwrap();
  drive(&mut ep.client, &mut ep.server).unwrap();

  // HRR and the real ServerHello both ride the ServerHello message type
  assert_eq!(sent_count(&ep.server_log, SERVER_HELLO), 2);
  assert_eq!(sent_count(&ep.client_log, CLIENT_HELLO), 2);
  assert!(exporters_match(&ep.client, &ep.server));
}

#[test]
fn tls12_rsa_ticket_resumption_preserves_ems() {
  let ctx = test_context();

  let make_client = || {
    let mut ccfg = ClientConfig::new();
    ccfg.versions = tls12_only();
    ccfg.cipher_suites = vec![&suites::TLS_RSA_WITH_AES_128_GCM_SHA256];
    Arc::new(ccfg)
  };
  let make_server = || {
    let mut scfg = ServerConfig::new(Arc::new(AlwaysResolvesChain(rsa_identity())));
    scfg.versions = tls12_only();
    scfg.cipher_suites = vec![&suites::TLS_RSA_WITH_AES_128_GCM_SHA256];
    Arc::new(scfg)
  };

  let mut first = connect(&ctx, &ctx, make_client(), make_server(), "example.com").unwrap();
  drive(&mut first.client, &mut first.server).unwrap();

  // full handshake presented a certificate and issued a ticket
  assert_eq!(sent_count(&first.server_log, CERTIFICATE), 1);
  assert_eq!(sent_count(&first.server_log, NEW_SESSION_TICKET), 1);

  let stored = ctx.client_session_for("example.com").expect("session saved");
  assert!(stored.extended_ms);
  assert!(!stored.ticket.0.is_empty());

  // second connection resumes: abbreviated handshake, no certificate
  let mut second = connect(&ctx, &ctx, make_client(), make_server(), "example.com").unwrap();
  drive(&mut second.client, &mut second.server).unwrap();

  assert_eq!(sent_count(&second.server_log, CERTIFICATE), 0);
  let resumed = ctx.client_session_for("example.com").unwrap();
  assert!(resumed.extended_ms);
}

#[test]
fn tls12_secure_renegotiation() {
  let ctx = test_context();

  let mut ccfg = ClientConfig::new();
  ccfg.versions = tls12_only();
  let mut scfg = ServerConfig::new(Arc::new(AlwaysResolvesChain(rsa_identity())));
  scfg.versions = tls12_only();

  let mut ep = connect(&ctx, &ctx, Arc::new(ccfg), Arc::new(scfg), "example.com").unwrap();
  drive(&mut ep.client, &mut ep.server).unwrap();

  // server asks; the client's next hello must carry its verify_data
  ep.server.renegotiate().unwrap();
  drive(&mut ep.client, &mut ep.server).unwrap();

  assert_eq!(sent_count(&ep.client_log, CLIENT_HELLO), 2);
  assert_eq!(sent_count(&ep.server_log, SERVER_HELLO), 2);

  // traffic keys rotated: a fresh key block was installed either side
  assert!(ep.client_log.lock().unwrap().write_keys.len() >= 2);
  assert!(ep.server_log.lock().unwrap().write_keys.len() >= 2);
}

#[test]
fn tls13_external_psk_only() {
  // no certificates anywhere: authentication is the external PSK, and
  // the client declines to send key shares, forcing pure psk_ke
  let ctx = test_context();

  let psk = b"a very secret psk".to_vec();

  let mut ccfg = ClientConfig::new();
  ccfg.versions = VersionRange::single(ProtocolVersion::TLSv1_3);
  ccfg.tls13_cipher_suites = vec![&suites::TLS13_AES_128_GCM_SHA256];
  ccfg.key_share_groups = Some(Vec::new());
  ccfg.external_psk = Some(ExternalPsk {
    identity: b"demo".to_vec(),
    key: psk.clone(),
  });

  let mut scfg = ServerConfig::new(Arc::new(ResolvesNoCert));
  scfg.tls13_cipher_suites = vec![&suites::TLS13_AES_128_GCM_SHA256];
  scfg.external_psks = vec![ServerExternalPsk {
    identity: b"demo".to_vec(),
    key: psk,
  }];

  let mut ep = connect(&ctx, &ctx, Arc::new(ccfg), Arc::new(scfg), "example.com").unwrap();
  drive(&mut ep.client, &mut ep.server).unwrap();

  // neither side showed a certificate
  assert_eq!(sent_count(&ep.server_log, CERTIFICATE), 0);
  assert_eq!(sent_count(&ep.client_log, CERTIFICATE), 0);
  assert!(exporters_match(&ep.client, &ep.server));
}

#[test]
fn dtls12_cookie_exchange() {
  let ctx = test_context();

  let mut ccfg = ClientConfig::new();
  ccfg.versions = VersionRange::single(ProtocolVersion::DTLSv1_2);
  let mut scfg = ServerConfig::new(Arc::new(AlwaysResolvesChain(rsa_identity())));
  scfg.versions = VersionRange::single(ProtocolVersion::DTLSv1_2);

  let mut ep = connect(&ctx, &ctx, Arc::new(ccfg), Arc::new(scfg), "example.com").unwrap();
  drive(&mut ep.client, &mut ep.server).unwrap();

  // first hello was naked, the retry carried the cookie
  assert_eq!(sent_count(&ep.server_log, HELLO_VERIFY_REQUEST), 1);
  assert_eq!(sent_count(&ep.client_log, CLIENT_HELLO), 2);
  assert_eq!(
    ep.client.negotiated_version(),
    Some(ProtocolVersion::DTLSv1_2)
  );
}

#[test]
fn tls13_ticket_resumption() {
  let ctx = test_context();

  let make_client = || Arc::new(ClientConfig::new());
  let make_server = || Arc::new(ServerConfig::new(Arc::new(AlwaysResolvesChain(ecdsa_identity()))));

  let mut first = connect(&ctx, &ctx, make_client(), make_server(), "example.com").unwrap();
  drive(&mut first.client, &mut first.server).unwrap();
  assert_eq!(sent_count(&first.server_log, CERTIFICATE), 1);

  let stored = ctx.client_session_for("example.com").expect("ticket stored");
  assert_eq!(stored.version, ProtocolVersion::TLSv1_3);
  assert!(!stored.ticket.0.is_empty());

  let mut second = connect(&ctx, &ctx, make_client(), make_server(), "example.com").unwrap();
  drive(&mut second.client, &mut second.server).unwrap();

  // PSK resumption: no certificate flight the second time
  assert_eq!(sent_count(&second.server_log, CERTIFICATE), 0);
  assert!(exporters_match(&second.client, &second.server));
}

#[test]
fn tls13_key_update_both_directions() {
  let ctx = test_context();

  let ccfg = Arc::new(ClientConfig::new());
  let scfg = Arc::new(ServerConfig::new(Arc::new(AlwaysResolvesChain(ecdsa_identity()))));

  let mut ep = connect(&ctx, &ctx, ccfg, scfg, "example.com").unwrap();
  drive(&mut ep.client, &mut ep.server).unwrap();

  let client_writes = ep.client_log.lock().unwrap().write_keys.len();
  let server_writes = ep.server_log.lock().unwrap().write_keys.len();

  // client rotates and asks the server to do the same
  ep.client.key_update(true).unwrap();
  ep.server.step().unwrap();
  ep.client.step().unwrap();

  assert_eq!(
    ep.client_log.lock().unwrap().write_keys.len(),
    client_writes + 1
  );
  assert_eq!(
    ep.server_log.lock().unwrap().write_keys.len(),
    server_writes + 1
  );

  // the client's new write secret is the server's new read secret
  let client_write = ep.client_log.lock().unwrap().write_keys.last().unwrap().clone();
  let server_read = ep.server_log.lock().unwrap().read_keys.last().unwrap().clone();
  assert_eq!(client_write.secret, server_read.secret);
}

#[test]
fn tls13_post_handshake_auth() {
  let ctx = test_context();

  let mut ccfg = ClientConfig::new();
  ccfg.post_handshake_auth = true;
  let (chain, signer) = client_auth_material();
  ccfg.client_auth_cert = Some((chain, signer));

  let scfg = Arc::new(ServerConfig::new(Arc::new(AlwaysResolvesChain(ecdsa_identity()))));

  let mut ep = connect(&ctx, &ctx, Arc::new(ccfg), scfg, "example.com").unwrap();
  drive(&mut ep.client, &mut ep.server).unwrap();

  assert!(ep.server.peer_certificates().is_none());

  ep.server.post_handshake_auth_request().unwrap();
  ep.client.step().unwrap();
  ep.server.step().unwrap();

  assert!(ep.server.peer_certificates().is_some());
}

#[test]
fn tls12_client_auth_required() {
  let ctx = test_context();

  let mut ccfg = ClientConfig::new();
  ccfg.versions = tls12_only();
  let (chain, signer) = client_auth_material();
  ccfg.client_auth_cert = Some((chain, signer));

  let mut scfg = ServerConfig::new(Arc::new(AlwaysResolvesChain(rsa_identity())));
  scfg.versions = tls12_only();
  scfg.client_auth = ClientAuthMode::Required;

  let mut ep = connect(&ctx, &ctx, Arc::new(ccfg), Arc::new(scfg), "example.com").unwrap();
  drive(&mut ep.client, &mut ep.server).unwrap();

  assert!(ep.server.peer_certificates().is_some());
}

#[test]
fn tls13_client_auth_in_handshake() {
  let ctx = test_context();

  let mut ccfg = ClientConfig::new();
  let (chain, signer) = client_auth_material();
  ccfg.client_auth_cert = Some((chain, signer));

  let mut scfg = ServerConfig::new(Arc::new(AlwaysResolvesChain(ecdsa_identity())));
  scfg.client_auth = ClientAuthMode::Required;

  let mut ep = connect(&ctx, &ctx, Arc::new(ccfg), Arc::new(scfg), "example.com").unwrap();
  drive(&mut ep.client, &mut ep.server).unwrap();

  assert!(ep.server.peer_certificates().is_some());
  assert!(exporters_match(&ep.client, &ep.server));
}

#[test]
fn tlcp11_ecc_handshake() {
  let ctx = test_context();

  let mut ccfg = ClientConfig::new();
  ccfg.versions = VersionRange::single(ProtocolVersion::TLCPv1_1);
  ccfg.cipher_suites = suites::default_tlcp_suites();
  ccfg.sig_algs = vec![SignatureScheme::SM2SIG_SM3];

  let mut scfg = ServerConfig::new(Arc::new(AlwaysResolvesChain(tlcp_identity())));
  scfg.versions = VersionRange::single(ProtocolVersion::TLCPv1_1);
  scfg.cipher_suites = suites::default_tlcp_suites();
  scfg.sig_algs = vec![SignatureScheme::SM2SIG_SM3];

  let mut ep = connect(&ctx, &ctx, Arc::new(ccfg), Arc::new(scfg), "example.com").unwrap();
  drive(&mut ep.client, &mut ep.server).unwrap();

  assert_eq!(
    ep.client.negotiated_version(),
    Some(ProtocolVersion::TLCPv1_1)
  );
  // the chain carried both the signing and the encryption certificate
  assert_eq!(ep.client.peer_certificates().unwrap().len(), 2);
}

#[test]
fn tls12_plain_psk() {
  let ctx = test_context();

  let psk = b"plain psk key".to_vec();
  let psk_for_server = psk.clone();

  let mut ccfg = ClientConfig::new();
  ccfg.versions = tls12_only();
  ccfg.cipher_suites = vec![&suites::TLS_PSK_WITH_AES_128_GCM_SHA256];
  ccfg.psk_client_callback = Some(Arc::new(move |_hint| {
    Some((b"psk-user".to_vec(), psk.clone()))
  }));

  let mut scfg = ServerConfig::new(Arc::new(ResolvesNoCert));
  scfg.versions = tls12_only();
  scfg.cipher_suites = vec![&suites::TLS_PSK_WITH_AES_128_GCM_SHA256];
  scfg.psk_identity_hint = Some(b"hint".to_vec());
  scfg.psk_server_callback = Some(Arc::new(move |identity| {
    (identity == &b"psk-user"[..]).then(|| psk_for_server.clone())
  }));

  let mut ep = connect(&ctx, &ctx, Arc::new(ccfg), Arc::new(scfg), "example.com").unwrap();
  drive(&mut ep.client, &mut ep.server).unwrap();

  assert_eq!(sent_count(&ep.server_log, CERTIFICATE), 0);
}

#[test]
fn tls12_dhe_handshake() {
  let ctx = test_context();

  let mut ccfg = ClientConfig::new();
  ccfg.versions = tls12_only();
  ccfg.cipher_suites = vec![&suites::TLS_DHE_RSA_WITH_AES_128_GCM_SHA256];

  let mut scfg = ServerConfig::new(Arc::new(AlwaysResolvesChain(rsa_identity())));
  scfg.versions = tls12_only();
  scfg.cipher_suites = vec![&suites::TLS_DHE_RSA_WITH_AES_128_GCM_SHA256];

  let mut ep = connect(&ctx, &ctx, Arc::new(ccfg), Arc::new(scfg), "example.com").unwrap();
  drive(&mut ep.client, &mut ep.server).unwrap();

  assert!(ep.client.peer_certificates().is_some());
}

#[test]
fn application_data_flows_after_handshake() {
  let ctx = test_context();

  let ccfg = Arc::new(ClientConfig::new());
  let scfg = Arc::new(ServerConfig::new(Arc::new(AlwaysResolvesChain(ecdsa_identity()))));

  let mut ep = connect(&ctx, &ctx, ccfg, scfg, "example.com").unwrap();
  drive(&mut ep.client, &mut ep.server).unwrap();

  ep.client.write(b"ping").unwrap();
  ep.server.step().unwrap();
  let mut buf = [0u8; 16];
  let n = ep.server.read(&mut buf);
  assert_eq!(&buf[..n], b"ping");

  ep.server.write(b"pong").unwrap();
  ep.client.step().unwrap();
  let n = ep.client.read(&mut buf);
  assert_eq!(&buf[..n], b"pong");
}

#[test]
fn session_cache_mode_off_disables_resumption() {
  let ctx = test_context();

  let make_client = || {
    let mut ccfg = ClientConfig::new();
    ccfg.versions = tls12_only();
    ccfg.enable_tickets = false;
    ccfg.session_cache_mode = SessionCacheMode::Off;
    Arc::new(ccfg)
  };
  let make_server = || {
    let mut scfg = ServerConfig::new(Arc::new(AlwaysResolvesChain(rsa_identity())));
    scfg.versions = tls12_only();
    Arc::new(scfg)
  };

  let mut first = connect(&ctx, &ctx, make_client(), make_server(), "example.com").unwrap();
  drive(&mut first.client, &mut first.server).unwrap();

  assert!(ctx.client_session_for("example.com").is_none());

  let mut second = connect(&ctx, &ctx, make_client(), make_server(), "example.com").unwrap();
  drive(&mut second.client, &mut second.server).unwrap();
  // still a full handshake
  assert_eq!(sent_count(&second.server_log, CERTIFICATE), 1);
}
