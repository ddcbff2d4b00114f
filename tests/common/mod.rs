//! Shared harness: a client and a server wired back-to-back through an
//! in-memory record layer, with a deterministic crypto provider so both
//! ends of every handshake can run without real certificates.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use veiltls::msgs::handshake::ASN1Cert;
use veiltls::provider::{
  ActiveKeyExchange, CertError, CertUsage, CertVerifier, CryptoProvider, Decrypter,
  DirectionKeys, HashContext, KeyTransport, ProviderError, RecordLayer, RingProvider, Signer,
};
use veiltls::suites::BulkAlgorithm;
use veiltls::{
  ClientConfig, ClientSession, Error, HashAlgorithm, LibContext, NamedGroup, ServerConfig,
  ServerIdentity, ServerSession, SignatureScheme, Status,
};
use veiltls::msgs::enums::{ContentType, SignatureAlgorithm};

type Queue = Arc<Mutex<VecDeque<(ContentType, Vec<u8>)>>>;

/// Everything a test might want to inspect about one endpoint's record
/// layer: installed keys and the handshake message types it emitted.
#[derive(Default)]
pub struct RecordLog {
  pub write_keys: Vec<DirectionKeys>,
  pub read_keys: Vec<DirectionKeys>,
  pub sent_handshake_types: Vec<u8>,
  pub ccs_sent: usize,
  pub closed: bool,
}

pub struct MemRecord {
  incoming: Queue,
  outgoing: Queue,
  log: Arc<Mutex<RecordLog>>,
}

impl RecordLayer for MemRecord {
  fn send(&mut self, typ: ContentType, payload: &[u8]) {
    {
      let mut log = self.log.lock().unwrap();
      match typ {
        ContentType::Handshake if !payload.is_empty() => {
          log.sent_handshake_types.push(payload[0]);
        }
        ContentType::ChangeCipherSpec => log.ccs_sent += 1,
        _ => (),
      }
    }
    self
      .outgoing
      .lock()
      .unwrap()
      .push_back((typ, payload.to_vec()));
  }

  fn recv(&mut self) -> Option<(ContentType, Vec<u8>)> {
    self.incoming.lock().unwrap().pop_front()
  }

  fn set_read_key(&mut self, keys: DirectionKeys) {
    self.log.lock().unwrap().read_keys.push(keys);
  }

  fn set_write_key(&mut self, keys: DirectionKeys) {
    self.log.lock().unwrap().write_keys.push(keys);
  }

  fn flush(&mut self) {}

  fn close(&mut self) {
    self.log.lock().unwrap().closed = true;
  }
}

/// Two record layers sharing a pair of queues, plus their logs.
pub fn record_pair() -> (MemRecord, MemRecord, Arc<Mutex<RecordLog>>, Arc<Mutex<RecordLog>>) {
  let a_to_b: Queue = Arc::new(Mutex::new(VecDeque::new()));
  let b_to_a: Queue = Arc::new(Mutex::new(VecDeque::new()));
  let a_log = Arc::new(Mutex::new(RecordLog::default()));
  let b_log = Arc::new(Mutex::new(RecordLog::default()));

  let a = MemRecord {
    incoming: b_to_a.clone(),
    outgoing: a_to_b.clone(),
    log: a_log.clone(),
  };
  let b = MemRecord {
    incoming: a_to_b,
    outgoing: b_to_a,
    log: b_log.clone(),
  };

  (a, b, a_log, b_log)
}

const SIGNING_SECRET: &[u8] = b"test-signing-secret";

fn mock_signature(
  ring: &RingProvider,
  key_id: &[u8],
  scheme: SignatureScheme,
  message: &[u8],
) -> Vec<u8> {
  let mut input = key_id.to_vec();
  input.extend_from_slice(&scheme.get_u16().to_be_bytes());
  input.extend_from_slice(message);
  ring
    .hmac(HashAlgorithm::SHA256, SIGNING_SECRET, &input)
    .unwrap()
}

/// Wraps the ring provider: real hashing, HMAC, AEAD, X25519/P-256, plus
/// deterministic stand-ins for the primitives ring does not offer
/// (signatures, key transport, finite-field and SM2 groups).
pub struct TestProvider {
  ring: RingProvider,
}

impl TestProvider {
  pub fn new() -> TestProvider {
    TestProvider {
      ring: RingProvider::new(),
    }
  }

  fn map_hash(alg: HashAlgorithm) -> HashAlgorithm {
    match alg {
      // SM3 is exercised via SHA-256 so TLCP flows run end to end
      HashAlgorithm::SM3 => HashAlgorithm::SHA256,
      other => other,
    }
  }

  fn map_bulk(alg: BulkAlgorithm) -> BulkAlgorithm {
    match alg {
      BulkAlgorithm::SM4_GCM => BulkAlgorithm::AES_128_GCM,
      other => other,
    }
  }
}

struct RelabelledKx {
  inner: Box<dyn ActiveKeyExchange>,
  group: NamedGroup,
}

impl ActiveKeyExchange for RelabelledKx {
  fn group(&self) -> NamedGroup {
    self.group
  }

  fn pub_key(&self) -> &[u8] {
    self.inner.pub_key()
  }

  fn complete(self: Box<Self>, peer: &[u8]) -> Result<Vec<u8>, ProviderError> {
    self.inner.complete(peer)
  }
}

impl CryptoProvider for TestProvider {
  fn hash(&self, alg: HashAlgorithm) -> Result<Box<dyn HashContext>, ProviderError> {
    self.ring.hash(TestProvider::map_hash(alg))
  }

  fn hash_len(&self, alg: HashAlgorithm) -> usize {
    self.ring.hash_len(TestProvider::map_hash(alg))
  }

  fn hmac(&self, alg: HashAlgorithm, key: &[u8], data: &[u8]) -> Result<Vec<u8>, ProviderError> {
    self.ring.hmac(TestProvider::map_hash(alg), key, data)
  }

  fn aead_seal(
    &self,
    alg: BulkAlgorithm,
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    plaintext: &[u8],
  ) -> Result<Vec<u8>, ProviderError> {
    self
      .ring
      .aead_seal(TestProvider::map_bulk(alg), key, nonce, aad, plaintext)
  }

  fn aead_open(
    &self,
    alg: BulkAlgorithm,
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
  ) -> Result<Vec<u8>, ProviderError> {
    self
      .ring
      .aead_open(TestProvider::map_bulk(alg), key, nonce, aad, ciphertext)
  }

  fn start_kx(&self, group: NamedGroup) -> Result<Box<dyn ActiveKeyExchange>, ProviderError> {
    match group {
      // finite-field groups ride on X25519 for test purposes: the
      // engine only needs a commutative exchange
      NamedGroup::FFDHE2048 | NamedGroup::FFDHE3072 => {
        let inner = self.ring.start_kx(NamedGroup::X25519)?;
        Ok(Box::new(RelabelledKx { inner, group }))
      }
      other => self.ring.start_kx(other),
    }
  }

  fn encapsulate(
    &self,
    _scheme: KeyTransport,
    peer_public: &[u8],
    plaintext: &[u8],
  ) -> Result<Vec<u8>, ProviderError> {
    // reversible framing: |pub| pub plaintext
    let mut out = Vec::new();
    out.extend_from_slice(&(peer_public.len() as u16).to_be_bytes());
    out.extend_from_slice(peer_public);
    out.extend_from_slice(plaintext);
    Ok(out)
  }

  fn verify(
    &self,
    scheme: SignatureScheme,
    public_key: &[u8],
    message: &[u8],
    sig: &[u8],
  ) -> Result<(), ProviderError> {
    let expect = mock_signature(&self.ring, public_key, scheme, message);
    if self.ring.constant_time_eq(&expect, sig) {
      Ok(())
    } else {
      Err(ProviderError::BadSignature)
    }
  }

  fn random(&self, out: &mut [u8]) -> Result<(), ProviderError> {
    self.ring.random(out)
  }

  fn constant_time_eq(&self, a: &[u8], b: &[u8]) -> bool {
    self.ring.constant_time_eq(a, b)
  }
}

/// Signs with the HMAC scheme `TestProvider::verify` checks.  The key id
/// doubles as the matching certificate's "public key".
pub struct TestSigner {
  key_id: Vec<u8>,
  schemes: Vec<SignatureScheme>,
  algorithm: SignatureAlgorithm,
  ring: RingProvider,
}

impl TestSigner {
  pub fn new(key_id: &[u8], schemes: &[SignatureScheme], algorithm: SignatureAlgorithm) -> TestSigner {
    TestSigner {
      key_id: key_id.to_vec(),
      schemes: schemes.to_vec(),
      algorithm,
      ring: RingProvider::new(),
    }
  }
}

impl Signer for TestSigner {
  fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<SignatureScheme> {
    self
      .schemes
      .iter()
      .find(|scheme| offered.contains(scheme))
      .copied()
  }

  fn sign(&self, scheme: SignatureScheme, message: &[u8]) -> Result<Vec<u8>, ProviderError> {
    Ok(mock_signature(&self.ring, &self.key_id, scheme, message))
  }

  fn algorithm(&self) -> SignatureAlgorithm {
    self.algorithm
  }
}

/// Inverts `TestProvider::encapsulate` for a single identity.
pub struct TestDecrypter {
  key_id: Vec<u8>,
}

impl TestDecrypter {
  pub fn new(key_id: &[u8]) -> TestDecrypter {
    TestDecrypter {
      key_id: key_id.to_vec(),
    }
  }
}

impl Decrypter for TestDecrypter {
  fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, ProviderError> {
    if ciphertext.len() < 2 {
      return Err(ProviderError::DecryptFailed);
    }
    let key_len = u16::from_be_bytes([ciphertext[0], ciphertext[1]]) as usize;
    if ciphertext.len() < 2 + key_len {
      return Err(ProviderError::DecryptFailed);
    }
    let (key, premaster) = ciphertext[2..].split_at(key_len);
    if key != self.key_id {
      return Err(ProviderError::DecryptFailed);
    }
    Ok(premaster.to_vec())
  }
}

/// Accepts any chain whose leaf looks like a test certificate; the
/// "public key" is the certificate bytes themselves.
pub struct TestVerifier;

impl CertVerifier for TestVerifier {
  fn verify_chain(
    &self,
    end_entity: &ASN1Cert,
    _intermediates: &[ASN1Cert],
    _hostname: Option<&str>,
    _usage: CertUsage,
  ) -> Result<(), CertError> {
    if end_entity.0.starts_with(b"cert:") {
      Ok(())
    } else {
      Err(CertError::BadCertificate)
    }
  }

  fn public_key(&self, cert: &ASN1Cert) -> Result<Vec<u8>, CertError> {
    Ok(cert.0.clone())
  }
}

pub fn test_context() -> Arc<LibContext> {
  let ctx = LibContext::new(Arc::new(TestProvider::new()), Arc::new(TestVerifier))
    .with_tickets(7200)
    .unwrap();
  Arc::new(ctx)
}

pub fn cert(name: &str) -> ASN1Cert {
  ASN1Cert::new(format!("cert:{}", name).into_bytes())
}

/// An RSA-flavoured server identity (signing plus key transport).
pub fn rsa_identity() -> ServerIdentity {
  let leaf = cert("server-rsa");
  ServerIdentity {
    chain: vec![leaf.clone()],
    signer: Arc::new(TestSigner::new(
      &leaf.0,
      &[
        SignatureScheme::RSA_PSS_SHA256,
        SignatureScheme::RSA_PKCS1_SHA256,
      ],
      SignatureAlgorithm::RSA,
    )),
    decrypter: Some(Arc::new(TestDecrypter::new(&leaf.0))),
  }
}

/// A P-256 ECDSA server identity.
pub fn ecdsa_identity() -> ServerIdentity {
  let leaf = cert("server-ecdsa");
  ServerIdentity {
    chain: vec![leaf.clone()],
    signer: Arc::new(TestSigner::new(
      &leaf.0,
      &[SignatureScheme::ECDSA_NISTP256_SHA256],
      SignatureAlgorithm::ECDSA,
    )),
    decrypter: None,
  }
}

/// A TLCP identity: signing certificate first, encryption certificate
/// second.
pub fn tlcp_identity() -> ServerIdentity {
  let sign_cert = cert("server-sm2-sign");
  let enc_cert = cert("server-sm2-enc");
  ServerIdentity {
    chain: vec![sign_cert.clone(), enc_cert.clone()],
    signer: Arc::new(TestSigner::new(
      &sign_cert.0,
      &[SignatureScheme::SM2SIG_SM3],
      SignatureAlgorithm::SM2,
    )),
    decrypter: Some(Arc::new(TestDecrypter::new(&enc_cert.0))),
  }
}

pub fn client_auth_material() -> (Vec<ASN1Cert>, Arc<dyn Signer>) {
  let leaf = cert("client-auth");
  (
    vec![leaf.clone()],
    Arc::new(TestSigner::new(
      &leaf.0,
      &[
        SignatureScheme::ECDSA_NISTP256_SHA256,
        SignatureScheme::RSA_PSS_SHA256,
      ],
      SignatureAlgorithm::ECDSA,
    )),
  )
}

pub struct Endpoints {
  pub client: ClientSession,
  pub server: ServerSession,
  pub client_log: Arc<Mutex<RecordLog>>,
  pub server_log: Arc<Mutex<RecordLog>>,
}

pub fn connect(
  ctx_client: &Arc<LibContext>,
  ctx_server: &Arc<LibContext>,
  client_config: Arc<ClientConfig>,
  server_config: Arc<ServerConfig>,
  server_name: &str,
) -> Result<Endpoints, Error> {
  let (client_record, server_record, client_log, server_log) = record_pair();

  let server = ServerSession::new(ctx_server.clone(), server_config, Box::new(server_record))?;
  let client = ClientSession::new(
    ctx_client.clone(),
    client_config,
    Box::new(client_record),
    server_name,
  )?;

  Ok(Endpoints {
    client,
    server,
    client_log,
    server_log,
  })
}

/// Step both endpoints until both report a completed handshake.
pub fn drive(client: &mut ClientSession, server: &mut ServerSession) -> Result<(), Error> {
  for _ in 0..64 {
    let client_status = client.step()?;
    let server_status = server.step()?;

    if client_status == Status::HandshakeComplete && server_status == Status::HandshakeComplete {
      // one more round so trailing post-handshake messages (tickets)
      // are ingested
      client.step()?;
      server.step()?;
      return Ok(());
    }
  }

  panic!("handshake did not converge");
}

/// Step both endpoints until one of them fails; returns both outcomes.
pub fn drive_to_failure(
  client: &mut ClientSession,
  server: &mut ServerSession,
) -> (Result<Status, Error>, Result<Status, Error>) {
  let mut client_result = client.step();
  let mut server_result = server.step();

  for _ in 0..64 {
    if client_result.is_err() || server_result.is_err() {
      // one more pass so the peer can read any alert
      if client_result.is_ok() {
        client_result = client.step();
      }
      if server_result.is_ok() {
        server_result = server.step();
      }
      break;
    }
    client_result = client.step();
    server_result = server.step();
  }

  (client_result, server_result)
}

pub fn exporters_match(client: &ClientSession, server: &ServerSession) -> bool {
  let mut client_out = [0u8; 32];
  let mut server_out = [0u8; 32];
  client
    .export_keying_material(&mut client_out, b"test exporter", Some(b"ctx"))
    .unwrap();
  server
    .export_keying_material(&mut server_out, b"test exporter", Some(b"ctx"))
    .unwrap();
  client_out == server_out
}

/// Count how many handshake messages of `typ` one side emitted.
pub fn sent_count(log: &Arc<Mutex<RecordLog>>, typ: u8) -> usize {
  log
    .lock()
    .unwrap()
    .sent_handshake_types
    .iter()
    .filter(|t| **t == typ)
    .count()
}
