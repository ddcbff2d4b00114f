//! The three collaborator seams: primitive cryptography, X.509 processing
//! and record-layer transport.  The handshake engine only ever talks to
//! these traits; a *ring*-backed [`CryptoProvider`] is supplied for the
//! algorithms ring implements.

use crate::msgs::enums::{
  AlertDescription, ContentType, HashAlgorithm, NamedGroup, SignatureAlgorithm, SignatureScheme,
};
use crate::msgs::handshake::ASN1Cert;
use crate::suites::BulkAlgorithm;

/// Errors crossing the crypto-provider boundary.  No panics, no
/// provider-specific types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
  #[error("operation not supported by this provider")]
  Unsupported,
  #[error("bad key material")]
  BadKey,
  #[error("signature rejected")]
  BadSignature,
  #[error("random source failure")]
  RandomFailure,
  #[error("decryption failed")]
  DecryptFailed,
  #[error("crypto operation failed")]
  CryptoFailed,
}

/// Errors from the certificate provider, each with its natural alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CertError {
  #[error("certificate is corrupt")]
  BadCertificate,
  #[error("certificate type unsupported")]
  UnsupportedCertificate,
  #[error("certificate is revoked")]
  Revoked,
  #[error("certificate has expired")]
  Expired,
  #[error("certificate cannot be evaluated")]
  UnknownIssues,
  #[error("issuing CA is untrusted")]
  UnknownCa,
  #[error("certificate refused by policy")]
  AccessDenied,
  #[error("certificate lacks the required key usage")]
  BadKeyUsage,
  #[error("a certificate is required and none was supplied")]
  Required,
}

impl CertError {
  pub fn alert(&self) -> AlertDescription {
    match self {
      CertError::BadCertificate => AlertDescription::BadCertificate,
      CertError::UnsupportedCertificate => AlertDescription::UnsupportedCertificate,
      CertError::Revoked => AlertDescription::CertificateRevoked,
      CertError::Expired => AlertDescription::CertificateExpired,
      CertError::UnknownIssues => AlertDescription::CertificateUnknown,
      CertError::UnknownCa => AlertDescription::UnknownCA,
      CertError::AccessDenied => AlertDescription::AccessDenied,
      CertError::BadKeyUsage => AlertDescription::BadCertificate,
      CertError::Required => AlertDescription::CertificateRequired,
    }
  }
}

/// What a certificate is being used for, for chain and key-usage checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertUsage {
  ServerAuth,
  ClientAuth,
  /// TLCP encryption certificate: must allow key encipherment.
  KeyEncipherment,
}

/// A running hash whose state can be forked; `digest()` does not disturb
/// the stream.
pub trait HashContext: Send {
  fn update(&mut self, data: &[u8]);
  fn fork(&self) -> Box<dyn HashContext>;
  fn digest(&self) -> Vec<u8>;
}

/// An in-progress (EC)DH exchange: our ephemeral key pair, consumed on
/// completion.
pub trait ActiveKeyExchange: Send {
  fn group(&self) -> NamedGroup;
  fn pub_key(&self) -> &[u8];
  fn complete(self: Box<Self>, peer: &[u8]) -> Result<Vec<u8>, ProviderError>;
}

/// Key-transport schemes where the client encrypts the premaster under
/// the server's certificate key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTransport {
  Rsa,
  Sm2,
}

/// Primitive cryptography.  Thread-safe; the DRBG serialises internally.
pub trait CryptoProvider: Send + Sync {
  fn hash(&self, alg: HashAlgorithm) -> Result<Box<dyn HashContext>, ProviderError>;
  fn hash_len(&self, alg: HashAlgorithm) -> usize;
  fn hmac(&self, alg: HashAlgorithm, key: &[u8], data: &[u8]) -> Result<Vec<u8>, ProviderError>;
  fn aead_seal(
    &self,
    alg: BulkAlgorithm,
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    plaintext: &[u8],
  ) -> Result<Vec<u8>, ProviderError>;
  fn aead_open(
    &self,
    alg: BulkAlgorithm,
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
  ) -> Result<Vec<u8>, ProviderError>;
  fn start_kx(&self, group: NamedGroup) -> Result<Box<dyn ActiveKeyExchange>, ProviderError>;

  /// Encrypt `plaintext` under the peer's public key (RSA key transport,
  /// TLCP SM2 encryption).
  fn encapsulate(
    &self,
    scheme: KeyTransport,
    peer_public: &[u8],
    plaintext: &[u8],
  ) -> Result<Vec<u8>, ProviderError>;

  fn verify(
    &self,
    scheme: SignatureScheme,
    public_key: &[u8],
    message: &[u8],
    sig: &[u8],
  ) -> Result<(), ProviderError>;

  fn random(&self, out: &mut [u8]) -> Result<(), ProviderError>;

  /// Constant-time equality for secret-dependent comparisons.
  fn constant_time_eq(&self, a: &[u8], b: &[u8]) -> bool;
}

/// A private signing key, resolved from configuration.
pub trait Signer: Send + Sync {
  fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<SignatureScheme>;
  fn sign(&self, scheme: SignatureScheme, message: &[u8]) -> Result<Vec<u8>, ProviderError>;
  fn algorithm(&self) -> SignatureAlgorithm;
}

/// A private decryption key for key-transport modes (RSA, TLCP SM2).
pub trait Decrypter: Send + Sync {
  fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, ProviderError>;
}

/// The X.509 collaborator.  The engine never parses certificate bytes.
pub trait CertVerifier: Send + Sync {
  fn verify_chain(
    &self,
    end_entity: &ASN1Cert,
    intermediates: &[ASN1Cert],
    hostname: Option<&str>,
    usage: CertUsage,
  ) -> Result<(), CertError>;

  /// Extract the subject public key for signature verification or
  /// key transport.
  fn public_key(&self, cert: &ASN1Cert) -> Result<Vec<u8>, CertError>;
}

/// Keys handed to the record layer when traffic protection changes.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectionKeys {
  pub epoch: u32,
  pub suite: crate::msgs::enums::CipherSuite,
  /// TLS 1.3: a traffic secret.  TLS 1.2 family: the key block.
  pub secret: Vec<u8>,
}

/// The record-layer collaborator: framing, encryption and I/O live
/// behind it.
pub trait RecordLayer: Send {
  fn send(&mut self, typ: ContentType, payload: &[u8]);
  fn recv(&mut self) -> Option<(ContentType, Vec<u8>)>;
  fn set_read_key(&mut self, keys: DirectionKeys);
  fn set_write_key(&mut self, keys: DirectionKeys);

  fn write_ccs(&mut self) {
    self.send(ContentType::ChangeCipherSpec, &[1]);
  }

  fn flush(&mut self);
  fn close(&mut self);
}

// -- ring-backed default provider --

struct RingHash {
  ctx: ring::digest::Context,
}

impl HashContext for RingHash {
  fn update(&mut self, data: &[u8]) {
    self.ctx.update(data);
  }

  fn fork(&self) -> Box<dyn HashContext> {
    Box::new(RingHash {
      ctx: self.ctx.clone(),
    })
  }

  fn digest(&self) -> Vec<u8> {
    self.ctx.clone().finish().as_ref().to_vec()
  }
}

struct RingKeyExchange {
  group: NamedGroup,
  alg: &'static ring::agreement::Algorithm,
  privkey: ring::agreement::EphemeralPrivateKey,
  pubkey: Vec<u8>,
}

impl ActiveKeyExchange for RingKeyExchange {
  fn group(&self) -> NamedGroup {
    self.group
  }

  fn pub_key(&self) -> &[u8] {
    &self.pubkey
  }

  fn complete(self: Box<Self>, peer: &[u8]) -> Result<Vec<u8>, ProviderError> {
    let peer_key = ring::agreement::UnparsedPublicKey::new(self.alg, peer);
    ring::agreement::agree_ephemeral(self.privkey, &peer_key, ProviderError::BadKey, |secret| {
      Ok(secret.to_vec())
    })
  }
}

/// The default provider: hashing, HMAC, AEAD, (EC)DH and signature
/// verification from *ring*.  SM2/SM3/SM4, FFDHE and key transport are
/// reported `Unsupported`; deployments needing them plug in another
/// provider.
pub struct RingProvider {
  rng: ring::rand::SystemRandom,
}

impl Default for RingProvider {
  fn default() -> RingProvider {
    RingProvider::new()
  }
}

impl RingProvider {
  pub fn new() -> RingProvider {
    RingProvider {
      rng: ring::rand::SystemRandom::new(),
    }
  }

  fn digest_alg(alg: HashAlgorithm) -> Result<&'static ring::digest::Algorithm, ProviderError> {
    match alg {
      HashAlgorithm::SHA256 => Ok(&ring::digest::SHA256),
      HashAlgorithm::SHA384 => Ok(&ring::digest::SHA384),
      HashAlgorithm::SHA512 => Ok(&ring::digest::SHA512),
      _ => Err(ProviderError::Unsupported),
    }
  }

  fn hmac_alg(alg: HashAlgorithm) -> Result<ring::hmac::Algorithm, ProviderError> {
    match alg {
      HashAlgorithm::SHA256 => Ok(ring::hmac::HMAC_SHA256),
      HashAlgorithm::SHA384 => Ok(ring::hmac::HMAC_SHA384),
      HashAlgorithm::SHA512 => Ok(ring::hmac::HMAC_SHA512),
      _ => Err(ProviderError::Unsupported),
    }
  }

  fn aead_alg(alg: BulkAlgorithm) -> Result<&'static ring::aead::Algorithm, ProviderError> {
    match alg {
      BulkAlgorithm::AES_128_GCM => Ok(&ring::aead::AES_128_GCM),
      BulkAlgorithm::AES_256_GCM => Ok(&ring::aead::AES_256_GCM),
      BulkAlgorithm::CHACHA20_POLY1305 => Ok(&ring::aead::CHACHA20_POLY1305),
      _ => Err(ProviderError::Unsupported),
    }
  }

  fn sig_alg(
    scheme: SignatureScheme,
  ) -> Result<&'static dyn ring::signature::VerificationAlgorithm, ProviderError> {
    use ring::signature;

    Ok(match scheme {
      SignatureScheme::ECDSA_NISTP256_SHA256 => &signature::ECDSA_P256_SHA256_ASN1,
      SignatureScheme::ECDSA_NISTP384_SHA384 => &signature::ECDSA_P384_SHA384_ASN1,
      SignatureScheme::ED25519 => &signature::ED25519,
      SignatureScheme::RSA_PKCS1_SHA256 => &signature::RSA_PKCS1_2048_8192_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384 => &signature::RSA_PKCS1_2048_8192_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512 => &signature::RSA_PKCS1_2048_8192_SHA512,
      SignatureScheme::RSA_PSS_SHA256 => &signature::RSA_PSS_2048_8192_SHA256,
      SignatureScheme::RSA_PSS_SHA384 => &signature::RSA_PSS_2048_8192_SHA384,
      SignatureScheme::RSA_PSS_SHA512 => &signature::RSA_PSS_2048_8192_SHA512,
      _ => return Err(ProviderError::Unsupported),
    })
  }
}

impl CryptoProvider for RingProvider {
  fn hash(&self, alg: HashAlgorithm) -> Result<Box<dyn HashContext>, ProviderError> {
    let alg = RingProvider::digest_alg(alg)?;
    Ok(Box::new(RingHash {
      ctx: ring::digest::Context::new(alg),
    }))
  }

  fn hash_len(&self, alg: HashAlgorithm) -> usize {
    match alg {
      HashAlgorithm::SHA1 => 20,
      HashAlgorithm::SHA256 | HashAlgorithm::SM3 => 32,
      HashAlgorithm::SHA384 => 48,
      HashAlgorithm::SHA512 => 64,
      _ => 0,
    }
  }

  fn hmac(&self, alg: HashAlgorithm, key: &[u8], data: &[u8]) -> Result<Vec<u8>, ProviderError> {
    let alg = RingProvider::hmac_alg(alg)?;
    let key = ring::hmac::Key::new(alg, key);
    Ok(ring::hmac::sign(&key, data).as_ref().to_vec())
  }

  fn aead_seal(
    &self,
    alg: BulkAlgorithm,
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    plaintext: &[u8],
  ) -> Result<Vec<u8>, ProviderError> {
    let alg = RingProvider::aead_alg(alg)?;
    let unbound = ring::aead::UnboundKey::new(alg, key).map_err(|_| ProviderError::BadKey)?;
    let key = ring::aead::LessSafeKey::new(unbound);
    let nonce =
      ring::aead::Nonce::try_assume_unique_for_key(nonce).map_err(|_| ProviderError::BadKey)?;

    let mut in_out = plaintext.to_vec();
    key
      .seal_in_place_append_tag(nonce, ring::aead::Aad::from(aad), &mut in_out)
      .map_err(|_| ProviderError::CryptoFailed)?;
    Ok(in_out)
  }

  fn aead_open(
    &self,
    alg: BulkAlgorithm,
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
  ) -> Result<Vec<u8>, ProviderError> {
    let alg = RingProvider::aead_alg(alg)?;
    let unbound = ring::aead::UnboundKey::new(alg, key).map_err(|_| ProviderError::BadKey)?;
    let key = ring::aead::LessSafeKey::new(unbound);
    let nonce =
      ring::aead::Nonce::try_assume_unique_for_key(nonce).map_err(|_| ProviderError::BadKey)?;

    let mut in_out = ciphertext.to_vec();
    let plain_len = key
      .open_in_place(nonce, ring::aead::Aad::from(aad), &mut in_out)
      .map_err(|_| ProviderError::DecryptFailed)?
      .len();
    in_out.truncate(plain_len);
    Ok(in_out)
  }

  fn start_kx(&self, group: NamedGroup) -> Result<Box<dyn ActiveKeyExchange>, ProviderError> {
    let alg = match group {
      NamedGroup::X25519 => &ring::agreement::X25519,
      NamedGroup::secp256r1 => &ring::agreement::ECDH_P256,
      NamedGroup::secp384r1 => &ring::agreement::ECDH_P384,
      _ => return Err(ProviderError::Unsupported),
    };

    let privkey = ring::agreement::EphemeralPrivateKey::generate(alg, &self.rng)
      .map_err(|_| ProviderError::RandomFailure)?;
    let pubkey = privkey
      .compute_public_key()
      .map_err(|_| ProviderError::CryptoFailed)?
      .as_ref()
      .to_vec();

    Ok(Box::new(RingKeyExchange {
      group,
      alg,
      privkey,
      pubkey,
    }))
  }

  fn encapsulate(
    &self,
    _scheme: KeyTransport,
    _peer_public: &[u8],
    _plaintext: &[u8],
  ) -> Result<Vec<u8>, ProviderError> {
    // ring has no RSA or SM2 public-key encryption.
    Err(ProviderError::Unsupported)
  }

  fn verify(
    &self,
    scheme: SignatureScheme,
    public_key: &[u8],
    message: &[u8],
    sig: &[u8],
  ) -> Result<(), ProviderError> {
    let alg = RingProvider::sig_alg(scheme)?;
    let key = ring::signature::UnparsedPublicKey::new(alg, public_key);
    key
      .verify(message, sig)
      .map_err(|_| ProviderError::BadSignature)
  }

  fn random(&self, out: &mut [u8]) -> Result<(), ProviderError> {
    use ring::rand::SecureRandom;
    self
      .rng
      .fill(out)
      .map_err(|_| ProviderError::RandomFailure)
  }

  fn constant_time_eq(&self, a: &[u8], b: &[u8]) -> bool {
    ring::constant_time::verify_slices_are_equal(a, b).is_ok()
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn hash_fork_is_independent() {
    let provider = RingProvider::new();
    let mut main = provider.hash(HashAlgorithm::SHA256).unwrap();
    main.update(b"hello");

    let fork = main.fork();
    main.update(b" world");

    assert_ne!(main.digest(), fork.digest());
    // digest() must not disturb the stream
    assert_eq!(main.digest(), main.digest());
  }

  #[test]
  fn aead_round_trip_and_tamper() {
    let provider = RingProvider::new();
    let key = [0x42u8; 16];
    let nonce = [7u8; 12];

    let sealed = provider
      .aead_seal(BulkAlgorithm::AES_128_GCM, &key, &nonce, b"aad", b"secret")
      .unwrap();
    let opened = provider
      .aead_open(BulkAlgorithm::AES_128_GCM, &key, &nonce, b"aad", &sealed)
      .unwrap();
    assert_eq!(opened, b"secret");

    let mut tampered = sealed;
    tampered[0] ^= 1;
    assert_eq!(
      provider.aead_open(BulkAlgorithm::AES_128_GCM, &key, &nonce, b"aad", &tampered),
      Err(ProviderError::DecryptFailed)
    );
  }

  #[test]
  fn kx_agrees() {
    let provider = RingProvider::new();
    let a = provider.start_kx(NamedGroup::X25519).unwrap();
    let b = provider.start_kx(NamedGroup::X25519).unwrap();

    let a_pub = a.pub_key().to_vec();
    let b_pub = b.pub_key().to_vec();

    let secret_a = a.complete(&b_pub).unwrap();
    let secret_b = b.complete(&a_pub).unwrap();
    assert_eq!(secret_a, secret_b);
  }

  #[test]
  fn sm_algorithms_unsupported() {
    let provider = RingProvider::new();
    assert!(provider.hash(HashAlgorithm::SM3).is_err());
    assert!(provider.start_kx(NamedGroup::CurveSM2).is_err());
    assert_eq!(
      provider.encapsulate(KeyTransport::Sm2, b"", b""),
      Err(ProviderError::Unsupported)
    );
  }
}
