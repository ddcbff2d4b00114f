use crate::msgs::enums::HashAlgorithm;
use crate::provider::{CryptoProvider, ProviderError};

use std::sync::Arc;
use zeroize::Zeroize;

/// HKDF-Extract.  With HMAC in hand this is a one-liner, so the provider
/// surface stays minimal.
pub fn hkdf_extract(
  provider: &dyn CryptoProvider,
  alg: HashAlgorithm,
  salt: &[u8],
  ikm: &[u8],
) -> Result<Vec<u8>, ProviderError> {
  provider.hmac(alg, salt, ikm)
}

/// HKDF-Expand.
pub fn hkdf_expand(
  provider: &dyn CryptoProvider,
  alg: HashAlgorithm,
  prk: &[u8],
  info: &[u8],
  out_len: usize,
) -> Result<Vec<u8>, ProviderError> {
  let hash_len = provider.hash_len(alg);
  let mut out = Vec::with_capacity(out_len);
  let mut t = Vec::new();
  let mut counter = 1u8;

  while out.len() < out_len {
    let mut block = t.clone();
    block.extend_from_slice(info);
    block.push(counter);
    t = provider.hmac(alg, prk, &block)?;
    out.extend_from_slice(&t);
    counter += 1;
  }

  out.truncate(out_len);
  Ok(out)
}

/// TLS 1.3 HKDF-Expand-Label.
pub fn hkdf_expand_label(
  provider: &dyn CryptoProvider,
  alg: HashAlgorithm,
  secret: &[u8],
  label: &[u8],
  context: &[u8],
  out_len: usize,
) -> Result<Vec<u8>, ProviderError> {
  let mut info = Vec::new();
  info.extend_from_slice(&(out_len as u16).to_be_bytes());
  info.push((6 + label.len()) as u8);
  info.extend_from_slice(b"tls13 ");
  info.extend_from_slice(label);
  info.push(context.len() as u8);
  info.extend_from_slice(context);

  hkdf_expand(provider, alg, secret, &info, out_len)
}

/// The kinds of secret the TLS 1.3 schedule can emit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SecretKind {
  ExternalPskBinderKey,
  ResumptionPskBinderKey,
  ClientHandshakeTrafficSecret,
  ServerHandshakeTrafficSecret,
  ClientApplicationTrafficSecret,
  ServerApplicationTrafficSecret,
  ExporterMasterSecret,
  ResumptionMasterSecret,
}

impl SecretKind {
  fn to_bytes(self) -> &'static [u8] {
    match self {
      SecretKind::ExternalPskBinderKey => b"ext binder",
      SecretKind::ResumptionPskBinderKey => b"res binder",
      SecretKind::ClientHandshakeTrafficSecret => b"c hs traffic",
      SecretKind::ServerHandshakeTrafficSecret => b"s hs traffic",
      SecretKind::ClientApplicationTrafficSecret => b"c ap traffic",
      SecretKind::ServerApplicationTrafficSecret => b"s ap traffic",
      SecretKind::ExporterMasterSecret => b"exp master",
      SecretKind::ResumptionMasterSecret => b"res master",
    }
  }
}

/// The TLS 1.3 key schedule: early secret, handshake secret and master
/// secret stages, with the per-direction traffic secrets kept alongside
/// for Finished computation and KeyUpdate.
pub struct KeySchedule {
  provider: Arc<dyn CryptoProvider>,
  hash: HashAlgorithm,
  hash_len: usize,
  current: Vec<u8>,
  inputs: usize,
  pub current_client_traffic_secret: Vec<u8>,
  pub current_server_traffic_secret: Vec<u8>,
  pub current_exporter_secret: Vec<u8>,
}

impl Drop for KeySchedule {
  fn drop(&mut self) {
    self.current.zeroize();
    self.current_client_traffic_secret.zeroize();
    self.current_server_traffic_secret.zeroize();
    self.current_exporter_secret.zeroize();
  }
}

impl KeySchedule {
  pub fn new(provider: Arc<dyn CryptoProvider>, hash: HashAlgorithm) -> KeySchedule {
    let hash_len = provider.hash_len(hash);
    KeySchedule {
      provider,
      hash,
      hash_len,
      current: vec![0u8; hash_len],
      inputs: 0,
      current_client_traffic_secret: Vec::new(),
      current_server_traffic_secret: Vec::new(),
      current_exporter_secret: Vec::new(),
    }
  }

  pub fn algorithm(&self) -> HashAlgorithm {
    self.hash
  }

  fn empty_hash(&self) -> Result<Vec<u8>, ProviderError> {
    Ok(self.provider.hash(self.hash)?.digest())
  }

  /// Feed the next input secret into the extraction ladder.  The first
  /// input salts with zeroes; later ones first move the current secret
  /// through the "derived" step.
  pub fn input_secret(&mut self, secret: &[u8]) -> Result<(), ProviderError> {
    let salt = if self.inputs == 0 {
      self.current.clone()
    } else {
      let empty_hash = self.empty_hash()?;
      hkdf_expand_label(
        self.provider.as_ref(),
        self.hash,
        &self.current,
        b"derived",
        &empty_hash,
        self.hash_len,
      )?
    };

    let next = hkdf_extract(self.provider.as_ref(), self.hash, &salt, secret)?;
    self.current.zeroize();
    self.current = next;
    self.inputs += 1;
    Ok(())
  }

  pub fn input_empty(&mut self) -> Result<(), ProviderError> {
    let zeroes = vec![0u8; self.hash_len];
    self.input_secret(&zeroes)
  }

  /// Derive a secret of `kind` over the given transcript hash.
  pub fn derive(&self, kind: SecretKind, hs_hash: &[u8]) -> Result<Vec<u8>, ProviderError> {
    hkdf_expand_label(
      self.provider.as_ref(),
      self.hash,
      &self.current,
      kind.to_bytes(),
      hs_hash,
      self.hash_len,
    )
  }

  /// Binder keys hang off the early secret with an empty transcript.
  pub fn derive_binder_key(&self, external: bool) -> Result<Vec<u8>, ProviderError> {
    let kind = if external {
      SecretKind::ExternalPskBinderKey
    } else {
      SecretKind::ResumptionPskBinderKey
    };
    self.derive(kind, &self.empty_hash()?)
  }

  fn finished_key(&self, base: &[u8]) -> Result<Vec<u8>, ProviderError> {
    hkdf_expand_label(
      self.provider.as_ref(),
      self.hash,
      base,
      b"finished",
      b"",
      self.hash_len,
    )
  }

  /// Finished-style MAC over `hs_hash` keyed from `base` (a traffic
  /// secret or binder key).
  pub fn sign_verify_data_from(
    &self,
    base: &[u8],
    hs_hash: &[u8],
  ) -> Result<Vec<u8>, ProviderError> {
    let key = self.finished_key(base)?;
    self.provider.hmac(self.hash, &key, hs_hash)
  }

  /// Finished MAC for the stored traffic secret of `kind`'s side.
  pub fn sign_verify_data(
    &self,
    kind: SecretKind,
    hs_hash: &[u8],
  ) -> Result<Vec<u8>, ProviderError> {
    let base = match kind {
      SecretKind::ClientHandshakeTrafficSecret | SecretKind::ClientApplicationTrafficSecret => {
        &self.current_client_traffic_secret
      }
      SecretKind::ServerHandshakeTrafficSecret | SecretKind::ServerApplicationTrafficSecret => {
        &self.current_server_traffic_secret
      }
      _ => return Err(ProviderError::Unsupported),
    };
    self.sign_verify_data_from(base, hs_hash)
  }

  /// KeyUpdate: the next generation of one direction's traffic secret.
  pub fn next_traffic_secret(&self, current: &[u8]) -> Result<Vec<u8>, ProviderError> {
    hkdf_expand_label(
      self.provider.as_ref(),
      self.hash,
      current,
      b"traffic upd",
      b"",
      self.hash_len,
    )
  }

  /// The per-ticket PSK from the resumption master secret.
  pub fn derive_ticket_psk(&self, rms: &[u8], nonce: &[u8]) -> Result<Vec<u8>, ProviderError> {
    hkdf_expand_label(
      self.provider.as_ref(),
      self.hash,
      rms,
      b"resumption",
      nonce,
      self.hash_len,
    )
  }

  /// RFC 8446 §7.5 exporter interface.
  pub fn export_keying_material(
    &self,
    out: &mut [u8],
    label: &[u8],
    context: Option<&[u8]>,
  ) -> Result<(), ProviderError> {
    let empty_hash = self.empty_hash()?;
    let secret = hkdf_expand_label(
      self.provider.as_ref(),
      self.hash,
      &self.current_exporter_secret,
      label,
      &empty_hash,
      self.hash_len,
    )?;

    let mut ctx_hasher = self.provider.hash(self.hash)?;
    ctx_hasher.update(context.unwrap_or(b""));
    let ctx_hash = ctx_hasher.digest();

    let okm = hkdf_expand_label(
      self.provider.as_ref(),
      self.hash,
      &secret,
      b"exporter",
      &ctx_hash,
      out.len(),
    )?;
    out.copy_from_slice(&okm);
    Ok(())
  }
}

/// The TLS 1.2 PRF (P_hash with the negotiated hash).
pub fn prf(
  provider: &dyn CryptoProvider,
  alg: HashAlgorithm,
  secret: &[u8],
  label: &[u8],
  seed: &[u8],
  out_len: usize,
) -> Result<Vec<u8>, ProviderError> {
  let mut label_seed = Vec::with_capacity(label.len() + seed.len());
  label_seed.extend_from_slice(label);
  label_seed.extend_from_slice(seed);

  let mut out = Vec::with_capacity(out_len);
  let mut a = provider.hmac(alg, secret, &label_seed)?;

  while out.len() < out_len {
    let mut block_input = a.clone();
    block_input.extend_from_slice(&label_seed);
    out.extend_from_slice(&provider.hmac(alg, secret, &block_input)?);
    a = provider.hmac(alg, secret, &a)?;
  }

  out.truncate(out_len);
  Ok(out)
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::provider::RingProvider;
  use std::sync::Arc;

  fn provider() -> Arc<dyn CryptoProvider> {
    Arc::new(RingProvider::new())
  }

  #[test]
  fn expand_produces_requested_length() {
    let p = provider();
    let prk = hkdf_extract(p.as_ref(), HashAlgorithm::SHA256, b"salt", b"ikm").unwrap();
    for len in [1usize, 16, 32, 42, 80] {
      let okm = hkdf_expand(p.as_ref(), HashAlgorithm::SHA256, &prk, b"info", len).unwrap();
      assert_eq!(okm.len(), len);
    }
  }

  #[test]
  fn schedule_is_deterministic_and_stage_sensitive() {
    let p = provider();
    let mut a = KeySchedule::new(p.clone(), HashAlgorithm::SHA256);
    let mut b = KeySchedule::new(p.clone(), HashAlgorithm::SHA256);

    a.input_empty().unwrap();
    a.input_secret(b"shared-ecdhe").unwrap();
    b.input_empty().unwrap();
    b.input_secret(b"shared-ecdhe").unwrap();

    let hash = vec![0xaa; 32];
    let a_c = a
      .derive(SecretKind::ClientHandshakeTrafficSecret, &hash)
      .unwrap();
    let b_c = b
      .derive(SecretKind::ClientHandshakeTrafficSecret, &hash)
      .unwrap();
    assert_eq!(a_c, b_c);

    let a_s = a
      .derive(SecretKind::ServerHandshakeTrafficSecret, &hash)
      .unwrap();
    assert_ne!(a_c, a_s);

    // a further input changes everything
    a.input_empty().unwrap();
    let after = a
      .derive(SecretKind::ClientApplicationTrafficSecret, &hash)
      .unwrap();
    assert_ne!(after, a_c);
  }

  #[test]
  fn binder_keys_differ_by_provenance() {
    let p = provider();
    let mut ks = KeySchedule::new(p, HashAlgorithm::SHA256);
    ks.input_secret(b"the-psk").unwrap();

    let ext = ks.derive_binder_key(true).unwrap();
    let res = ks.derive_binder_key(false).unwrap();
    assert_ne!(ext, res);
  }

  #[test]
  fn key_update_walks_forward() {
    let p = provider();
    let ks = KeySchedule::new(p, HashAlgorithm::SHA256);
    let gen0 = vec![0x55; 32];
    let gen1 = ks.next_traffic_secret(&gen0).unwrap();
    let gen2 = ks.next_traffic_secret(&gen1).unwrap();
    assert_ne!(gen0, gen1);
    assert_ne!(gen1, gen2);
  }

  #[test]
  fn prf_known_length_and_determinism() {
    let p = provider();
    let one = prf(
      p.as_ref(),
      HashAlgorithm::SHA256,
      b"master",
      b"key expansion",
      b"randomness",
      104,
    )
    .unwrap();
    let two = prf(
      p.as_ref(),
      HashAlgorithm::SHA256,
      b"master",
      b"key expansion",
      b"randomness",
      104,
    )
    .unwrap();
    assert_eq!(one.len(), 104);
    assert_eq!(one, two);
  }
}
