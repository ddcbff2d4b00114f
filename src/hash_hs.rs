use crate::msgs::codec::Codec;
use crate::msgs::enums::HashAlgorithm;
use crate::msgs::handshake::HandshakeMessagePayload;
use crate::msgs::message::{Message, MessagePayload};
use crate::provider::{CryptoProvider, HashContext, ProviderError};

use std::sync::Arc;

/// Early handshake transcript, before the cipher suite (and so the hash)
/// is known: raw bytes are buffered, then fed exactly once on conversion.
pub struct HandshakeHashBuffer {
  buffer: Vec<u8>,
  client_auth_enabled: bool,
}

impl HandshakeHashBuffer {
  pub fn new() -> HandshakeHashBuffer {
    HandshakeHashBuffer {
      buffer: Vec::new(),
      client_auth_enabled: false,
    }
  }

  /// Keep the raw message log so a later TLS 1.2 CertificateVerify can
  /// sign it.
  pub fn set_client_auth_enabled(&mut self) {
    self.client_auth_enabled = true;
  }

  pub fn add_message(&mut self, m: &Message) {
    if let MessagePayload::Handshake(ref hs) = m.payload {
      hs.encode(&mut self.buffer);
    }
  }

  pub fn add_raw(&mut self, bytes: &[u8]) {
    self.buffer.extend_from_slice(bytes);
  }

  /// Discard everything buffered so far.  The DTLS cookie exchange
  /// excludes the initial ClientHello and HelloVerifyRequest this way.
  pub fn reset(&mut self) {
    self.buffer.clear();
  }

  /// Hash of the buffer plus `extra`, without converting.  Used for PSK
  /// binders over the truncated ClientHello before any ServerHello
  /// fixes the suite.
  pub fn get_hash_given(
    &self,
    provider: &dyn CryptoProvider,
    alg: HashAlgorithm,
    extra: &[u8],
  ) -> Result<Vec<u8>, ProviderError> {
    let mut ctx = provider.hash(alg)?;
    ctx.update(&self.buffer);
    ctx.update(extra);
    Ok(ctx.digest())
  }

  /// The suite is decided: switch to a running hash, replaying the
  /// buffer once.
  pub fn start_hash(
    self,
    provider: Arc<dyn CryptoProvider>,
    alg: HashAlgorithm,
  ) -> Result<HandshakeHash, ProviderError> {
    let mut ctx = provider.hash(alg)?;
    ctx.update(&self.buffer);

    Ok(HandshakeHash {
      provider,
      alg,
      ctx,
      client_auth: if self.client_auth_enabled {
        Some(self.buffer)
      } else {
        None
      },
    })
  }
}

/// The running handshake transcript hash.
///
/// Every accepted or emitted handshake message contributes exactly once,
/// in order.
pub struct HandshakeHash {
  provider: Arc<dyn CryptoProvider>,
  alg: HashAlgorithm,
  ctx: Box<dyn HashContext>,
  /// Raw messages, retained only while TLS 1.2 client auth may need them.
  client_auth: Option<Vec<u8>>,
}

impl HandshakeHash {
  /// A transcript starting empty at a known hash: used when rebuilding
  /// after HelloRetryRequest.
  pub fn new_started(
    provider: Arc<dyn CryptoProvider>,
    alg: HashAlgorithm,
  ) -> Result<HandshakeHash, ProviderError> {
    let ctx = provider.hash(alg)?;
    Ok(HandshakeHash {
      provider,
      alg,
      ctx,
      client_auth: None,
    })
  }

  pub fn algorithm(&self) -> HashAlgorithm {
    self.alg
  }

  pub fn add_message(&mut self, m: &Message) -> &mut HandshakeHash {
    if let MessagePayload::Handshake(ref hs) = m.payload {
      let buf = hs.get_encoding();
      self.update_raw(&buf);
    }
    self
  }

  pub fn add_raw(&mut self, buf: &[u8]) -> &mut HandshakeHash {
    self.update_raw(buf)
  }

  fn update_raw(&mut self, buf: &[u8]) -> &mut HandshakeHash {
    self.ctx.update(buf);

    if let Some(ref mut client_auth) = self.client_auth {
      client_auth.extend_from_slice(buf);
    }

    self
  }

  /// The current transcript hash; does not disturb the stream.
  pub fn get_current_hash(&self) -> Vec<u8> {
    self.ctx.digest()
  }

  /// Hash as if `extra` were appended, without appending it.  Binder
  /// verification forks the transcript this way.
  pub fn fork_hash_given(&self, extra: &[u8]) -> Vec<u8> {
    let mut fork = self.ctx.fork();
    fork.update(extra);
    fork.digest()
  }

  /// An independent copy of the running hash.  Post-handshake TLS 1.3
  /// messages branch the transcript this way.
  pub fn fork(&self) -> HandshakeHash {
    HandshakeHash {
      provider: self.provider.clone(),
      alg: self.alg,
      ctx: self.ctx.fork(),
      client_auth: None,
    }
  }

  /// After emitting or receiving a HelloRetryRequest the transcript
  /// becomes `message_hash(H(ClientHello1)) || ...`.
  pub fn rollup_for_hrr(&mut self) -> Result<(), ProviderError> {
    let hash = self.ctx.digest();
    let synthetic = HandshakeMessagePayload::build_message_hash(hash).get_encoding();

    self.ctx = self.provider.hash(self.alg)?;
    self.ctx.update(&synthetic);

    if let Some(ref mut client_auth) = self.client_auth {
      client_auth.clear();
      client_auth.extend_from_slice(&synthetic);
    }

    Ok(())
  }

  /// We decided not to do client auth after all; drop the buffer.
  pub fn abandon_client_auth(&mut self) {
    self.client_auth = None;
  }

  /// The raw handshake messages a TLS 1.2 CertificateVerify signs.
  pub fn take_handshake_buf(&mut self) -> Option<Vec<u8>> {
    self.client_auth.take()
  }
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
  fn buffer_replays_exactly_once() {
    let p = provider();

    let mut buf = HandshakeHashBuffer::new();
    buf.add_raw(b"hello ");
    buf.add_raw(b"world");
    let hh = buf.start_hash(p.clone(), HashAlgorithm::SHA256).unwrap();

    let mut direct = p.hash(HashAlgorithm::SHA256).unwrap();
    direct.update(b"hello world");

    assert_eq!(hh.get_current_hash(), direct.digest());
  }

  #[test]
  fn fork_does_not_disturb() {
    let p = provider();
    let mut buf = HandshakeHashBuffer::new();
    buf.add_raw(b"client hello bytes");
    let hh = buf.start_hash(p, HashAlgorithm::SHA256).unwrap();

    let before = hh.get_current_hash();
    let _forked = hh.fork_hash_given(b"binders");
    assert_eq!(hh.get_current_hash(), before);
  }

  #[test]
  fn hrr_rollup_replaces_history_with_message_hash() {
    let p = provider();
    let mut buf = HandshakeHashBuffer::new();
    buf.add_raw(b"client hello one");
    let mut hh = buf.start_hash(p.clone(), HashAlgorithm::SHA256).unwrap();

    let ch1_hash = hh.get_current_hash();
    hh.rollup_for_hrr().unwrap();

    // reproduce by hand: message_hash wrapper over H(CH1)
    let synthetic = HandshakeMessagePayload::build_message_hash(ch1_hash).get_encoding();
    let mut expect = p.hash(HashAlgorithm::SHA256).unwrap();
    expect.update(&synthetic);

    assert_eq!(hh.get_current_hash(), expect.digest());
  }

  #[test]
  fn client_auth_buffer_lifecycle() {
    let p = provider();
    let mut buf = HandshakeHashBuffer::new();
    buf.set_client_auth_enabled();
    buf.add_raw(b"msg1");
    let mut hh = buf.start_hash(p, HashAlgorithm::SHA256).unwrap();
    hh.add_raw(b"msg2");

    assert_eq!(hh.take_handshake_buf().unwrap(), b"msg1msg2");
    assert!(hh.take_handshake_buf().is_none());
  }
}
