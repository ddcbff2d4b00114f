use crate::msgs::enums::{CipherSuite, HashAlgorithm, ProtocolVersion, SignatureAlgorithm};
use crate::msgs::enums::SignatureScheme;
use crate::msgs::handshake::KeyExchangeAlgorithm;
use crate::util;

/// Bulk encryption algorithm of a suite.  The record layer consumes this;
/// the handshake needs it to size key blocks and drive the ticket codec.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkAlgorithm {
  AES_128_GCM,
  AES_256_GCM,
  CHACHA20_POLY1305,
  AES_128_CBC,
  SM4_CBC,
  SM4_GCM,
}

impl BulkAlgorithm {
  /// Encrypt-then-MAC negotiation only applies to CBC suites.
  pub fn is_cbc(&self) -> bool {
    matches!(self, BulkAlgorithm::AES_128_CBC | BulkAlgorithm::SM4_CBC)
  }
}

/// A cipher suite supported by this library.
///
/// All possible instances are provided in the `ALL_CIPHERSUITES` array.
#[derive(Debug)]
pub struct SupportedCipherSuite {
  /// The TLS enumeration naming this cipher suite.
  pub suite: CipherSuite,
  pub kx: KeyExchangeAlgorithm,
  pub bulk: BulkAlgorithm,
  pub hash: HashAlgorithm,
  pub sign: SignatureAlgorithm,
  pub enc_key_len: usize,
  pub fixed_iv_len: usize,
  pub mac_key_len: usize,

  /// GCM suites in TLS 1.2 carry a per-record explicit nonce; the key
  /// block provides its offset.
  pub explicit_nonce_len: usize,
}

impl PartialEq for SupportedCipherSuite {
  fn eq(&self, other: &SupportedCipherSuite) -> bool {
    self.suite == other.suite
  }
}

impl SupportedCipherSuite {
  pub fn get_hash(&self) -> HashAlgorithm {
    self.hash
  }

  pub fn is_tls13(&self) -> bool {
    self.kx == KeyExchangeAlgorithm::BulkOnly
  }

  pub fn is_tlcp(&self) -> bool {
    self.kx == KeyExchangeAlgorithm::ECC_TLCP
  }

  pub fn usable_for_version(&self, version: ProtocolVersion) -> bool {
    match version {
      ProtocolVersion::TLSv1_3 => self.is_tls13(),
      ProtocolVersion::TLCPv1_1 => self.is_tlcp(),
      ProtocolVersion::TLSv1_2 | ProtocolVersion::DTLSv1_2 => {
        !self.is_tls13() && !self.is_tlcp()
      }
      _ => false,
    }
  }

  /// Whether the server must present a certificate under this suite.
  pub fn requires_server_cert(&self) -> bool {
    !matches!(
      self.kx,
      KeyExchangeAlgorithm::PSK
        | KeyExchangeAlgorithm::DHE_PSK
        | KeyExchangeAlgorithm::ECDHE_PSK
    )
  }

  /// Whether the server sends a ServerKeyExchange under this suite.
  pub fn requires_server_kx(&self) -> bool {
    matches!(
      self.kx,
      KeyExchangeAlgorithm::ECDHE
        | KeyExchangeAlgorithm::DHE
        | KeyExchangeAlgorithm::ECDHE_PSK
        | KeyExchangeAlgorithm::DHE_PSK
        | KeyExchangeAlgorithm::ECC_TLCP
    )
  }

  /// Resolve a single signature scheme from the peer's offer, preferring
  /// schemes that match this suite's hash.
  pub fn resolve_sig_scheme(&self, offered: &[SignatureScheme]) -> Option<SignatureScheme> {
    let our_preference = match self.sign {
      SignatureAlgorithm::RSA => &[
        SignatureScheme::RSA_PSS_SHA256,
        SignatureScheme::RSA_PSS_SHA384,
        SignatureScheme::RSA_PKCS1_SHA256,
        SignatureScheme::RSA_PKCS1_SHA384,
        SignatureScheme::RSA_PKCS1_SHA512,
      ][..],
      SignatureAlgorithm::ECDSA => &[
        SignatureScheme::ECDSA_NISTP256_SHA256,
        SignatureScheme::ECDSA_NISTP384_SHA384,
      ][..],
      SignatureAlgorithm::SM2 => &[SignatureScheme::SM2SIG_SM3][..],
      _ => return None,
    };

    util::first_in_both(our_preference, offered)
  }

  pub fn key_block_len(&self) -> usize {
    (self.mac_key_len + self.enc_key_len + self.fixed_iv_len) * 2 + self.explicit_nonce_len
  }
}

pub static TLS13_AES_128_GCM_SHA256: SupportedCipherSuite = SupportedCipherSuite {
  suite: CipherSuite::TLS13_AES_128_GCM_SHA256,
  kx: KeyExchangeAlgorithm::BulkOnly,
  sign: SignatureAlgorithm::Anonymous,
  bulk: BulkAlgorithm::AES_128_GCM,
  hash: HashAlgorithm::SHA256,
  enc_key_len: 16,
  fixed_iv_len: 12,
  mac_key_len: 0,
  explicit_nonce_len: 0,
};

pub static TLS13_AES_256_GCM_SHA384: SupportedCipherSuite = SupportedCipherSuite {
  suite: CipherSuite::TLS13_AES_256_GCM_SHA384,
  kx: KeyExchangeAlgorithm::BulkOnly,
  sign: SignatureAlgorithm::Anonymous,
  bulk: BulkAlgorithm::AES_256_GCM,
  hash: HashAlgorithm::SHA384,
  enc_key_len: 32,
  fixed_iv_len: 12,
  mac_key_len: 0,
  explicit_nonce_len: 0,
};

pub static TLS13_CHACHA20_POLY1305_SHA256: SupportedCipherSuite = SupportedCipherSuite {
  suite: CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
  kx: KeyExchangeAlgorithm::BulkOnly,
  sign: SignatureAlgorithm::Anonymous,
  bulk: BulkAlgorithm::CHACHA20_POLY1305,
  hash: HashAlgorithm::SHA256,
  enc_key_len: 32,
  fixed_iv_len: 12,
  mac_key_len: 0,
  explicit_nonce_len: 0,
};

pub static TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256: SupportedCipherSuite = SupportedCipherSuite {
  suite: CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
  kx: KeyExchangeAlgorithm::ECDHE,
  sign: SignatureAlgorithm::ECDSA,
  bulk: BulkAlgorithm::AES_128_GCM,
  hash: HashAlgorithm::SHA256,
  enc_key_len: 16,
  fixed_iv_len: 4,
  mac_key_len: 0,
  explicit_nonce_len: 8,
};

pub static TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384: SupportedCipherSuite = SupportedCipherSuite {
  suite: CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
  kx: KeyExchangeAlgorithm::ECDHE,
  sign: SignatureAlgorithm::ECDSA,
  bulk: BulkAlgorithm::AES_256_GCM,
  hash: HashAlgorithm::SHA384,
  enc_key_len: 32,
  fixed_iv_len: 4,
  mac_key_len: 0,
  explicit_nonce_len: 8,
};

pub static TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256: SupportedCipherSuite = SupportedCipherSuite {
  suite: CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
  kx: KeyExchangeAlgorithm::ECDHE,
  sign: SignatureAlgorithm::RSA,
  bulk: BulkAlgorithm::AES_128_GCM,
  hash: HashAlgorithm::SHA256,
  enc_key_len: 16,
  fixed_iv_len: 4,
  mac_key_len: 0,
  explicit_nonce_len: 8,
};

pub static TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384: SupportedCipherSuite = SupportedCipherSuite {
  suite: CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
  kx: KeyExchangeAlgorithm::ECDHE,
  sign: SignatureAlgorithm::RSA,
  bulk: BulkAlgorithm::AES_256_GCM,
  hash: HashAlgorithm::SHA384,
  enc_key_len: 32,
  fixed_iv_len: 4,
  mac_key_len: 0,
  explicit_nonce_len: 8,
};

pub static TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256: SupportedCipherSuite =
  SupportedCipherSuite {
    suite: CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    kx: KeyExchangeAlgorithm::ECDHE,
    sign: SignatureAlgorithm::RSA,
    bulk: BulkAlgorithm::CHACHA20_POLY1305,
    hash: HashAlgorithm::SHA256,
    enc_key_len: 32,
    fixed_iv_len: 12,
    mac_key_len: 0,
    explicit_nonce_len: 0,
  };

pub static TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256: SupportedCipherSuite =
  SupportedCipherSuite {
    suite: CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    kx: KeyExchangeAlgorithm::ECDHE,
    sign: SignatureAlgorithm::ECDSA,
    bulk: BulkAlgorithm::CHACHA20_POLY1305,
    hash: HashAlgorithm::SHA256,
    enc_key_len: 32,
    fixed_iv_len: 12,
    mac_key_len: 0,
    explicit_nonce_len: 0,
  };

pub static TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256: SupportedCipherSuite = SupportedCipherSuite {
  suite: CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256,
  kx: KeyExchangeAlgorithm::ECDHE,
  sign: SignatureAlgorithm::RSA,
  bulk: BulkAlgorithm::AES_128_CBC,
  hash: HashAlgorithm::SHA256,
  enc_key_len: 16,
  fixed_iv_len: 16,
  mac_key_len: 32,
  explicit_nonce_len: 0,
};

pub static TLS_RSA_WITH_AES_128_GCM_SHA256: SupportedCipherSuite = SupportedCipherSuite {
  suite: CipherSuite::TLS_RSA_WITH_AES_128_GCM_SHA256,
  kx: KeyExchangeAlgorithm::RSA,
  sign: SignatureAlgorithm::RSA,
  bulk: BulkAlgorithm::AES_128_GCM,
  hash: HashAlgorithm::SHA256,
  enc_key_len: 16,
  fixed_iv_len: 4,
  mac_key_len: 0,
  explicit_nonce_len: 8,
};

pub static TLS_RSA_WITH_AES_256_GCM_SHA384: SupportedCipherSuite = SupportedCipherSuite {
  suite: CipherSuite::TLS_RSA_WITH_AES_256_GCM_SHA384,
  kx: KeyExchangeAlgorithm::RSA,
  sign: SignatureAlgorithm::RSA,
  bulk: BulkAlgorithm::AES_256_GCM,
  hash: HashAlgorithm::SHA384,
  enc_key_len: 32,
  fixed_iv_len: 4,
  mac_key_len: 0,
  explicit_nonce_len: 8,
};

pub static TLS_RSA_WITH_AES_128_CBC_SHA256: SupportedCipherSuite = SupportedCipherSuite {
  suite: CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA256,
  kx: KeyExchangeAlgorithm::RSA,
  sign: SignatureAlgorithm::RSA,
  bulk: BulkAlgorithm::AES_128_CBC,
  hash: HashAlgorithm::SHA256,
  enc_key_len: 16,
  fixed_iv_len: 16,
  mac_key_len: 32,
  explicit_nonce_len: 0,
};

pub static TLS_DHE_RSA_WITH_AES_128_GCM_SHA256: SupportedCipherSuite = SupportedCipherSuite {
  suite: CipherSuite::TLS_DHE_RSA_WITH_AES_128_GCM_SHA256,
  kx: KeyExchangeAlgorithm::DHE,
  sign: SignatureAlgorithm::RSA,
  bulk: BulkAlgorithm::AES_128_GCM,
  hash: HashAlgorithm::SHA256,
  enc_key_len: 16,
  fixed_iv_len: 4,
  mac_key_len: 0,
  explicit_nonce_len: 8,
};

pub static TLS_PSK_WITH_AES_128_GCM_SHA256: SupportedCipherSuite = SupportedCipherSuite {
  suite: CipherSuite::TLS_PSK_WITH_AES_128_GCM_SHA256,
  kx: KeyExchangeAlgorithm::PSK,
  sign: SignatureAlgorithm::Anonymous,
  bulk: BulkAlgorithm::AES_128_GCM,
  hash: HashAlgorithm::SHA256,
  enc_key_len: 16,
  fixed_iv_len: 4,
  mac_key_len: 0,
  explicit_nonce_len: 8,
};

pub static TLS_DHE_PSK_WITH_AES_128_GCM_SHA256: SupportedCipherSuite = SupportedCipherSuite {
  suite: CipherSuite::TLS_DHE_PSK_WITH_AES_128_GCM_SHA256,
  kx: KeyExchangeAlgorithm::DHE_PSK,
  sign: SignatureAlgorithm::Anonymous,
  bulk: BulkAlgorithm::AES_128_GCM,
  hash: HashAlgorithm::SHA256,
  enc_key_len: 16,
  fixed_iv_len: 4,
  mac_key_len: 0,
  explicit_nonce_len: 8,
};

pub static TLS_RSA_PSK_WITH_AES_128_GCM_SHA256: SupportedCipherSuite = SupportedCipherSuite {
  suite: CipherSuite::TLS_RSA_PSK_WITH_AES_128_GCM_SHA256,
  kx: KeyExchangeAlgorithm::RSA_PSK,
  sign: SignatureAlgorithm::RSA,
  bulk: BulkAlgorithm::AES_128_GCM,
  hash: HashAlgorithm::SHA256,
  enc_key_len: 16,
  fixed_iv_len: 4,
  mac_key_len: 0,
  explicit_nonce_len: 8,
};

pub static TLS_ECDHE_PSK_WITH_AES_128_CBC_SHA256: SupportedCipherSuite = SupportedCipherSuite {
  suite: CipherSuite::TLS_ECDHE_PSK_WITH_AES_128_CBC_SHA256,
  kx: KeyExchangeAlgorithm::ECDHE_PSK,
  sign: SignatureAlgorithm::Anonymous,
  bulk: BulkAlgorithm::AES_128_CBC,
  hash: HashAlgorithm::SHA256,
  enc_key_len: 16,
  fixed_iv_len: 16,
  mac_key_len: 32,
  explicit_nonce_len: 0,
};

pub static TLCP_ECC_SM4_128_CBC_SM3: SupportedCipherSuite = SupportedCipherSuite {
  suite: CipherSuite::TLCP_ECC_SM4_128_CBC_SM3,
  kx: KeyExchangeAlgorithm::ECC_TLCP,
  sign: SignatureAlgorithm::SM2,
  bulk: BulkAlgorithm::SM4_CBC,
  hash: HashAlgorithm::SM3,
  enc_key_len: 16,
  fixed_iv_len: 16,
  mac_key_len: 32,
  explicit_nonce_len: 0,
};

pub static TLCP_ECC_SM4_128_GCM_SM3: SupportedCipherSuite = SupportedCipherSuite {
  suite: CipherSuite::TLCP_ECC_SM4_128_GCM_SM3,
  kx: KeyExchangeAlgorithm::ECC_TLCP,
  sign: SignatureAlgorithm::SM2,
  bulk: BulkAlgorithm::SM4_GCM,
  hash: HashAlgorithm::SM3,
  enc_key_len: 16,
  fixed_iv_len: 4,
  mac_key_len: 0,
  explicit_nonce_len: 8,
};

/// Every suite this library knows, most preferred first.
pub static ALL_CIPHERSUITES: [&SupportedCipherSuite; 18] = [
  // TLS 1.3 suites
  &TLS13_AES_256_GCM_SHA384,
  &TLS13_AES_128_GCM_SHA256,
  &TLS13_CHACHA20_POLY1305_SHA256,
  // TLS 1.2 suites
  &TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
  &TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
  &TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
  &TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
  &TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
  &TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
  &TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256,
  &TLS_DHE_RSA_WITH_AES_128_GCM_SHA256,
  &TLS_RSA_WITH_AES_256_GCM_SHA384,
  &TLS_RSA_WITH_AES_128_GCM_SHA256,
  &TLS_RSA_WITH_AES_128_CBC_SHA256,
  &TLS_ECDHE_PSK_WITH_AES_128_CBC_SHA256,
  &TLS_DHE_PSK_WITH_AES_128_GCM_SHA256,
  &TLS_PSK_WITH_AES_128_GCM_SHA256,
  // RSA_PSK deliberately not in the default set; opt in via config.
  &TLS_RSA_PSK_WITH_AES_128_GCM_SHA256,
];

pub fn lookup(suite: CipherSuite) -> Option<&'static SupportedCipherSuite> {
  ALL_CIPHERSUITES.iter().find(|scs| scs.suite == suite).copied()
}

/// Default ≤1.2 suite list.
pub fn default_tls12_suites() -> Vec<&'static SupportedCipherSuite> {
  ALL_CIPHERSUITES
    .iter()
    .filter(|scs| !scs.is_tls13() && !scs.is_tlcp() && !scs.kx.is_psk())
    .copied()
    .collect()
}

/// Default TLS 1.3 suite list.
pub fn default_tls13_suites() -> Vec<&'static SupportedCipherSuite> {
  ALL_CIPHERSUITES
    .iter()
    .filter(|scs| scs.is_tls13())
    .copied()
    .collect()
}

/// Default TLCP suite list.
pub fn default_tlcp_suites() -> Vec<&'static SupportedCipherSuite> {
  vec![&TLCP_ECC_SM4_128_CBC_SM3, &TLCP_ECC_SM4_128_GCM_SM3]
}

/* These are both O(N^2)! */
pub fn choose_ciphersuite_preferring_client(
  client_suites: &[CipherSuite],
  server_suites: &[&'static SupportedCipherSuite],
) -> Option<&'static SupportedCipherSuite> {
  for client_suite in client_suites {
    if let Some(selected) = server_suites.iter().find(|x| *client_suite == x.suite) {
      return Some(*selected);
    }
  }

  None
}

pub fn choose_ciphersuite_preferring_server(
  client_suites: &[CipherSuite],
  server_suites: &[&'static SupportedCipherSuite],
) -> Option<&'static SupportedCipherSuite> {
  server_suites
    .iter()
    .find(|x| client_suites.contains(&x.suite))
    .copied()
}

/// Return a list of the ciphersuites in `all` with the suites
/// incompatible with SignatureAlgorithm `sigalg` removed.  Suites that
/// authenticate without a certificate survive unconditionally.
pub fn reduce_given_sigalg(
  all: &[&'static SupportedCipherSuite],
  sigalg: SignatureAlgorithm,
) -> Vec<&'static SupportedCipherSuite> {
  all
    .iter()
    .filter(|&&suite| suite.sign == SignatureAlgorithm::Anonymous || suite.sign == sigalg)
    .copied()
    .collect()
}

/// Restrict `all` to suites usable at `version`.
pub fn reduce_given_version(
  all: &[&'static SupportedCipherSuite],
  version: ProtocolVersion,
) -> Vec<&'static SupportedCipherSuite> {
  all
    .iter()
    .filter(|suite| suite.usable_for_version(version))
    .copied()
    .collect()
}

#[cfg(test)]
mod test {
  use crate::msgs::enums::{CipherSuite, HashAlgorithm, ProtocolVersion};

  #[test]
  fn test_client_pref() {
    let client = vec![
      CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
      CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    ];
    let server = vec![
      &super::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
      &super::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    ];
    let chosen = super::choose_ciphersuite_preferring_client(&client, &server);
    assert_eq!(chosen, Some(&super::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256));
  }

  #[test]
  fn test_server_pref() {
    let client = vec![
      CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
      CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    ];
    let server = vec![
      &super::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
      &super::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    ];
    let chosen = super::choose_ciphersuite_preferring_server(&client, &server);
    assert_eq!(chosen, Some(&super::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384));
  }

  #[test]
  fn version_partitions() {
    for suite in super::ALL_CIPHERSUITES.iter() {
      let tls13 = suite.usable_for_version(ProtocolVersion::TLSv1_3);
      let tls12 = suite.usable_for_version(ProtocolVersion::TLSv1_2);
      assert!(tls13 != tls12 || suite.is_tlcp());
    }

    assert!(super::TLCP_ECC_SM4_128_CBC_SM3.usable_for_version(ProtocolVersion::TLCPv1_1));
    assert!(!super::TLCP_ECC_SM4_128_CBC_SM3.usable_for_version(ProtocolVersion::TLSv1_2));
  }

  #[test]
  fn tls13_resumption_needs_same_hash() {
    assert_eq!(
      super::TLS13_AES_128_GCM_SHA256.get_hash(),
      HashAlgorithm::SHA256
    );
    assert_eq!(
      super::TLS13_AES_256_GCM_SHA384.get_hash(),
      HashAlgorithm::SHA384
    );
  }

  #[test]
  fn key_block_lengths() {
    // CBC-SHA256: 2 * (32 mac + 16 key + 16 iv)
    assert_eq!(super::TLS_RSA_WITH_AES_128_CBC_SHA256.key_block_len(), 128);
    // GCM: 2 * (16 key + 4 iv) + 8 explicit nonce
    assert_eq!(super::TLS_RSA_WITH_AES_128_GCM_SHA256.key_block_len(), 48);
  }
}
