use crate::error::Error;
use crate::msgs::enums::{NamedGroup, ProtocolVersion};
use crate::msgs::handshake::{ServerDHParams, ServerECDHParams};
use crate::provider::{ActiveKeyExchange, CryptoProvider};

use zeroize::Zeroize;

/// RFC 7919 ffdhe2048 prime; generator is 2.
pub const FFDHE2048_P: [u8; 256] = [
  0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xad, 0xf8, 0x54, 0x58, 0xa2, 0xbb, 0x4a, 0x9a,
  0xaf, 0xdc, 0x56, 0x20, 0x27, 0x3d, 0x3c, 0xf1, 0xd8, 0xb9, 0xc5, 0x83, 0xce, 0x2d, 0x36, 0x95,
  0xa9, 0xe1, 0x36, 0x41, 0x14, 0x64, 0x33, 0xfb, 0xcc, 0x93, 0x9d, 0xce, 0x24, 0x9b, 0x3e, 0xf9,
  0x7d, 0x2f, 0xe3, 0x63, 0x63, 0x0c, 0x75, 0xd8, 0xf6, 0x81, 0xb2, 0x02, 0xae, 0xc4, 0x61, 0x7a,
  0xd3, 0xdf, 0x1e, 0xd5, 0xd5, 0xfd, 0x65, 0x61, 0x24, 0x33, 0xf5, 0x1f, 0x5f, 0x06, 0x6e, 0xd0,
  0x85, 0x63, 0x65, 0x55, 0x3d, 0xed, 0x1a, 0xf3, 0xb5, 0x57, 0x13, 0x5e, 0x7f, 0x57, 0xc9, 0x35,
  0x98, 0x4f, 0x0c, 0x70, 0xe0, 0xe6, 0x8b, 0x77, 0xe2, 0xa6, 0x89, 0xda, 0xf3, 0xef, 0xe8, 0x72,
  0x1d, 0xf1, 0x58, 0xa1, 0x36, 0xad, 0xe7, 0x35, 0x30, 0xac, 0xca, 0x4f, 0x48, 0x3a, 0x79, 0x7a,
  0xbc, 0x0a, 0xb1, 0x82, 0xb3, 0x24, 0xfb, 0x61, 0xd1, 0x08, 0xa9, 0x4b, 0xb2, 0xc8, 0xe3, 0xfb,
  0xb9, 0x6a, 0xda, 0xb7, 0x60, 0xd7, 0xf4, 0x68, 0x1d, 0x4f, 0x42, 0xa3, 0xde, 0x39, 0x4d, 0xf4,
  0xae, 0x56, 0xed, 0xe7, 0x63, 0x72, 0xbb, 0x19, 0x0b, 0x07, 0xa7, 0xc8, 0xee, 0x0a, 0x6d, 0x70,
  0x9e, 0x02, 0xfc, 0xe1, 0xcd, 0xf7, 0xe2, 0xec, 0xc0, 0x34, 0x04, 0xcd, 0x28, 0x34, 0x2f, 0x61,
  0x91, 0x72, 0xfe, 0x9c, 0xe9, 0x85, 0x83, 0xff, 0x8e, 0x4f, 0x12, 0x32, 0xee, 0xf2, 0x81, 0x83,
  0xc3, 0xfe, 0x3b, 0x1b, 0x4c, 0x6f, 0xad, 0x73, 0x3b, 0xb5, 0xfc, 0xbc, 0x2e, 0xc2, 0x20, 0x05,
  0xc5, 0x8e, 0xf1, 0x83, 0x7d, 0x16, 0x83, 0xb2, 0xc6, 0xf3, 0x4a, 0x26, 0xc1, 0xb2, 0xef, 0xfa,
  0x88, 0x6b, 0x42, 0x38, 0x61, 0x28, 0x5c, 0x97, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

pub const FFDHE_G: [u8; 1] = [2];

/// The wire parameters a server advertises for a finite-field group.
pub fn ffdhe_params(group: NamedGroup) -> Option<(&'static [u8], &'static [u8])> {
  match group {
    NamedGroup::FFDHE2048 => Some((&FFDHE2048_P, &FFDHE_G)),
    _ => None,
  }
}

/// Recognise explicit DH parameters as one of our named groups.  Anything
/// else is refused: ad-hoc primes are not negotiable.
pub fn group_for_ffdhe_params(params: &ServerDHParams) -> Option<NamedGroup> {
  if params.dh_g.0 == FFDHE_G && params.dh_p.0 == FFDHE2048_P {
    Some(NamedGroup::FFDHE2048)
  } else {
    None
  }
}

/// The result of a completed key exchange: our public half and the agreed
/// secret.
pub struct KeyExchangeResult {
  pub pubkey: Vec<u8>,
  pub shared_secret: Vec<u8>,
}

impl Drop for KeyExchangeResult {
  fn drop(&mut self) {
    self.shared_secret.zeroize();
  }
}

/// Start an ephemeral exchange on `group`.
pub fn start_kx(
  provider: &dyn CryptoProvider,
  group: NamedGroup,
) -> Result<Box<dyn ActiveKeyExchange>, Error> {
  provider
    .start_kx(group)
    .map_err(|_| Error::HandshakeFailure("unsupported key exchange group"))
}

/// Complete an exchange against the peer's public value.
pub fn complete_kx(
  kx: Box<dyn ActiveKeyExchange>,
  peer_public: &[u8],
) -> Result<KeyExchangeResult, Error> {
  let pubkey = kx.pub_key().to_vec();
  let shared_secret = kx
    .complete(peer_public)
    .map_err(|_| Error::PeerMisbehaved("key exchange failed"))?;

  Ok(KeyExchangeResult {
    pubkey,
    shared_secret,
  })
}

/// Client ECDHE against a ServerKeyExchange's parameters.
pub fn client_ecdhe(
  provider: &dyn CryptoProvider,
  params: &ServerECDHParams,
) -> Result<KeyExchangeResult, Error> {
  let kx = start_kx(provider, params.curve_params.named_group)?;
  complete_kx(kx, &params.public.0)
}

/// Client DHE against a ServerKeyExchange's explicit parameters.
pub fn client_dhe(
  provider: &dyn CryptoProvider,
  params: &ServerDHParams,
) -> Result<KeyExchangeResult, Error> {
  let group = group_for_ffdhe_params(params)
    .ok_or(Error::IllegalParameter("unrecognised DH parameters"))?;
  let kx = start_kx(provider, group)?;
  complete_kx(kx, &params.dh_ys.0)
}

/// A key-transport premaster: 48 bytes, leading with the offered
/// protocol version.  Used by RSA key exchange and TLCP ECC.
pub fn transport_premaster(
  provider: &dyn CryptoProvider,
  version: ProtocolVersion,
) -> Result<Vec<u8>, Error> {
  let mut premaster = vec![0u8; 48];
  provider.random(&mut premaster)?;
  let v = version.get_u16().to_be_bytes();
  premaster[0] = v[0];
  premaster[1] = v[1];
  Ok(premaster)
}

/// RFC 4279 §2 premaster composition for the PSK family:
/// `len(other) || other || len(psk) || psk`.  For plain PSK, `other` is
/// a string of zeroes as long as the PSK.
pub fn psk_premaster(other_secret: &[u8], psk: &[u8]) -> Vec<u8> {
  let mut premaster = Vec::with_capacity(4 + other_secret.len() + psk.len());
  premaster.extend_from_slice(&(other_secret.len() as u16).to_be_bytes());
  premaster.extend_from_slice(other_secret);
  premaster.extend_from_slice(&(psk.len() as u16).to_be_bytes());
  premaster.extend_from_slice(psk);
  premaster
}

/// Plain-PSK premaster: the "other secret" is zeroes the length of the
/// PSK.
pub fn plain_psk_premaster(psk: &[u8]) -> Vec<u8> {
  let zeroes = vec![0u8; psk.len()];
  psk_premaster(&zeroes, psk)
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::msgs::base::PayloadU16;

  #[test]
  fn psk_premaster_layout() {
    let pm = psk_premaster(b"ab", b"key!");
    assert_eq!(pm, b"\x00\x02ab\x00\x04key!");

    let plain = plain_psk_premaster(b"key!");
    assert_eq!(plain, b"\x00\x04\x00\x00\x00\x00\x00\x04key!");
  }

  #[test]
  fn ffdhe_params_round_trip() {
    let (p, g) = ffdhe_params(NamedGroup::FFDHE2048).unwrap();
    let params = ServerDHParams {
      dh_p: PayloadU16::new(p.to_vec()),
      dh_g: PayloadU16::new(g.to_vec()),
      dh_ys: PayloadU16::new(vec![1; 256]),
    };
    assert_eq!(group_for_ffdhe_params(&params), Some(NamedGroup::FFDHE2048));

    let mut wrong = params;
    wrong.dh_p.0[0] ^= 1;
    assert_eq!(group_for_ffdhe_params(&wrong), None);
  }

  #[test]
  fn transport_premaster_carries_version() {
    let provider = crate::provider::RingProvider::new();
    let pm = transport_premaster(&provider, ProtocolVersion::TLSv1_2).unwrap();
    assert_eq!(pm.len(), 48);
    assert_eq!(&pm[..2], &[0x03, 0x03]);

    let tlcp = transport_premaster(&provider, ProtocolVersion::TLCPv1_1).unwrap();
    assert_eq!(&tlcp[..2], &[0x01, 0x01]);
  }
}
