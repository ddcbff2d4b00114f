//! Per-extension negotiation policy, consulted by both state machines.
//! These are pure functions over parsed hellos and configuration; the
//! state machines turn failures into alerts.

use crate::error::Error;
use crate::msgs::enums::{NamedGroup, ProtocolVersion, SignatureScheme};
use crate::msgs::handshake::{ClientHelloPayload, KeyShareEntry};
use crate::util;

/// The configured `{min, max}` version window.
///
/// Versions order TLCP 1.1 < TLS 1.2 < TLS 1.3; DTLS 1.2 lives in its
/// own datagram family and pairs with a window of exactly itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VersionRange {
  pub min: ProtocolVersion,
  pub max: ProtocolVersion,
}

fn rank(v: ProtocolVersion) -> Option<u8> {
  match v {
    ProtocolVersion::TLCPv1_1 => Some(1),
    ProtocolVersion::TLSv1_2 | ProtocolVersion::DTLSv1_2 => Some(2),
    ProtocolVersion::TLSv1_3 => Some(3),
    _ => None,
  }
}

impl VersionRange {
  pub fn new(min: ProtocolVersion, max: ProtocolVersion) -> VersionRange {
    VersionRange { min, max }
  }

  pub fn single(v: ProtocolVersion) -> VersionRange {
    VersionRange { min: v, max: v }
  }

  pub fn contains(&self, v: ProtocolVersion) -> bool {
    if self.min.is_datagram() || self.max.is_datagram() || v.is_datagram() {
      return v == self.min && v == self.max;
    }

    match (rank(self.min), rank(self.max), rank(v)) {
      (Some(lo), Some(hi), Some(x)) => lo <= x && x <= hi,
      _ => false,
    }
  }
}

/// Server-side version selection.
///
/// A `supported_versions` extension, when present, entirely replaces the
/// legacy version field.  TLS 1.3 may only be selected when the server
/// can actually authenticate there (`can_do_tls13`: a usable certificate
/// or an acceptable PSK); otherwise selection falls back to the best
/// mutual lesser version.
pub fn select_version(
  hello: &ClientHelloPayload,
  local: VersionRange,
  can_do_tls13: bool,
) -> Result<ProtocolVersion, Error> {
  if let Some(offered) = hello.get_versions_extension() {
    let mut best: Option<ProtocolVersion> = None;
    for v in offered {
      if !local.contains(*v) {
        continue;
      }
      if *v == ProtocolVersion::TLSv1_3 && !can_do_tls13 {
        continue;
      }
      match best {
        Some(b) if rank(*v) <= rank(b) => (),
        _ => best = Some(*v),
      }
    }

    return match best {
      Some(v) => Ok(v),
      // they only offered 1.3 and we cannot authenticate there
      None if offered.contains(&ProtocolVersion::TLSv1_3) => {
        Err(Error::HandshakeFailure("cannot satisfy a TLS 1.3-only client"))
      }
      None => Err(Error::ProtocolVersion),
    };
  }

  // Legacy selection: the client names its ceiling.
  let offered = hello.client_version;
  let candidate = match offered {
    ProtocolVersion::DTLSv1_2 => ProtocolVersion::DTLSv1_2,
    ProtocolVersion::TLCPv1_1 => ProtocolVersion::TLCPv1_1,
    // 1.3 never negotiates via the legacy field
    v if rank(v) >= rank(ProtocolVersion::TLSv1_2) => ProtocolVersion::TLSv1_2,
    _ => return Err(Error::ProtocolVersion),
  };

  if local.contains(candidate) {
    Ok(candidate)
  } else {
    Err(Error::ProtocolVersion)
  }
}

/// `key_share` sanity (RFC 8446 §9.2): a non-empty key_share requires
/// `supported_groups`, and every share must name an offered group.
pub fn check_key_shares(
  shares: &[KeyShareEntry],
  groups: Option<&[NamedGroup]>,
) -> Result<(), Error> {
  if shares.is_empty() {
    return Ok(());
  }

  let groups = match groups {
    Some(groups) => groups,
    None => {
      return Err(Error::MissingExtension(
        "key_share without supported_groups",
      ))
    }
  };

  for share in shares {
    if !groups.contains(&share.group) {
      return Err(Error::IllegalParameter(
        "key_share group not in supported_groups",
      ));
    }
  }

  Ok(())
}

/// Server-side group choice: our preference order over their offers.
pub fn choose_group(ours: &[NamedGroup], theirs: &[NamedGroup]) -> Option<NamedGroup> {
  util::first_in_both(ours, theirs)
}

/// Signature-scheme choice, optionally honouring server preference.
pub fn choose_sig_scheme(
  ours: &[SignatureScheme],
  theirs: &[SignatureScheme],
  prefer_ours: bool,
) -> Option<SignatureScheme> {
  if prefer_ours {
    util::first_in_both(ours, theirs)
  } else {
    util::first_in_both(theirs, ours)
  }
}

/// Secure renegotiation, initial handshake: `renegotiation_info`, if
/// present, must be empty.
pub fn check_initial_renegotiation_info(info: Option<&[u8]>) -> Result<(), Error> {
  match info {
    Some(bytes) if !bytes.is_empty() => Err(Error::HandshakeFailure(
      "non-empty renegotiation_info on initial handshake",
    )),
    _ => Ok(()),
  }
}

/// Secure renegotiation, later handshakes: the extension must be present
/// and equal the stored verify_data; an SCSV here is fatal.
pub fn check_renegotiation_info(
  info: Option<&[u8]>,
  scsv_offered: bool,
  expected: &[u8],
) -> Result<(), Error> {
  if scsv_offered {
    return Err(Error::HandshakeFailure("SCSV during renegotiation"));
  }

  match info {
    Some(bytes) if bytes == expected => Ok(()),
    Some(_) => Err(Error::HandshakeFailure(
      "renegotiation_info does not match stored verify data",
    )),
    None => Err(Error::HandshakeFailure(
      "renegotiation without renegotiation_info",
    )),
  }
}

/// Extended-master-secret stickiness: once a connection or the session
/// being resumed uses EMS, a hello without EMS is fatal.
pub fn check_ems_continuity(previous_ems: bool, offered_ems: bool) -> Result<(), Error> {
  if previous_ems && !offered_ems {
    Err(Error::HandshakeFailure(
      "peer attempted extended-master-secret downgrade",
    ))
  } else {
    Ok(())
  }
}

/// Encrypt-then-MAC stickiness on renegotiation.
pub fn check_etm_continuity(previous_etm: bool, offered_etm: bool) -> Result<(), Error> {
  if previous_etm && !offered_etm {
    Err(Error::HandshakeFailure(
      "peer attempted encrypt-then-MAC downgrade",
    ))
  } else {
    Ok(())
  }
}

/// On resumption the fresh SNI must equal the stored one,
/// case-insensitively.
pub fn check_resumption_sni(current: Option<&str>, stored: &[u8]) -> Result<(), Error> {
  if stored.is_empty() {
    return Ok(());
  }

  match current {
    Some(name) if util::eq_ignore_ascii_case(name.as_bytes(), stored) => Ok(()),
    _ => Err(Error::HandshakeFailure("SNI changed across resumption")),
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::msgs::enums::{CipherSuite, Compression};
  use crate::msgs::handshake::{ClientExtension, Random, SessionID};

  fn hello(
    legacy: ProtocolVersion,
    versions: Option<Vec<ProtocolVersion>>,
  ) -> ClientHelloPayload {
    let mut extensions = Vec::new();
    if let Some(versions) = versions {
      extensions.push(ClientExtension::SupportedVersions(versions));
    }
    ClientHelloPayload {
      client_version: legacy,
      random: Random([0; 32]),
      session_id: SessionID::empty(),
      cookie: None,
      cipher_suites: vec![CipherSuite::TLS13_AES_128_GCM_SHA256],
      compression_methods: vec![Compression::Null],
      extensions,
    }
  }

  #[test]
  fn supported_versions_overrides_legacy_field() {
    let range = VersionRange::new(ProtocolVersion::TLSv1_2, ProtocolVersion::TLSv1_3);

    // legacy field lies low, extension offers 1.3
    let h = hello(
      ProtocolVersion::TLSv1_2,
      Some(vec![ProtocolVersion::TLSv1_3]),
    );
    assert_eq!(select_version(&h, range, true), Ok(ProtocolVersion::TLSv1_3));
  }

  #[test]
  fn tls13_needs_authentication_material() {
    let range = VersionRange::new(ProtocolVersion::TLSv1_2, ProtocolVersion::TLSv1_3);

    let both = hello(
      ProtocolVersion::TLSv1_2,
      Some(vec![ProtocolVersion::TLSv1_3, ProtocolVersion::TLSv1_2]),
    );
    assert_eq!(
      select_version(&both, range, false),
      Ok(ProtocolVersion::TLSv1_2)
    );

    let only13 = hello(
      ProtocolVersion::TLSv1_2,
      Some(vec![ProtocolVersion::TLSv1_3]),
    );
    assert!(matches!(
      select_version(&only13, range, false),
      Err(Error::HandshakeFailure(_))
    ));
  }

  #[test]
  fn legacy_selection() {
    let range = VersionRange::single(ProtocolVersion::TLSv1_2);
    let h = hello(ProtocolVersion::TLSv1_2, None);
    assert_eq!(select_version(&h, range, true), Ok(ProtocolVersion::TLSv1_2));

    let tlcp = hello(ProtocolVersion::TLCPv1_1, None);
    assert_eq!(select_version(&tlcp, range, true), Err(Error::ProtocolVersion));
    assert_eq!(
      select_version(&tlcp, VersionRange::single(ProtocolVersion::TLCPv1_1), true),
      Ok(ProtocolVersion::TLCPv1_1)
    );
  }

  #[test]
  fn key_share_subset_rule() {
    let shares = vec![KeyShareEntry::new(NamedGroup::X25519, &[1; 32])];

    assert!(check_key_shares(&shares, Some(&[NamedGroup::X25519])).is_ok());
    assert!(matches!(
      check_key_shares(&shares, Some(&[NamedGroup::secp256r1])),
      Err(Error::IllegalParameter(_))
    ));
    assert!(matches!(
      check_key_shares(&shares, None),
      Err(Error::MissingExtension(_))
    ));
    assert!(check_key_shares(&[], None).is_ok());
  }

  #[test]
  fn renegotiation_info_rules() {
    assert!(check_initial_renegotiation_info(None).is_ok());
    assert!(check_initial_renegotiation_info(Some(b"")).is_ok());
    assert!(check_initial_renegotiation_info(Some(b"x")).is_err());

    assert!(check_renegotiation_info(Some(b"vd"), false, b"vd").is_ok());
    assert!(check_renegotiation_info(Some(b"other"), false, b"vd").is_err());
    assert!(check_renegotiation_info(None, false, b"vd").is_err());
    assert!(check_renegotiation_info(Some(b"vd"), true, b"vd").is_err());
  }

  #[test]
  fn stickiness_rules() {
    assert!(check_ems_continuity(true, true).is_ok());
    assert!(check_ems_continuity(false, false).is_ok());
    assert!(check_ems_continuity(false, true).is_ok());
    assert!(check_ems_continuity(true, false).is_err());

    assert!(check_etm_continuity(true, false).is_err());
  }

  #[test]
  fn resumption_sni_is_case_insensitive() {
    assert!(check_resumption_sni(Some("Example.COM"), b"example.com").is_ok());
    assert!(check_resumption_sni(Some("other.com"), b"example.com").is_err());
    assert!(check_resumption_sni(None, b"example.com").is_err());
    assert!(check_resumption_sni(None, b"").is_ok());
  }
}
