use crate::msgs::base::{Payload, PayloadU16, PayloadU24, PayloadU8};
use crate::msgs::codec;
use crate::msgs::codec::{Codec, Reader};
use crate::msgs::enums::ClientCertificateType;
use crate::msgs::enums::ECCurveType;
use crate::msgs::enums::{CipherSuite, Compression, ECPointFormat, ExtensionType};
use crate::msgs::enums::{HandshakeType, ProtocolVersion};
use crate::msgs::enums::{KeyUpdateRequest, NamedGroup, PSKKeyExchangeMode, ServerNameType};
use crate::msgs::enums::{SignatureAlgorithm, SignatureScheme};

use std::collections;

macro_rules! declare_u8_vec(
  ($name:ident, $itemtype:ty) => {
    pub type $name = Vec<$itemtype>;

    impl Codec for $name {
      fn encode(&self, bytes: &mut Vec<u8>) {
        codec::encode_vec_u8(bytes, self);
      }

      fn read(r: &mut Reader) -> Option<$name> {
        codec::read_vec_u8::<$itemtype>(r)
      }
    }
  }
);

macro_rules! declare_u16_vec(
  ($name:ident, $itemtype:ty) => {
    pub type $name = Vec<$itemtype>;

    impl Codec for $name {
      fn encode(&self, bytes: &mut Vec<u8>) {
        codec::encode_vec_u16(bytes, self);
      }

      fn read(r: &mut Reader) -> Option<$name> {
        codec::read_vec_u16::<$itemtype>(r)
      }
    }
  }
);

/// The ServerHello.random value that really means HelloRetryRequest.
pub const HELLO_RETRY_REQUEST_RANDOM: [u8; 32] = [
  0xcf, 0x21, 0xad, 0x74, 0xe5, 0x9a, 0x61, 0x11, 0xbe, 0x1d, 0x8c, 0x02, 0x1e, 0x65, 0xb8, 0x91,
  0xc2, 0xa2, 0x11, 0x16, 0x7a, 0xbb, 0x8c, 0x5e, 0x07, 0x9e, 0x09, 0xe2, 0xc8, 0xa8, 0x33, 0x9c,
];

/// Trailing 8 bytes of ServerHello.random when a TLS 1.3-capable server
/// deliberately negotiates TLS 1.2.
pub const DOWNGRADE_SENTINEL_TLS12: [u8; 8] = [0x44, 0x4f, 0x57, 0x4e, 0x47, 0x52, 0x44, 0x01];

#[derive(Clone, Copy, PartialEq)]
pub struct Random(pub [u8; 32]);

impl std::fmt::Debug for Random {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    write!(f, "Random(..)")
  }
}

impl Codec for Random {
  fn encode(&self, bytes: &mut Vec<u8>) {
    bytes.extend_from_slice(&self.0);
  }

  fn read(r: &mut Reader) -> Option<Random> {
    let bytes = r.take(32)?;
    let mut opaque = [0; 32];
    opaque.clone_from_slice(bytes);
    Some(Random(opaque))
  }
}

impl Random {
  pub fn from_slice(bytes: &[u8]) -> Random {
    let mut rd = Reader::init(bytes);
    Random::read(&mut rd).unwrap()
  }

  pub fn write_slice(&self, bytes: &mut [u8]) {
    bytes.copy_from_slice(&self.0);
  }

  pub fn has_downgrade_sentinel(&self) -> bool {
    self.0[24..] == DOWNGRADE_SENTINEL_TLS12
  }
}

#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct SessionID {
  bytes: Vec<u8>,
}

impl Codec for SessionID {
  fn encode(&self, bytes: &mut Vec<u8>) {
    debug_assert!(self.bytes.len() <= 32);
    bytes.push(self.bytes.len() as u8);
    bytes.extend_from_slice(&self.bytes);
  }

  fn read(r: &mut Reader) -> Option<SessionID> {
    let len = codec::read_u8(r)?;
    if len > 32 {
      return None;
    }

    let bytes = r.take(len as usize)?;
    Some(SessionID {
      bytes: bytes.to_vec(),
    })
  }
}

impl SessionID {
  pub fn new(bytes: &[u8]) -> SessionID {
    debug_assert!(bytes.len() <= 32);
    SessionID {
      bytes: bytes.to_vec(),
    }
  }

  pub fn empty() -> SessionID {
    SessionID { bytes: Vec::new() }
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.bytes
  }

  pub fn len(&self) -> usize {
    self.bytes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bytes.is_empty()
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnknownExtension {
  pub typ: ExtensionType,
  pub payload: Payload,
}

impl UnknownExtension {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.payload.encode(bytes);
  }

  fn read(typ: ExtensionType, r: &mut Reader) -> Option<UnknownExtension> {
    let payload = Payload::read(r)?;
    Some(UnknownExtension { typ, payload })
  }
}

declare_u8_vec!(ECPointFormatList, ECPointFormat);

pub trait SupportedPointFormats {
  fn supported() -> ECPointFormatList;
}

impl SupportedPointFormats for ECPointFormatList {
  fn supported() -> ECPointFormatList {
    vec![ECPointFormat::Uncompressed]
  }
}

declare_u16_vec!(NamedGroups, NamedGroup);
declare_u16_vec!(SupportedSignatureSchemes, SignatureScheme);

pub trait DecomposedSignatureScheme {
  fn sign(&self) -> SignatureAlgorithm;
}

impl DecomposedSignatureScheme for SignatureScheme {
  fn sign(&self) -> SignatureAlgorithm {
    match *self {
      SignatureScheme::RSA_PKCS1_SHA1
      | SignatureScheme::RSA_PKCS1_SHA256
      | SignatureScheme::RSA_PKCS1_SHA384
      | SignatureScheme::RSA_PKCS1_SHA512
      | SignatureScheme::RSA_PSS_SHA256
      | SignatureScheme::RSA_PSS_SHA384
      | SignatureScheme::RSA_PSS_SHA512 => SignatureAlgorithm::RSA,
      SignatureScheme::ECDSA_SHA1_Legacy
      | SignatureScheme::ECDSA_NISTP256_SHA256
      | SignatureScheme::ECDSA_NISTP384_SHA384
      | SignatureScheme::ECDSA_NISTP521_SHA512 => SignatureAlgorithm::ECDSA,
      SignatureScheme::ED25519 => SignatureAlgorithm::ED25519,
      SignatureScheme::SM2SIG_SM3 => SignatureAlgorithm::SM2,
      _ => SignatureAlgorithm::Unknown(0),
    }
  }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ServerNamePayload {
  HostName(String),
  Unknown(Payload),
}

impl ServerNamePayload {
  fn read_hostname(r: &mut Reader) -> Option<ServerNamePayload> {
    let len = codec::read_u16(r)? as usize;
    let name = r.take(len)?;

    String::from_utf8(name.to_vec())
      .ok()
      .map(ServerNamePayload::HostName)
  }

  fn encode_hostname(name: &str, bytes: &mut Vec<u8>) {
    codec::encode_u16(name.len() as u16, bytes);
    bytes.extend_from_slice(name.as_bytes());
  }

  fn encode(&self, bytes: &mut Vec<u8>) {
    match *self {
      ServerNamePayload::HostName(ref r) => ServerNamePayload::encode_hostname(r, bytes),
      ServerNamePayload::Unknown(ref r) => r.encode(bytes),
    }
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServerName {
  pub typ: ServerNameType,
  pub payload: ServerNamePayload,
}

impl Codec for ServerName {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.typ.encode(bytes);
    self.payload.encode(bytes);
  }

  fn read(r: &mut Reader) -> Option<ServerName> {
    let typ = ServerNameType::read(r)?;

    let payload = match typ {
      ServerNameType::HostName => ServerNamePayload::read_hostname(r)?,
      _ => ServerNamePayload::Unknown(Payload::read(r)?),
    };

    Some(ServerName { typ, payload })
  }
}

declare_u16_vec!(ServerNameRequest, ServerName);

pub type ProtocolName = PayloadU8;
declare_u16_vec!(ProtocolNameList, ProtocolName);

pub trait ConvertProtocolNameList {
  fn from_slices(names: &[&[u8]]) -> Self;
  fn to_vecs(&self) -> Vec<Vec<u8>>;
  fn to_single_vec(&self) -> Option<Vec<u8>>;
}

impl ConvertProtocolNameList for ProtocolNameList {
  fn from_slices(names: &[&[u8]]) -> ProtocolNameList {
    names
      .iter()
      .map(|name| PayloadU8::new(name.to_vec()))
      .collect()
  }

  fn to_vecs(&self) -> Vec<Vec<u8>> {
    self.iter().map(|p| p.0.clone()).collect()
  }

  fn to_single_vec(&self) -> Option<Vec<u8>> {
    if self.len() == 1 {
      Some(self[0].0.clone())
    } else {
      None
    }
  }
}

// -- TLS 1.3 key shares --
#[derive(Clone, Debug, PartialEq)]
pub struct KeyShareEntry {
  pub group: NamedGroup,
  pub payload: PayloadU16,
}

impl KeyShareEntry {
  pub fn new(group: NamedGroup, payload: &[u8]) -> KeyShareEntry {
    KeyShareEntry {
      group,
      payload: PayloadU16::new(payload.to_vec()),
    }
  }
}

impl Codec for KeyShareEntry {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.group.encode(bytes);
    self.payload.encode(bytes);
  }

  fn read(r: &mut Reader) -> Option<KeyShareEntry> {
    let group = NamedGroup::read(r)?;
    let payload = PayloadU16::read(r)?;

    Some(KeyShareEntry { group, payload })
  }
}

declare_u16_vec!(KeyShareEntries, KeyShareEntry);
declare_u8_vec!(ProtocolVersions, ProtocolVersion);
declare_u8_vec!(PSKKeyExchangeModes, PSKKeyExchangeMode);

// -- TLS 1.3 pre-shared keys --
#[derive(Clone, Debug, PartialEq)]
pub struct PresharedKeyIdentity {
  pub identity: PayloadU16,
  pub obfuscated_ticket_age: u32,
}

impl PresharedKeyIdentity {
  pub fn new(id: Vec<u8>, age: u32) -> PresharedKeyIdentity {
    PresharedKeyIdentity {
      identity: PayloadU16::new(id),
      obfuscated_ticket_age: age,
    }
  }
}

impl Codec for PresharedKeyIdentity {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.identity.encode(bytes);
    codec::encode_u32(self.obfuscated_ticket_age, bytes);
  }

  fn read(r: &mut Reader) -> Option<PresharedKeyIdentity> {
    Some(PresharedKeyIdentity {
      identity: PayloadU16::read(r)?,
      obfuscated_ticket_age: codec::read_u32(r)?,
    })
  }
}

declare_u16_vec!(PresharedKeyIdentities, PresharedKeyIdentity);
pub type PresharedKeyBinder = PayloadU8;
// nb. not declare_u16_vec: that would collide with ProtocolNameList's
// Codec impl, both being Vec<PayloadU8>.
pub type PresharedKeyBinders = Vec<PresharedKeyBinder>;

#[derive(Clone, Debug, PartialEq)]
pub struct PresharedKeyOffer {
  pub identities: PresharedKeyIdentities,
  pub binders: PresharedKeyBinders,
}

impl PresharedKeyOffer {
  pub fn new(id: PresharedKeyIdentity, binder: Vec<u8>) -> PresharedKeyOffer {
    PresharedKeyOffer {
      identities: vec![id],
      binders: vec![PresharedKeyBinder::new(binder)],
    }
  }

  /// Length of the binders vector on the wire, including its u16 length
  /// prefix.  The truncated ClientHello used for binder computation is the
  /// full encoding minus this many trailing bytes.
  pub fn binders_encoded_len(&self) -> usize {
    2 + self.binders.iter().map(|b| 1 + b.0.len()).sum::<usize>()
  }
}

impl Codec for PresharedKeyOffer {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.identities.encode(bytes);
    codec::encode_vec_u16(bytes, &self.binders);
  }

  fn read(r: &mut Reader) -> Option<PresharedKeyOffer> {
    Some(PresharedKeyOffer {
      identities: PresharedKeyIdentities::read(r)?,
      binders: codec::read_vec_u16::<PresharedKeyBinder>(r)?,
    })
  }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ClientExtension {
  ECPointFormats(ECPointFormatList),
  NamedGroups(NamedGroups),
  SignatureAlgorithms(SupportedSignatureSchemes),
  ServerName(ServerNameRequest),
  SessionTicketRequest,
  SessionTicketOffer(Payload),
  Protocols(ProtocolNameList),
  SupportedVersions(ProtocolVersions),
  KeyShare(KeyShareEntries),
  PresharedKeyModes(PSKKeyExchangeModes),
  PresharedKey(PresharedKeyOffer),
  Cookie(PayloadU16),
  ExtendedMasterSecretRequest,
  EncryptThenMacRequest,
  RenegotiationInfo(PayloadU8),
  PostHandshakeAuth,
  EarlyData,
  Unknown(UnknownExtension),
}

impl ClientExtension {
  pub fn get_type(&self) -> ExtensionType {
    match *self {
      ClientExtension::ECPointFormats(_) => ExtensionType::ECPointFormats,
      ClientExtension::NamedGroups(_) => ExtensionType::EllipticCurves,
      ClientExtension::SignatureAlgorithms(_) => ExtensionType::SignatureAlgorithms,
      ClientExtension::ServerName(_) => ExtensionType::ServerName,
      ClientExtension::SessionTicketRequest | ClientExtension::SessionTicketOffer(_) => {
        ExtensionType::SessionTicket
      }
      ClientExtension::Protocols(_) => ExtensionType::ALProtocolNegotiation,
      ClientExtension::SupportedVersions(_) => ExtensionType::SupportedVersions,
      ClientExtension::KeyShare(_) => ExtensionType::KeyShare,
      ClientExtension::PresharedKeyModes(_) => ExtensionType::PSKKeyExchangeModes,
      ClientExtension::PresharedKey(_) => ExtensionType::PreSharedKey,
      ClientExtension::Cookie(_) => ExtensionType::Cookie,
      ClientExtension::ExtendedMasterSecretRequest => ExtensionType::ExtendedMasterSecret,
      ClientExtension::EncryptThenMacRequest => ExtensionType::EncryptThenMac,
      ClientExtension::RenegotiationInfo(_) => ExtensionType::RenegotiationInfo,
      ClientExtension::PostHandshakeAuth => ExtensionType::PostHandshakeAuth,
      ClientExtension::EarlyData => ExtensionType::EarlyData,
      ClientExtension::Unknown(ref r) => r.typ,
    }
  }
}

impl Codec for ClientExtension {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.get_type().encode(bytes);

    let mut sub: Vec<u8> = Vec::new();
    match *self {
      ClientExtension::ECPointFormats(ref r) => r.encode(&mut sub),
      ClientExtension::NamedGroups(ref r) => r.encode(&mut sub),
      ClientExtension::SignatureAlgorithms(ref r) => r.encode(&mut sub),
      ClientExtension::ServerName(ref r) => r.encode(&mut sub),
      ClientExtension::SessionTicketRequest
      | ClientExtension::ExtendedMasterSecretRequest
      | ClientExtension::EncryptThenMacRequest
      | ClientExtension::PostHandshakeAuth
      | ClientExtension::EarlyData => (),
      ClientExtension::SessionTicketOffer(ref r) => r.encode(&mut sub),
      ClientExtension::Protocols(ref r) => r.encode(&mut sub),
      ClientExtension::SupportedVersions(ref r) => r.encode(&mut sub),
      ClientExtension::KeyShare(ref r) => r.encode(&mut sub),
      ClientExtension::PresharedKeyModes(ref r) => r.encode(&mut sub),
      ClientExtension::PresharedKey(ref r) => r.encode(&mut sub),
      ClientExtension::Cookie(ref r) => r.encode(&mut sub),
      ClientExtension::RenegotiationInfo(ref r) => r.encode(&mut sub),
      ClientExtension::Unknown(ref r) => r.encode(&mut sub),
    }

    codec::encode_u16(sub.len() as u16, bytes);
    bytes.append(&mut sub);
  }

  fn read(r: &mut Reader) -> Option<ClientExtension> {
    let typ = ExtensionType::read(r)?;
    let len = codec::read_u16(r)? as usize;
    let mut sub = r.sub(len)?;

    let ext = match typ {
      ExtensionType::ECPointFormats => {
        ClientExtension::ECPointFormats(ECPointFormatList::read(&mut sub)?)
      }
      ExtensionType::EllipticCurves => ClientExtension::NamedGroups(NamedGroups::read(&mut sub)?),
      ExtensionType::SignatureAlgorithms => {
        ClientExtension::SignatureAlgorithms(SupportedSignatureSchemes::read(&mut sub)?)
      }
      ExtensionType::ServerName => ClientExtension::ServerName(ServerNameRequest::read(&mut sub)?),
      ExtensionType::SessionTicket => {
        if sub.any_left() {
          ClientExtension::SessionTicketOffer(Payload::read(&mut sub)?)
        } else {
          ClientExtension::SessionTicketRequest
        }
      }
      ExtensionType::ALProtocolNegotiation => {
        ClientExtension::Protocols(ProtocolNameList::read(&mut sub)?)
      }
      ExtensionType::SupportedVersions => {
        ClientExtension::SupportedVersions(ProtocolVersions::read(&mut sub)?)
      }
      ExtensionType::KeyShare => ClientExtension::KeyShare(KeyShareEntries::read(&mut sub)?),
      ExtensionType::PSKKeyExchangeModes => {
        ClientExtension::PresharedKeyModes(PSKKeyExchangeModes::read(&mut sub)?)
      }
      ExtensionType::PreSharedKey => {
        ClientExtension::PresharedKey(PresharedKeyOffer::read(&mut sub)?)
      }
      ExtensionType::Cookie => ClientExtension::Cookie(PayloadU16::read(&mut sub)?),
      ExtensionType::ExtendedMasterSecret if !sub.any_left() => {
        ClientExtension::ExtendedMasterSecretRequest
      }
      ExtensionType::EncryptThenMac if !sub.any_left() => ClientExtension::EncryptThenMacRequest,
      ExtensionType::RenegotiationInfo => {
        ClientExtension::RenegotiationInfo(PayloadU8::read(&mut sub)?)
      }
      ExtensionType::PostHandshakeAuth if !sub.any_left() => ClientExtension::PostHandshakeAuth,
      ExtensionType::EarlyData if !sub.any_left() => ClientExtension::EarlyData,
      _ => ClientExtension::Unknown(UnknownExtension::read(typ, &mut sub)?),
    };

    if sub.any_left() {
      None
    } else {
      Some(ext)
    }
  }
}

impl ClientExtension {
  /// Make a basic SNI ServerNameRequest quoting `hostname`.
  pub fn make_sni(hostname: &str) -> ClientExtension {
    let name = ServerName {
      typ: ServerNameType::HostName,
      payload: ServerNamePayload::HostName(hostname.to_string()),
    };

    ClientExtension::ServerName(vec![name])
  }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ServerExtension {
  ECPointFormats(ECPointFormatList),
  ServerNameAcknowledgement,
  SessionTicketAcknowledgement,
  RenegotiationInfo(PayloadU8),
  Protocols(ProtocolNameList),
  KeyShare(KeyShareEntry),
  PresharedKey(u16),
  SupportedVersions(ProtocolVersion),
  ExtendedMasterSecretAck,
  EncryptThenMacAck,
  Unknown(UnknownExtension),
}

impl ServerExtension {
  pub fn get_type(&self) -> ExtensionType {
    match *self {
      ServerExtension::ECPointFormats(_) => ExtensionType::ECPointFormats,
      ServerExtension::ServerNameAcknowledgement => ExtensionType::ServerName,
      ServerExtension::SessionTicketAcknowledgement => ExtensionType::SessionTicket,
      ServerExtension::RenegotiationInfo(_) => ExtensionType::RenegotiationInfo,
      ServerExtension::Protocols(_) => ExtensionType::ALProtocolNegotiation,
      ServerExtension::KeyShare(_) => ExtensionType::KeyShare,
      ServerExtension::PresharedKey(_) => ExtensionType::PreSharedKey,
      ServerExtension::SupportedVersions(_) => ExtensionType::SupportedVersions,
      ServerExtension::ExtendedMasterSecretAck => ExtensionType::ExtendedMasterSecret,
      ServerExtension::EncryptThenMacAck => ExtensionType::EncryptThenMac,
      ServerExtension::Unknown(ref r) => r.typ,
    }
  }
}

impl Codec for ServerExtension {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.get_type().encode(bytes);

    let mut sub: Vec<u8> = Vec::new();
    match *self {
      ServerExtension::ECPointFormats(ref r) => r.encode(&mut sub),
      ServerExtension::ServerNameAcknowledgement
      | ServerExtension::SessionTicketAcknowledgement
      | ServerExtension::ExtendedMasterSecretAck
      | ServerExtension::EncryptThenMacAck => (),
      ServerExtension::RenegotiationInfo(ref r) => r.encode(&mut sub),
      ServerExtension::Protocols(ref r) => r.encode(&mut sub),
      ServerExtension::KeyShare(ref r) => r.encode(&mut sub),
      ServerExtension::PresharedKey(v) => codec::encode_u16(v, &mut sub),
      ServerExtension::SupportedVersions(ref r) => r.encode(&mut sub),
      ServerExtension::Unknown(ref r) => r.encode(&mut sub),
    }

    codec::encode_u16(sub.len() as u16, bytes);
    bytes.append(&mut sub);
  }

  fn read(r: &mut Reader) -> Option<ServerExtension> {
    let typ = ExtensionType::read(r)?;
    let len = codec::read_u16(r)? as usize;
    let mut sub = r.sub(len)?;

    let ext = match typ {
      ExtensionType::ECPointFormats => {
        ServerExtension::ECPointFormats(ECPointFormatList::read(&mut sub)?)
      }
      ExtensionType::ServerName => ServerExtension::ServerNameAcknowledgement,
      ExtensionType::SessionTicket => ServerExtension::SessionTicketAcknowledgement,
      ExtensionType::RenegotiationInfo => {
        ServerExtension::RenegotiationInfo(PayloadU8::read(&mut sub)?)
      }
      ExtensionType::ALProtocolNegotiation => {
        ServerExtension::Protocols(ProtocolNameList::read(&mut sub)?)
      }
      ExtensionType::KeyShare => ServerExtension::KeyShare(KeyShareEntry::read(&mut sub)?),
      ExtensionType::PreSharedKey => ServerExtension::PresharedKey(codec::read_u16(&mut sub)?),
      ExtensionType::SupportedVersions => {
        ServerExtension::SupportedVersions(ProtocolVersion::read(&mut sub)?)
      }
      ExtensionType::ExtendedMasterSecret if !sub.any_left() => {
        ServerExtension::ExtendedMasterSecretAck
      }
      ExtensionType::EncryptThenMac if !sub.any_left() => ServerExtension::EncryptThenMacAck,
      _ => ServerExtension::Unknown(UnknownExtension::read(typ, &mut sub)?),
    };

    if sub.any_left() {
      None
    } else {
      Some(ext)
    }
  }
}

impl ServerExtension {
  pub fn make_alpn(proto: &[u8]) -> ServerExtension {
    ServerExtension::Protocols(ProtocolNameList::from_slices(&[proto]))
  }

  pub fn make_empty_renegotiation_info() -> ServerExtension {
    ServerExtension::RenegotiationInfo(PayloadU8::empty())
  }
}

fn has_duplicate<T: Copy + Eq + std::hash::Hash>(iter: impl Iterator<Item = T>) -> bool {
  let mut seen = collections::HashSet::new();

  for typ in iter {
    if !seen.insert(typ) {
      return true;
    }
  }

  false
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClientHelloPayload {
  pub client_version: ProtocolVersion,
  pub random: Random,
  pub session_id: SessionID,
  pub cookie: Option<PayloadU8>,
  pub cipher_suites: Vec<CipherSuite>,
  pub compression_methods: Vec<Compression>,
  pub extensions: Vec<ClientExtension>,
}

impl Codec for ClientHelloPayload {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.client_version.encode(bytes);
    self.random.encode(bytes);
    self.session_id.encode(bytes);
    if let Some(ref cookie) = self.cookie {
      cookie.encode(bytes);
    }
    codec::encode_vec_u16(bytes, &self.cipher_suites);
    codec::encode_vec_u8(bytes, &self.compression_methods);

    if !self.extensions.is_empty() {
      codec::encode_vec_u16(bytes, &self.extensions);
    }
  }

  fn read(r: &mut Reader) -> Option<ClientHelloPayload> {
    let client_version = ProtocolVersion::read(r)?;
    let random = Random::read(r)?;
    let session_id = SessionID::read(r)?;

    // DTLS interposes the cookie between session-id and cipher suites.
    let cookie = if client_version.is_datagram() {
      Some(PayloadU8::read(r)?)
    } else {
      None
    };

    let mut ret = ClientHelloPayload {
      client_version,
      random,
      session_id,
      cookie,
      cipher_suites: codec::read_vec_u16::<CipherSuite>(r)?,
      compression_methods: codec::read_vec_u8::<Compression>(r)?,
      extensions: Vec::new(),
    };

    if r.any_left() {
      ret.extensions = codec::read_vec_u16::<ClientExtension>(r)?;
    }

    Some(ret)
  }
}

impl ClientHelloPayload {
  pub fn has_duplicate_extension(&self) -> bool {
    has_duplicate(self.extensions.iter().map(|ext| ext.get_type().get_u16()))
  }

  pub fn find_extension(&self, ext: ExtensionType) -> Option<&ClientExtension> {
    self.extensions.iter().find(|x| x.get_type() == ext)
  }

  pub fn get_sni_extension(&self) -> Option<&ServerNameRequest> {
    match self.find_extension(ExtensionType::ServerName) {
      Some(ClientExtension::ServerName(req)) => Some(req),
      _ => None,
    }
  }

  /// The single host name carried by the SNI extension, if well-formed.
  pub fn get_sni_hostname(&self) -> Option<&str> {
    self
      .get_sni_extension()?
      .iter()
      .find_map(|name| match name.payload {
        ServerNamePayload::HostName(ref host) => Some(host.as_str()),
        _ => None,
      })
  }

  pub fn get_sigalgs_extension(&self) -> Option<&SupportedSignatureSchemes> {
    match self.find_extension(ExtensionType::SignatureAlgorithms) {
      Some(ClientExtension::SignatureAlgorithms(req)) => Some(req),
      _ => None,
    }
  }

  pub fn get_namedgroups_extension(&self) -> Option<&NamedGroups> {
    match self.find_extension(ExtensionType::EllipticCurves) {
      Some(ClientExtension::NamedGroups(req)) => Some(req),
      _ => None,
    }
  }

  pub fn get_ecpoints_extension(&self) -> Option<&ECPointFormatList> {
    match self.find_extension(ExtensionType::ECPointFormats) {
      Some(ClientExtension::ECPointFormats(req)) => Some(req),
      _ => None,
    }
  }

  pub fn get_alpn_extension(&self) -> Option<&ProtocolNameList> {
    match self.find_extension(ExtensionType::ALProtocolNegotiation) {
      Some(ClientExtension::Protocols(req)) => Some(req),
      _ => None,
    }
  }

  pub fn get_ticket_extension(&self) -> Option<&ClientExtension> {
    self.find_extension(ExtensionType::SessionTicket)
  }

  pub fn get_versions_extension(&self) -> Option<&ProtocolVersions> {
    match self.find_extension(ExtensionType::SupportedVersions) {
      Some(ClientExtension::SupportedVersions(vers)) => Some(vers),
      _ => None,
    }
  }

  pub fn get_keyshare_extension(&self) -> Option<&KeyShareEntries> {
    match self.find_extension(ExtensionType::KeyShare) {
      Some(ClientExtension::KeyShare(shares)) => Some(shares),
      _ => None,
    }
  }

  pub fn get_psk(&self) -> Option<&PresharedKeyOffer> {
    match self.find_extension(ExtensionType::PreSharedKey) {
      Some(ClientExtension::PresharedKey(psk)) => Some(psk),
      _ => None,
    }
  }

  pub fn get_psk_modes(&self) -> Option<&PSKKeyExchangeModes> {
    match self.find_extension(ExtensionType::PSKKeyExchangeModes) {
      Some(ClientExtension::PresharedKeyModes(modes)) => Some(modes),
      _ => None,
    }
  }

  pub fn get_renegotiation_info(&self) -> Option<&PayloadU8> {
    match self.find_extension(ExtensionType::RenegotiationInfo) {
      Some(ClientExtension::RenegotiationInfo(info)) => Some(info),
      _ => None,
    }
  }

  pub fn ems_offered(&self) -> bool {
    self
      .find_extension(ExtensionType::ExtendedMasterSecret)
      .is_some()
  }

  pub fn etm_offered(&self) -> bool {
    self.find_extension(ExtensionType::EncryptThenMac).is_some()
  }

  pub fn post_handshake_auth_offered(&self) -> bool {
    self
      .find_extension(ExtensionType::PostHandshakeAuth)
      .is_some()
  }

  pub fn psk_offered_last(&self) -> bool {
    match self.extensions.last() {
      Some(ext) => ext.get_type() == ExtensionType::PreSharedKey,
      None => false,
    }
  }

  pub fn offers_scsv(&self) -> bool {
    self
      .cipher_suites
      .contains(&CipherSuite::TLS_EMPTY_RENEGOTIATION_INFO_SCSV)
  }
}

#[derive(Clone, Debug, PartialEq)]
pub enum HelloRetryExtension {
  KeyShare(NamedGroup),
  Cookie(PayloadU16),
  SupportedVersions(ProtocolVersion),
  Unknown(UnknownExtension),
}

impl HelloRetryExtension {
  pub fn get_type(&self) -> ExtensionType {
    match *self {
      HelloRetryExtension::KeyShare(_) => ExtensionType::KeyShare,
      HelloRetryExtension::Cookie(_) => ExtensionType::Cookie,
      HelloRetryExtension::SupportedVersions(_) => ExtensionType::SupportedVersions,
      HelloRetryExtension::Unknown(ref r) => r.typ,
    }
  }
}

impl Codec for HelloRetryExtension {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.get_type().encode(bytes);

    let mut sub: Vec<u8> = Vec::new();
    match *self {
      HelloRetryExtension::KeyShare(ref r) => r.encode(&mut sub),
      HelloRetryExtension::Cookie(ref r) => r.encode(&mut sub),
      HelloRetryExtension::SupportedVersions(ref r) => r.encode(&mut sub),
      HelloRetryExtension::Unknown(ref r) => r.encode(&mut sub),
    }

    codec::encode_u16(sub.len() as u16, bytes);
    bytes.append(&mut sub);
  }

  fn read(r: &mut Reader) -> Option<HelloRetryExtension> {
    let typ = ExtensionType::read(r)?;
    let len = codec::read_u16(r)? as usize;
    let mut sub = r.sub(len)?;

    let ext = match typ {
      ExtensionType::KeyShare => HelloRetryExtension::KeyShare(NamedGroup::read(&mut sub)?),
      ExtensionType::Cookie => HelloRetryExtension::Cookie(PayloadU16::read(&mut sub)?),
      ExtensionType::SupportedVersions => {
        HelloRetryExtension::SupportedVersions(ProtocolVersion::read(&mut sub)?)
      }
      _ => HelloRetryExtension::Unknown(UnknownExtension::read(typ, &mut sub)?),
    };

    if sub.any_left() {
      None
    } else {
      Some(ext)
    }
  }
}

/// A HelloRetryRequest shares the ServerHello wire shape; it is identified
/// by the reserved random value.
#[derive(Clone, Debug, PartialEq)]
pub struct HelloRetryRequest {
  pub legacy_version: ProtocolVersion,
  pub session_id: SessionID,
  pub cipher_suite: CipherSuite,
  pub extensions: Vec<HelloRetryExtension>,
}

impl Codec for HelloRetryRequest {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.legacy_version.encode(bytes);
    bytes.extend_from_slice(&HELLO_RETRY_REQUEST_RANDOM);
    self.session_id.encode(bytes);
    self.cipher_suite.encode(bytes);
    Compression::Null.encode(bytes);
    codec::encode_vec_u16(bytes, &self.extensions);
  }

  fn read(r: &mut Reader) -> Option<HelloRetryRequest> {
    // The caller has already consumed version and random.
    let session_id = SessionID::read(r)?;
    let cipher_suite = CipherSuite::read(r)?;
    let compression = Compression::read(r)?;

    if compression != Compression::Null {
      return None;
    }

    Some(HelloRetryRequest {
      legacy_version: ProtocolVersion::TLSv1_2,
      session_id,
      cipher_suite,
      extensions: codec::read_vec_u16::<HelloRetryExtension>(r)?,
    })
  }
}

impl HelloRetryRequest {
  pub fn has_duplicate_extension(&self) -> bool {
    has_duplicate(self.extensions.iter().map(|ext| ext.get_type().get_u16()))
  }

  pub fn find_extension(&self, ext: ExtensionType) -> Option<&HelloRetryExtension> {
    self.extensions.iter().find(|x| x.get_type() == ext)
  }

  pub fn get_requested_key_share_group(&self) -> Option<NamedGroup> {
    match self.find_extension(ExtensionType::KeyShare) {
      Some(HelloRetryExtension::KeyShare(group)) => Some(*group),
      _ => None,
    }
  }

  pub fn get_cookie(&self) -> Option<&PayloadU16> {
    match self.find_extension(ExtensionType::Cookie) {
      Some(HelloRetryExtension::Cookie(cookie)) => Some(cookie),
      _ => None,
    }
  }

  pub fn get_supported_versions(&self) -> Option<ProtocolVersion> {
    match self.find_extension(ExtensionType::SupportedVersions) {
      Some(HelloRetryExtension::SupportedVersions(v)) => Some(*v),
      _ => None,
    }
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServerHelloPayload {
  pub legacy_version: ProtocolVersion,
  pub random: Random,
  pub session_id: SessionID,
  pub cipher_suite: CipherSuite,
  pub compression_method: Compression,
  pub extensions: Vec<ServerExtension>,
}

impl Codec for ServerHelloPayload {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.legacy_version.encode(bytes);
    self.random.encode(bytes);
    self.session_id.encode(bytes);
    self.cipher_suite.encode(bytes);
    self.compression_method.encode(bytes);

    if !self.extensions.is_empty() {
      codec::encode_vec_u16(bytes, &self.extensions);
    }
  }

  fn read(r: &mut Reader) -> Option<ServerHelloPayload> {
    let legacy_version = ProtocolVersion::read(r)?;
    let random = Random::read(r)?;

    let mut ret = ServerHelloPayload {
      legacy_version,
      random,
      session_id: SessionID::read(r)?,
      cipher_suite: CipherSuite::read(r)?,
      compression_method: Compression::read(r)?,
      extensions: Vec::new(),
    };

    if r.any_left() {
      ret.extensions = codec::read_vec_u16::<ServerExtension>(r)?;
    }

    Some(ret)
  }
}

impl ServerHelloPayload {
  pub fn has_duplicate_extension(&self) -> bool {
    has_duplicate(self.extensions.iter().map(|ext| ext.get_type().get_u16()))
  }

  pub fn find_extension(&self, ext: ExtensionType) -> Option<&ServerExtension> {
    self.extensions.iter().find(|x| x.get_type() == ext)
  }

  pub fn get_alpn_protocol(&self) -> Option<Vec<u8>> {
    match self.find_extension(ExtensionType::ALProtocolNegotiation) {
      Some(ServerExtension::Protocols(protos)) => protos.to_single_vec(),
      _ => None,
    }
  }

  pub fn get_key_share(&self) -> Option<&KeyShareEntry> {
    match self.find_extension(ExtensionType::KeyShare) {
      Some(ServerExtension::KeyShare(share)) => Some(share),
      _ => None,
    }
  }

  pub fn get_psk_index(&self) -> Option<u16> {
    match self.find_extension(ExtensionType::PreSharedKey) {
      Some(ServerExtension::PresharedKey(idx)) => Some(*idx),
      _ => None,
    }
  }

  pub fn get_supported_versions(&self) -> Option<ProtocolVersion> {
    match self.find_extension(ExtensionType::SupportedVersions) {
      Some(ServerExtension::SupportedVersions(v)) => Some(*v),
      _ => None,
    }
  }

  pub fn get_renegotiation_info(&self) -> Option<&PayloadU8> {
    match self.find_extension(ExtensionType::RenegotiationInfo) {
      Some(ServerExtension::RenegotiationInfo(info)) => Some(info),
      _ => None,
    }
  }

  pub fn ems_acked(&self) -> bool {
    self
      .find_extension(ExtensionType::ExtendedMasterSecret)
      .is_some()
  }

  pub fn etm_acked(&self) -> bool {
    self.find_extension(ExtensionType::EncryptThenMac).is_some()
  }
}

/// DTLS stateless cookie demand.
#[derive(Clone, Debug, PartialEq)]
pub struct HelloVerifyRequestPayload {
  pub server_version: ProtocolVersion,
  pub cookie: PayloadU8,
}

impl Codec for HelloVerifyRequestPayload {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.server_version.encode(bytes);
    self.cookie.encode(bytes);
  }

  fn read(r: &mut Reader) -> Option<HelloVerifyRequestPayload> {
    Some(HelloVerifyRequestPayload {
      server_version: ProtocolVersion::read(r)?,
      cookie: PayloadU8::read(r)?,
    })
  }
}

pub type ASN1Cert = PayloadU24;
pub type CertificatePayload = Vec<ASN1Cert>;

impl Codec for CertificatePayload {
  fn encode(&self, bytes: &mut Vec<u8>) {
    codec::encode_vec_u24(bytes, self);
  }

  fn read(r: &mut Reader) -> Option<CertificatePayload> {
    codec::read_vec_u24::<ASN1Cert>(r)
  }
}

// TLS 1.3 wraps each certificate with per-entry extensions and prefixes a
// request context, so its Certificate parsing is context-sensitive.

#[derive(Clone, Debug, PartialEq)]
pub enum CertificateExtension {
  Unknown(UnknownExtension),
}

impl CertificateExtension {
  pub fn get_type(&self) -> ExtensionType {
    match *self {
      CertificateExtension::Unknown(ref r) => r.typ,
    }
  }
}

impl Codec for CertificateExtension {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.get_type().encode(bytes);

    let mut sub: Vec<u8> = Vec::new();
    match *self {
      CertificateExtension::Unknown(ref r) => r.encode(&mut sub),
    }

    codec::encode_u16(sub.len() as u16, bytes);
    bytes.append(&mut sub);
  }

  fn read(r: &mut Reader) -> Option<CertificateExtension> {
    let typ = ExtensionType::read(r)?;
    let len = codec::read_u16(r)? as usize;
    let mut sub = r.sub(len)?;

    Some(CertificateExtension::Unknown(UnknownExtension::read(
      typ, &mut sub,
    )?))
  }
}

declare_u16_vec!(CertificateExtensions, CertificateExtension);

#[derive(Clone, Debug, PartialEq)]
pub struct CertificateEntry {
  pub cert: ASN1Cert,
  pub exts: CertificateExtensions,
}

impl CertificateEntry {
  pub fn new(cert: ASN1Cert) -> CertificateEntry {
    CertificateEntry {
      cert,
      exts: Vec::new(),
    }
  }
}

impl Codec for CertificateEntry {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.cert.encode(bytes);
    self.exts.encode(bytes);
  }

  fn read(r: &mut Reader) -> Option<CertificateEntry> {
    Some(CertificateEntry {
      cert: ASN1Cert::read(r)?,
      exts: CertificateExtensions::read(r)?,
    })
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CertificatePayloadTLS13 {
  pub request_context: PayloadU8,
  pub list: Vec<CertificateEntry>,
}

impl CertificatePayloadTLS13 {
  pub fn new(chain: &[ASN1Cert]) -> CertificatePayloadTLS13 {
    CertificatePayloadTLS13 {
      request_context: PayloadU8::empty(),
      list: chain
        .iter()
        .map(|cert| CertificateEntry::new(cert.clone()))
        .collect(),
    }
  }

  pub fn convert(&self) -> CertificatePayload {
    self.list.iter().map(|entry| entry.cert.clone()).collect()
  }
}

impl Codec for CertificatePayloadTLS13 {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.request_context.encode(bytes);
    codec::encode_vec_u24(bytes, &self.list);
  }

  fn read(r: &mut Reader) -> Option<CertificatePayloadTLS13> {
    Some(CertificatePayloadTLS13 {
      request_context: PayloadU8::read(r)?,
      list: codec::read_vec_u24::<CertificateEntry>(r)?,
    })
  }
}

/// Which key-exchange shape a ≤1.2 suite uses; drives ServerKeyExchange
/// and ClientKeyExchange interpretation.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum KeyExchangeAlgorithm {
  BulkOnly,
  RSA,
  DHE,
  ECDHE,
  PSK,
  DHE_PSK,
  ECDHE_PSK,
  RSA_PSK,
  ECC_TLCP,
}

impl KeyExchangeAlgorithm {
  pub fn is_psk(&self) -> bool {
    matches!(
      self,
      KeyExchangeAlgorithm::PSK
        | KeyExchangeAlgorithm::DHE_PSK
        | KeyExchangeAlgorithm::ECDHE_PSK
        | KeyExchangeAlgorithm::RSA_PSK
    )
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ECParameters {
  pub curve_type: ECCurveType,
  pub named_group: NamedGroup,
}

impl Codec for ECParameters {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.curve_type.encode(bytes);
    self.named_group.encode(bytes);
  }

  fn read(r: &mut Reader) -> Option<ECParameters> {
    let ct = ECCurveType::read(r)?;

    // Arbitrary explicit curves are unsupportable attack surface.
    if ct != ECCurveType::NamedCurve {
      return None;
    }

    let grp = NamedGroup::read(r)?;

    Some(ECParameters {
      curve_type: ct,
      named_group: grp,
    })
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DigitallySignedStruct {
  pub scheme: SignatureScheme,
  pub sig: PayloadU16,
}

impl DigitallySignedStruct {
  pub fn new(scheme: SignatureScheme, sig: Vec<u8>) -> DigitallySignedStruct {
    DigitallySignedStruct {
      scheme,
      sig: PayloadU16::new(sig),
    }
  }
}

impl Codec for DigitallySignedStruct {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.scheme.encode(bytes);
    self.sig.encode(bytes);
  }

  fn read(r: &mut Reader) -> Option<DigitallySignedStruct> {
    let scheme = SignatureScheme::read(r)?;
    let sig = PayloadU16::read(r)?;

    Some(DigitallySignedStruct { scheme, sig })
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClientECDHParams {
  pub public: PayloadU8,
}

impl Codec for ClientECDHParams {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.public.encode(bytes);
  }

  fn read(r: &mut Reader) -> Option<ClientECDHParams> {
    Some(ClientECDHParams {
      public: PayloadU8::read(r)?,
    })
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServerECDHParams {
  pub curve_params: ECParameters,
  pub public: PayloadU8,
}

impl ServerECDHParams {
  pub fn new(named_group: NamedGroup, pubkey: &[u8]) -> ServerECDHParams {
    ServerECDHParams {
      curve_params: ECParameters {
        curve_type: ECCurveType::NamedCurve,
        named_group,
      },
      public: PayloadU8::new(pubkey.to_vec()),
    }
  }
}

impl Codec for ServerECDHParams {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.curve_params.encode(bytes);
    self.public.encode(bytes);
  }

  fn read(r: &mut Reader) -> Option<ServerECDHParams> {
    Some(ServerECDHParams {
      curve_params: ECParameters::read(r)?,
      public: PayloadU8::read(r)?,
    })
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServerDHParams {
  pub dh_p: PayloadU16,
  pub dh_g: PayloadU16,
  pub dh_ys: PayloadU16,
}

impl Codec for ServerDHParams {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.dh_p.encode(bytes);
    self.dh_g.encode(bytes);
    self.dh_ys.encode(bytes);
  }

  fn read(r: &mut Reader) -> Option<ServerDHParams> {
    Some(ServerDHParams {
      dh_p: PayloadU16::read(r)?,
      dh_g: PayloadU16::read(r)?,
      dh_ys: PayloadU16::read(r)?,
    })
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ECDHEServerKeyExchange {
  pub params: ServerECDHParams,
  pub dss: DigitallySignedStruct,
}

impl Codec for ECDHEServerKeyExchange {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.params.encode(bytes);
    self.dss.encode(bytes);
  }

  fn read(r: &mut Reader) -> Option<ECDHEServerKeyExchange> {
    Some(ECDHEServerKeyExchange {
      params: ServerECDHParams::read(r)?,
      dss: DigitallySignedStruct::read(r)?,
    })
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DHEServerKeyExchange {
  pub params: ServerDHParams,
  pub dss: DigitallySignedStruct,
}

impl Codec for DHEServerKeyExchange {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.params.encode(bytes);
    self.dss.encode(bytes);
  }

  fn read(r: &mut Reader) -> Option<DHEServerKeyExchange> {
    Some(DHEServerKeyExchange {
      params: ServerDHParams::read(r)?,
      dss: DigitallySignedStruct::read(r)?,
    })
  }
}

/// PSK family ServerKeyExchange bodies: an identity hint, optionally
/// followed by ephemeral parameters.  These are unsigned.
#[derive(Clone, Debug, PartialEq)]
pub struct PskServerKeyExchange {
  pub hint: PayloadU16,
  pub ecdh_params: Option<ServerECDHParams>,
  pub dh_params: Option<ServerDHParams>,
}

impl PskServerKeyExchange {
  fn read_for(kxa: KeyExchangeAlgorithm, r: &mut Reader) -> Option<PskServerKeyExchange> {
    let hint = PayloadU16::read(r)?;

    let mut ret = PskServerKeyExchange {
      hint,
      ecdh_params: None,
      dh_params: None,
    };

    match kxa {
      KeyExchangeAlgorithm::ECDHE_PSK => ret.ecdh_params = Some(ServerECDHParams::read(r)?),
      KeyExchangeAlgorithm::DHE_PSK => ret.dh_params = Some(ServerDHParams::read(r)?),
      _ => (),
    }

    Some(ret)
  }
}

impl Codec for PskServerKeyExchange {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.hint.encode(bytes);
    if let Some(ref params) = self.ecdh_params {
      params.encode(bytes);
    }
    if let Some(ref params) = self.dh_params {
      params.encode(bytes);
    }
  }

  fn read(r: &mut Reader) -> Option<PskServerKeyExchange> {
    PskServerKeyExchange::read_for(KeyExchangeAlgorithm::PSK, r)
  }
}

/// TLCP ECC ServerKeyExchange: a signature over the randoms and the
/// encryption certificate.
#[derive(Clone, Debug, PartialEq)]
pub struct TlcpServerKeyExchange {
  pub dss: DigitallySignedStruct,
}

impl Codec for TlcpServerKeyExchange {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.dss.encode(bytes);
  }

  fn read(r: &mut Reader) -> Option<TlcpServerKeyExchange> {
    Some(TlcpServerKeyExchange {
      dss: DigitallySignedStruct::read(r)?,
    })
  }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ServerKeyExchangePayload {
  ECDHE(ECDHEServerKeyExchange),
  DHE(DHEServerKeyExchange),
  Psk(PskServerKeyExchange),
  Tlcp(TlcpServerKeyExchange),
  Unknown(Payload),
}

impl Codec for ServerKeyExchangePayload {
  fn encode(&self, bytes: &mut Vec<u8>) {
    match *self {
      ServerKeyExchangePayload::ECDHE(ref x) => x.encode(bytes),
      ServerKeyExchangePayload::DHE(ref x) => x.encode(bytes),
      ServerKeyExchangePayload::Psk(ref x) => x.encode(bytes),
      ServerKeyExchangePayload::Tlcp(ref x) => x.encode(bytes),
      ServerKeyExchangePayload::Unknown(ref x) => x.encode(bytes),
    }
  }

  fn read(r: &mut Reader) -> Option<ServerKeyExchangePayload> {
    // Read opaque; fully parse once the key-exchange algorithm is known.
    Payload::read(r).map(ServerKeyExchangePayload::Unknown)
  }
}

impl ServerKeyExchangePayload {
  pub fn unwrap_given_kxa(&self, kxa: KeyExchangeAlgorithm) -> Option<ServerKeyExchangePayload> {
    if let ServerKeyExchangePayload::Unknown(ref unk) = *self {
      let mut rd = Reader::init(&unk.0);

      let parsed = match kxa {
        KeyExchangeAlgorithm::ECDHE => {
          ECDHEServerKeyExchange::read(&mut rd).map(ServerKeyExchangePayload::ECDHE)
        }
        KeyExchangeAlgorithm::DHE => {
          DHEServerKeyExchange::read(&mut rd).map(ServerKeyExchangePayload::DHE)
        }
        KeyExchangeAlgorithm::PSK
        | KeyExchangeAlgorithm::ECDHE_PSK
        | KeyExchangeAlgorithm::DHE_PSK
        | KeyExchangeAlgorithm::RSA_PSK => {
          PskServerKeyExchange::read_for(kxa, &mut rd).map(ServerKeyExchangePayload::Psk)
        }
        KeyExchangeAlgorithm::ECC_TLCP => {
          TlcpServerKeyExchange::read(&mut rd).map(ServerKeyExchangePayload::Tlcp)
        }
        _ => None,
      }?;

      if rd.any_left() {
        return None;
      }

      return Some(parsed);
    }

    None
  }

  /// The signed parameter bytes, for signature verification.
  pub fn encode_params(&self, bytes: &mut Vec<u8>) {
    bytes.clear();

    match *self {
      ServerKeyExchangePayload::ECDHE(ref x) => x.params.encode(bytes),
      ServerKeyExchangePayload::DHE(ref x) => x.params.encode(bytes),
      _ => (),
    };
  }

  pub fn get_sig(&self) -> Option<DigitallySignedStruct> {
    match *self {
      ServerKeyExchangePayload::ECDHE(ref x) => Some(x.dss.clone()),
      ServerKeyExchangePayload::DHE(ref x) => Some(x.dss.clone()),
      ServerKeyExchangePayload::Tlcp(ref x) => Some(x.dss.clone()),
      _ => None,
    }
  }
}

/// TLCP ClientKeyExchange: the named SM2 curve, then the SM2-encrypted
/// pre-master secret.
#[derive(Clone, Debug, PartialEq)]
pub struct TlcpClientKeyExchange {
  pub curve_params: ECParameters,
  pub encrypted_premaster: PayloadU16,
}

impl TlcpClientKeyExchange {
  pub fn new(encrypted_premaster: Vec<u8>) -> TlcpClientKeyExchange {
    TlcpClientKeyExchange {
      curve_params: ECParameters {
        curve_type: ECCurveType::NamedCurve,
        named_group: NamedGroup::CurveSM2,
      },
      encrypted_premaster: PayloadU16::new(encrypted_premaster),
    }
  }
}

impl Codec for TlcpClientKeyExchange {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.curve_params.encode(bytes);
    self.encrypted_premaster.encode(bytes);
  }

  fn read(r: &mut Reader) -> Option<TlcpClientKeyExchange> {
    let params = ECParameters::read(r)?;

    if params.named_group != NamedGroup::CurveSM2 {
      return None;
    }

    Some(TlcpClientKeyExchange {
      curve_params: params,
      encrypted_premaster: PayloadU16::read(r)?,
    })
  }
}

// -- EncryptedExtensions (TLS 1.3 only) --
declare_u16_vec!(EncryptedExtensions, ServerExtension);

pub trait HasServerExtensions {
  fn get_extensions(&self) -> &[ServerExtension];

  fn has_duplicate_extension(&self) -> bool {
    has_duplicate(
      self
        .get_extensions()
        .iter()
        .map(|ext| ext.get_type().get_u16()),
    )
  }

  fn find_extension(&self, ext: ExtensionType) -> Option<&ServerExtension> {
    self.get_extensions().iter().find(|x| x.get_type() == ext)
  }

  fn get_alpn_protocol(&self) -> Option<Vec<u8>> {
    match self.find_extension(ExtensionType::ALProtocolNegotiation) {
      Some(ServerExtension::Protocols(protos)) => protos.to_single_vec(),
      _ => None,
    }
  }
}

impl HasServerExtensions for EncryptedExtensions {
  fn get_extensions(&self) -> &[ServerExtension] {
    self
  }
}

// -- CertificateRequest and sundries --
declare_u8_vec!(ClientCertificateTypes, ClientCertificateType);
pub type DistinguishedName = PayloadU16;
declare_u16_vec!(DistinguishedNames, DistinguishedName);

#[derive(Clone, Debug, PartialEq)]
pub struct CertificateRequestPayload {
  pub certtypes: ClientCertificateTypes,
  pub sigschemes: SupportedSignatureSchemes,
  pub canames: DistinguishedNames,
}

impl Codec for CertificateRequestPayload {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.certtypes.encode(bytes);
    self.sigschemes.encode(bytes);
    self.canames.encode(bytes);
  }

  fn read(r: &mut Reader) -> Option<CertificateRequestPayload> {
    Some(CertificateRequestPayload {
      certtypes: ClientCertificateTypes::read(r)?,
      sigschemes: SupportedSignatureSchemes::read(r)?,
      canames: DistinguishedNames::read(r)?,
    })
  }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CertReqExtension {
  SignatureAlgorithms(SupportedSignatureSchemes),
  Unknown(UnknownExtension),
}

impl CertReqExtension {
  pub fn get_type(&self) -> ExtensionType {
    match *self {
      CertReqExtension::SignatureAlgorithms(_) => ExtensionType::SignatureAlgorithms,
      CertReqExtension::Unknown(ref r) => r.typ,
    }
  }
}

impl Codec for CertReqExtension {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.get_type().encode(bytes);

    let mut sub: Vec<u8> = Vec::new();
    match *self {
      CertReqExtension::SignatureAlgorithms(ref r) => r.encode(&mut sub),
      CertReqExtension::Unknown(ref r) => r.encode(&mut sub),
    }

    codec::encode_u16(sub.len() as u16, bytes);
    bytes.append(&mut sub);
  }

  fn read(r: &mut Reader) -> Option<CertReqExtension> {
    let typ = ExtensionType::read(r)?;
    let len = codec::read_u16(r)? as usize;
    let mut sub = r.sub(len)?;

    let ext = match typ {
      ExtensionType::SignatureAlgorithms => {
        CertReqExtension::SignatureAlgorithms(SupportedSignatureSchemes::read(&mut sub)?)
      }
      _ => CertReqExtension::Unknown(UnknownExtension::read(typ, &mut sub)?),
    };

    if sub.any_left() {
      None
    } else {
      Some(ext)
    }
  }
}

declare_u16_vec!(CertReqExtensions, CertReqExtension);

#[derive(Clone, Debug, PartialEq)]
pub struct CertificateRequestPayloadTLS13 {
  pub context: PayloadU8,
  pub extensions: CertReqExtensions,
}

impl CertificateRequestPayloadTLS13 {
  pub fn get_sigalgs_extension(&self) -> Option<&SupportedSignatureSchemes> {
    self.extensions.iter().find_map(|ext| match ext {
      CertReqExtension::SignatureAlgorithms(schemes) => Some(schemes),
      _ => None,
    })
  }
}

impl Codec for CertificateRequestPayloadTLS13 {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.context.encode(bytes);
    self.extensions.encode(bytes);
  }

  fn read(r: &mut Reader) -> Option<CertificateRequestPayloadTLS13> {
    Some(CertificateRequestPayloadTLS13 {
      context: PayloadU8::read(r)?,
      extensions: CertReqExtensions::read(r)?,
    })
  }
}

// -- NewSessionTicket --
#[derive(Clone, Debug, PartialEq)]
pub struct NewSessionTicketPayload {
  pub lifetime_hint: u32,
  pub ticket: PayloadU16,
}

impl NewSessionTicketPayload {
  pub fn new(lifetime_hint: u32, ticket: Vec<u8>) -> NewSessionTicketPayload {
    NewSessionTicketPayload {
      lifetime_hint,
      ticket: PayloadU16::new(ticket),
    }
  }
}

impl Codec for NewSessionTicketPayload {
  fn encode(&self, bytes: &mut Vec<u8>) {
    codec::encode_u32(self.lifetime_hint, bytes);
    self.ticket.encode(bytes);
  }

  fn read(r: &mut Reader) -> Option<NewSessionTicketPayload> {
    Some(NewSessionTicketPayload {
      lifetime_hint: codec::read_u32(r)?,
      ticket: PayloadU16::read(r)?,
    })
  }
}

#[derive(Clone, Debug, PartialEq)]
pub enum NewSessionTicketExtension {
  Unknown(UnknownExtension),
}

impl NewSessionTicketExtension {
  pub fn get_type(&self) -> ExtensionType {
    match *self {
      NewSessionTicketExtension::Unknown(ref r) => r.typ,
    }
  }
}

impl Codec for NewSessionTicketExtension {
  fn encode(&self, bytes: &mut Vec<u8>) {
    self.get_type().encode(bytes);

    let mut sub: Vec<u8> = Vec::new();
    match *self {
      NewSessionTicketExtension::Unknown(ref r) => r.encode(&mut sub),
    }

    codec::encode_u16(sub.len() as u16, bytes);
    bytes.append(&mut sub);
  }

  fn read(r: &mut Reader) -> Option<NewSessionTicketExtension> {
    let typ = ExtensionType::read(r)?;
    let len = codec::read_u16(r)? as usize;
    let mut sub = r.sub(len)?;

    Some(NewSessionTicketExtension::Unknown(UnknownExtension::read(
      typ, &mut sub,
    )?))
  }
}

declare_u16_vec!(NewSessionTicketExtensions, NewSessionTicketExtension);

#[derive(Clone, Debug, PartialEq)]
pub struct NewSessionTicketPayloadTLS13 {
  pub lifetime: u32,
  pub age_add: u32,
  pub nonce: PayloadU8,
  pub ticket: PayloadU16,
  pub exts: NewSessionTicketExtensions,
}

impl NewSessionTicketPayloadTLS13 {
  pub fn new(
    lifetime: u32,
    age_add: u32,
    nonce: Vec<u8>,
    ticket: Vec<u8>,
  ) -> NewSessionTicketPayloadTLS13 {
    NewSessionTicketPayloadTLS13 {
      lifetime,
      age_add,
      nonce: PayloadU8::new(nonce),
      ticket: PayloadU16::new(ticket),
      exts: Vec::new(),
    }
  }
}

impl Codec for NewSessionTicketPayloadTLS13 {
  fn encode(&self, bytes: &mut Vec<u8>) {
    codec::encode_u32(self.lifetime, bytes);
    codec::encode_u32(self.age_add, bytes);
    self.nonce.encode(bytes);
    self.ticket.encode(bytes);
    self.exts.encode(bytes);
  }

  fn read(r: &mut Reader) -> Option<NewSessionTicketPayloadTLS13> {
    Some(NewSessionTicketPayloadTLS13 {
      lifetime: codec::read_u32(r)?,
      age_add: codec::read_u32(r)?,
      nonce: PayloadU8::read(r)?,
      ticket: PayloadU16::read(r)?,
      exts: NewSessionTicketExtensions::read(r)?,
    })
  }
}

#[derive(Clone, Debug, PartialEq)]
pub enum HandshakePayload {
  HelloRequest,
  ClientHello(ClientHelloPayload),
  ServerHello(ServerHelloPayload),
  HelloRetryRequest(HelloRetryRequest),
  HelloVerifyRequest(HelloVerifyRequestPayload),
  Certificate(CertificatePayload),
  CertificateTLS13(CertificatePayloadTLS13),
  ServerKeyExchange(ServerKeyExchangePayload),
  CertificateRequest(CertificateRequestPayload),
  CertificateRequestTLS13(CertificateRequestPayloadTLS13),
  CertificateVerify(DigitallySignedStruct),
  ServerHelloDone,
  EndOfEarlyData,
  ClientKeyExchange(Payload),
  NewSessionTicket(NewSessionTicketPayload),
  NewSessionTicketTLS13(NewSessionTicketPayloadTLS13),
  EncryptedExtensions(EncryptedExtensions),
  KeyUpdate(KeyUpdateRequest),
  Finished(Payload),
  MessageHash(Payload),
  Unknown(Payload),
}

impl HandshakePayload {
  fn encode(&self, bytes: &mut Vec<u8>) {
    match *self {
      HandshakePayload::HelloRequest
      | HandshakePayload::ServerHelloDone
      | HandshakePayload::EndOfEarlyData => {}
      HandshakePayload::ClientHello(ref x) => x.encode(bytes),
      HandshakePayload::ServerHello(ref x) => x.encode(bytes),
      HandshakePayload::HelloRetryRequest(ref x) => x.encode(bytes),
      HandshakePayload::HelloVerifyRequest(ref x) => x.encode(bytes),
      HandshakePayload::Certificate(ref x) => x.encode(bytes),
      HandshakePayload::CertificateTLS13(ref x) => x.encode(bytes),
      HandshakePayload::ServerKeyExchange(ref x) => x.encode(bytes),
      HandshakePayload::CertificateRequest(ref x) => x.encode(bytes),
      HandshakePayload::CertificateRequestTLS13(ref x) => x.encode(bytes),
      HandshakePayload::CertificateVerify(ref x) => x.encode(bytes),
      HandshakePayload::ClientKeyExchange(ref x) => x.encode(bytes),
      HandshakePayload::NewSessionTicket(ref x) => x.encode(bytes),
      HandshakePayload::NewSessionTicketTLS13(ref x) => x.encode(bytes),
      HandshakePayload::EncryptedExtensions(ref x) => x.encode(bytes),
      HandshakePayload::KeyUpdate(ref x) => x.encode(bytes),
      HandshakePayload::Finished(ref x) => x.encode(bytes),
      HandshakePayload::MessageHash(ref x) => x.encode(bytes),
      HandshakePayload::Unknown(ref x) => x.encode(bytes),
    }
  }
}

/// DTLS wraps every handshake message with a sequence number and fragment
/// fields.  Fragmentation itself belongs to the record layer; a fragment
/// that does not span its whole message is a decode failure here.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DtlsFraming {
  pub message_seq: u16,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HandshakeMessagePayload {
  pub typ: HandshakeType,
  pub dtls: Option<DtlsFraming>,
  pub payload: HandshakePayload,
}

impl Codec for HandshakeMessagePayload {
  fn encode(&self, bytes: &mut Vec<u8>) {
    let mut sub: Vec<u8> = Vec::new();
    self.payload.encode(&mut sub);

    // HelloRetryRequest masquerades as ServerHello on the wire.
    let typ = match self.typ {
      HandshakeType::HelloRetryRequest => HandshakeType::ServerHello,
      other => other,
    };
    typ.encode(bytes);
    codec::encode_u24(sub.len() as u32, bytes);

    if let Some(framing) = self.dtls {
      codec::encode_u16(framing.message_seq, bytes);
      codec::encode_u24(0, bytes); // fragment offset
      codec::encode_u24(sub.len() as u32, bytes); // fragment length
    }

    bytes.append(&mut sub);
  }

  fn read(r: &mut Reader) -> Option<HandshakeMessagePayload> {
    HandshakeMessagePayload::read_version(r, ProtocolVersion::TLSv1_2)
  }
}

impl HandshakeMessagePayload {
  pub fn len(&self) -> usize {
    self.get_encoding().len()
  }

  pub fn build(typ: HandshakeType, payload: HandshakePayload) -> HandshakeMessagePayload {
    HandshakeMessagePayload {
      typ,
      dtls: None,
      payload,
    }
  }

  /// The synthetic message that replaces ClientHello1 in the transcript
  /// after a HelloRetryRequest.
  pub fn build_message_hash(hash: Vec<u8>) -> HandshakeMessagePayload {
    HandshakeMessagePayload {
      typ: HandshakeType::MessageHash,
      dtls: None,
      payload: HandshakePayload::MessageHash(Payload::new(hash)),
    }
  }

  pub fn read_version(r: &mut Reader, vers: ProtocolVersion) -> Option<HandshakeMessagePayload> {
    let typ = HandshakeType::read(r)?;
    let len = codec::read_u24(r)? as usize;

    let dtls = if vers.is_datagram() {
      let message_seq = codec::read_u16(r)?;
      let fragment_offset = codec::read_u24(r)?;
      let fragment_length = codec::read_u24(r)? as usize;

      // Reassembly is the record layer's job; only whole messages here.
      if fragment_offset != 0 || fragment_length != len {
        return None;
      }

      Some(DtlsFraming { message_seq })
    } else {
      None
    };

    let mut sub = r.sub(len)?;

    let (typ, payload) = match typ {
      HandshakeType::HelloRequest if sub.left() == 0 => (typ, HandshakePayload::HelloRequest),
      HandshakeType::ClientHello => (
        typ,
        HandshakePayload::ClientHello(ClientHelloPayload::read(&mut sub)?),
      ),
      HandshakeType::ServerHello => {
        // Look ahead at the random to distinguish a HelloRetryRequest.
        let version = ProtocolVersion::read(&mut sub)?;
        let random = Random::read(&mut sub)?;

        if random.0 == HELLO_RETRY_REQUEST_RANDOM {
          let mut hrr = HelloRetryRequest::read(&mut sub)?;
          hrr.legacy_version = version;
          (
            HandshakeType::HelloRetryRequest,
            HandshakePayload::HelloRetryRequest(hrr),
          )
        } else {
          let mut shp = ServerHelloPayload {
            legacy_version: version,
            random,
            session_id: SessionID::read(&mut sub)?,
            cipher_suite: CipherSuite::read(&mut sub)?,
            compression_method: Compression::read(&mut sub)?,
            extensions: Vec::new(),
          };
          if sub.any_left() {
            shp.extensions = codec::read_vec_u16::<ServerExtension>(&mut sub)?;
          }
          (typ, HandshakePayload::ServerHello(shp))
        }
      }
      HandshakeType::HelloVerifyRequest => (
        typ,
        HandshakePayload::HelloVerifyRequest(HelloVerifyRequestPayload::read(&mut sub)?),
      ),
      HandshakeType::Certificate if vers == ProtocolVersion::TLSv1_3 => (
        typ,
        HandshakePayload::CertificateTLS13(CertificatePayloadTLS13::read(&mut sub)?),
      ),
      HandshakeType::Certificate => (
        typ,
        HandshakePayload::Certificate(CertificatePayload::read(&mut sub)?),
      ),
      HandshakeType::ServerKeyExchange => (
        typ,
        HandshakePayload::ServerKeyExchange(ServerKeyExchangePayload::read(&mut sub)?),
      ),
      HandshakeType::ServerHelloDone if sub.left() == 0 => (typ, HandshakePayload::ServerHelloDone),
      HandshakeType::EndOfEarlyData if sub.left() == 0 => (typ, HandshakePayload::EndOfEarlyData),
      HandshakeType::ClientKeyExchange => (
        typ,
        HandshakePayload::ClientKeyExchange(Payload::read(&mut sub)?),
      ),
      HandshakeType::CertificateRequest if vers == ProtocolVersion::TLSv1_3 => (
        typ,
        HandshakePayload::CertificateRequestTLS13(CertificateRequestPayloadTLS13::read(&mut sub)?),
      ),
      HandshakeType::CertificateRequest => (
        typ,
        HandshakePayload::CertificateRequest(CertificateRequestPayload::read(&mut sub)?),
      ),
      HandshakeType::CertificateVerify => (
        typ,
        HandshakePayload::CertificateVerify(DigitallySignedStruct::read(&mut sub)?),
      ),
      HandshakeType::NewSessionTicket if vers == ProtocolVersion::TLSv1_3 => (
        typ,
        HandshakePayload::NewSessionTicketTLS13(NewSessionTicketPayloadTLS13::read(&mut sub)?),
      ),
      HandshakeType::NewSessionTicket => (
        typ,
        HandshakePayload::NewSessionTicket(NewSessionTicketPayload::read(&mut sub)?),
      ),
      HandshakeType::EncryptedExtensions => (
        typ,
        HandshakePayload::EncryptedExtensions(EncryptedExtensions::read(&mut sub)?),
      ),
      HandshakeType::KeyUpdate => (
        typ,
        HandshakePayload::KeyUpdate(KeyUpdateRequest::read(&mut sub)?),
      ),
      HandshakeType::Finished => (typ, HandshakePayload::Finished(Payload::read(&mut sub)?)),
      _ => (typ, HandshakePayload::Unknown(Payload::read(&mut sub)?)),
    };

    if sub.any_left() {
      return None;
    }

    Some(HandshakeMessagePayload { typ, dtls, payload })
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::msgs::enums::{CipherSuite, Compression, HandshakeType, ProtocolVersion};

  fn sample_client_hello() -> ClientHelloPayload {
    ClientHelloPayload {
      client_version: ProtocolVersion::TLSv1_2,
      random: Random([7u8; 32]),
      session_id: SessionID::new(&[1, 2, 3]),
      cookie: None,
      cipher_suites: vec![
        CipherSuite::TLS13_AES_128_GCM_SHA256,
        CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
      ],
      compression_methods: vec![Compression::Null],
      extensions: vec![
        ClientExtension::make_sni("example.com"),
        ClientExtension::NamedGroups(vec![NamedGroup::X25519, NamedGroup::secp256r1]),
        ClientExtension::SupportedVersions(vec![
          ProtocolVersion::TLSv1_3,
          ProtocolVersion::TLSv1_2,
        ]),
        ClientExtension::KeyShare(vec![KeyShareEntry::new(NamedGroup::X25519, &[0xab; 32])]),
        ClientExtension::ExtendedMasterSecretRequest,
        ClientExtension::PresharedKey(PresharedKeyOffer::new(
          PresharedKeyIdentity::new(b"ticket".to_vec(), 0x11223344),
          vec![0u8; 32],
        )),
      ],
    }
  }

  #[test]
  fn client_hello_round_trips() {
    let hmp = HandshakeMessagePayload::build(
      HandshakeType::ClientHello,
      HandshakePayload::ClientHello(sample_client_hello()),
    );
    let bytes = hmp.get_encoding();
    let parsed = HandshakeMessagePayload::read_bytes(&bytes).unwrap();
    assert_eq!(parsed, hmp);
    assert_eq!(parsed.get_encoding(), bytes);
  }

  #[test]
  fn binder_trailer_length_matches_encoding() {
    let ch = sample_client_hello();
    let offer = ch.get_psk().unwrap();

    // one 32-byte binder: u16 list length + (u8 length + 32)
    assert_eq!(offer.binders_encoded_len(), 2 + 1 + 32);
    assert!(ch.psk_offered_last());
  }

  #[test]
  fn session_id_over_32_bytes_rejected() {
    let mut bytes = vec![33u8];
    bytes.extend_from_slice(&[0u8; 33]);
    assert_eq!(SessionID::read_bytes(&bytes), None);
  }

  #[test]
  fn duplicate_extensions_detected() {
    let mut ch = sample_client_hello();
    ch.extensions
      .push(ClientExtension::ExtendedMasterSecretRequest);
    assert!(ch.has_duplicate_extension());
  }

  #[test]
  fn hrr_detected_by_reserved_random() {
    let hrr = HelloRetryRequest {
      legacy_version: ProtocolVersion::TLSv1_2,
      session_id: SessionID::empty(),
      cipher_suite: CipherSuite::TLS13_AES_128_GCM_SHA256,
      extensions: vec![
        HelloRetryExtension::SupportedVersions(ProtocolVersion::TLSv1_3),
        HelloRetryExtension::KeyShare(NamedGroup::X25519),
      ],
    };
    let hmp = HandshakeMessagePayload::build(
      HandshakeType::HelloRetryRequest,
      HandshakePayload::HelloRetryRequest(hrr),
    );

    let bytes = hmp.get_encoding();
    // on the wire it's a ServerHello
    assert_eq!(bytes[0], HandshakeType::ServerHello.get_u8());

    let parsed = HandshakeMessagePayload::read_bytes(&bytes).unwrap();
    assert_eq!(parsed.typ, HandshakeType::HelloRetryRequest);
    match parsed.payload {
      HandshakePayload::HelloRetryRequest(parsed_hrr) => {
        assert_eq!(
          parsed_hrr.get_requested_key_share_group(),
          Some(NamedGroup::X25519)
        );
      }
      _ => panic!("parsed as wrong payload"),
    }
  }

  #[test]
  fn dtls_framing_round_trips_and_rejects_fragments() {
    let mut hmp = HandshakeMessagePayload::build(
      HandshakeType::ClientHello,
      HandshakePayload::ClientHello(ClientHelloPayload {
        client_version: ProtocolVersion::DTLSv1_2,
        random: Random([9u8; 32]),
        session_id: SessionID::empty(),
        cookie: Some(PayloadU8::new(b"cookie!".to_vec())),
        cipher_suites: vec![CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256],
        compression_methods: vec![Compression::Null],
        extensions: Vec::new(),
      }),
    );
    hmp.dtls = Some(DtlsFraming { message_seq: 1 });

    let bytes = hmp.get_encoding();
    let mut rd = Reader::init(&bytes);
    let parsed = HandshakeMessagePayload::read_version(&mut rd, ProtocolVersion::DTLSv1_2).unwrap();
    assert_eq!(parsed, hmp);

    // corrupt the fragment length: must fail
    let mut broken = bytes.clone();
    broken[11] = broken[11].wrapping_add(1);
    let mut rd = Reader::init(&broken);
    assert!(HandshakeMessagePayload::read_version(&mut rd, ProtocolVersion::DTLSv1_2).is_none());
  }

  #[test]
  fn server_hello_downgrade_sentinel() {
    let mut random = [4u8; 32];
    random[24..].copy_from_slice(&DOWNGRADE_SENTINEL_TLS12);
    assert!(Random(random).has_downgrade_sentinel());
    assert!(!Random([4u8; 32]).has_downgrade_sentinel());
  }
}
