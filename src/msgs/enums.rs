#![allow(non_camel_case_types)]
use crate::msgs::codec;
use crate::msgs::codec::{Codec, Reader};

macro_rules! enum_builder {
  (@U8 EnumName: $name:ident; EnumVal { $( $var:ident => $val:expr ),* $(,)? }) => {
    #[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
    pub enum $name {
      $( $var, )*
      Unknown(u8)
    }

    impl $name {
      pub fn get_u8(&self) -> u8 {
        match *self {
          $( $name::$var => $val, )*
          $name::Unknown(v) => v
        }
      }
    }

    impl Codec for $name {
      fn encode(&self, bytes: &mut Vec<u8>) {
        codec::encode_u8(self.get_u8(), bytes);
      }

      fn read(r: &mut Reader) -> Option<Self> {
        Some(match codec::read_u8(r)? {
          $( $val => $name::$var, )*
          v => $name::Unknown(v)
        })
      }
    }
  };

  (@U16 EnumName: $name:ident; EnumVal { $( $var:ident => $val:expr ),* $(,)? }) => {
    #[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
    pub enum $name {
      $( $var, )*
      Unknown(u16)
    }

    impl $name {
      pub fn get_u16(&self) -> u16 {
        match *self {
          $( $name::$var => $val, )*
          $name::Unknown(v) => v
        }
      }
    }

    impl Codec for $name {
      fn encode(&self, bytes: &mut Vec<u8>) {
        codec::encode_u16(self.get_u16(), bytes);
      }

      fn read(r: &mut Reader) -> Option<Self> {
        Some(match codec::read_u16(r)? {
          $( $val => $name::$var, )*
          v => $name::Unknown(v)
        })
      }
    }
  };
}

enum_builder! {@U16
  EnumName: ProtocolVersion;
  EnumVal {
    TLCPv1_1 => 0x0101,
    TLSv1_2 => 0x0303,
    TLSv1_3 => 0x0304,
    DTLSv1_2 => 0xfefd
  }
}

impl ProtocolVersion {
  /// Whether this version frames handshake messages the DTLS way.
  pub fn is_datagram(&self) -> bool {
    matches!(self, ProtocolVersion::DTLSv1_2)
  }

  /// TLCP and DTLS 1.2 both follow the TLS 1.2 handshake shape.
  pub fn is_tls12_family(&self) -> bool {
    matches!(
      self,
      ProtocolVersion::TLSv1_2 | ProtocolVersion::DTLSv1_2 | ProtocolVersion::TLCPv1_1
    )
  }
}

enum_builder! {@U8
  EnumName: HandshakeType;
  EnumVal {
    HelloRequest => 0,
    ClientHello => 1,
    ServerHello => 2,
    HelloRetryRequest => 2,
    HelloVerifyRequest => 3,
    NewSessionTicket => 4,
    EndOfEarlyData => 5,
    EncryptedExtensions => 8,
    Certificate => 11,
    ServerKeyExchange => 12,
    CertificateRequest => 13,
    ServerHelloDone => 14,
    CertificateVerify => 15,
    ClientKeyExchange => 16,
    Finished => 20,
    KeyUpdate => 24,
    MessageHash => 254
  }
}

enum_builder! {@U8
  EnumName: ContentType;
  EnumVal {
    ChangeCipherSpec => 20,
    Alert => 21,
    Handshake => 22,
    ApplicationData => 23
  }
}

enum_builder! {@U8
  EnumName: AlertLevel;
  EnumVal {
    Warning => 1,
    Fatal => 2
  }
}

enum_builder! {@U8
  EnumName: AlertDescription;
  EnumVal {
    CloseNotify => 0,
    UnexpectedMessage => 10,
    BadRecordMac => 20,
    RecordOverflow => 22,
    HandshakeFailure => 40,
    BadCertificate => 42,
    UnsupportedCertificate => 43,
    CertificateRevoked => 44,
    CertificateExpired => 45,
    CertificateUnknown => 46,
    IllegalParameter => 47,
    UnknownCA => 48,
    AccessDenied => 49,
    DecodeError => 50,
    DecryptError => 51,
    ProtocolVersion => 70,
    InsufficientSecurity => 71,
    InternalError => 80,
    UserCanceled => 90,
    NoRenegotiation => 100,
    MissingExtension => 109,
    UnsupportedExtension => 110,
    UnrecognisedName => 112,
    BadCertificateStatusResponse => 113,
    UnknownPSKIdentity => 115,
    CertificateRequired => 116,
    NoApplicationProtocol => 120
  }
}

enum_builder! {@U16
  EnumName: ExtensionType;
  EnumVal {
    ServerName => 0,
    EllipticCurves => 10,
    ECPointFormats => 11,
    SignatureAlgorithms => 13,
    ALProtocolNegotiation => 16,
    EncryptThenMac => 22,
    ExtendedMasterSecret => 23,
    SessionTicket => 35,
    PreSharedKey => 41,
    EarlyData => 42,
    SupportedVersions => 43,
    Cookie => 44,
    PSKKeyExchangeModes => 45,
    PostHandshakeAuth => 49,
    KeyShare => 51,
    RenegotiationInfo => 0xff01
  }
}

enum_builder! {@U16
  EnumName: CipherSuite;
  EnumVal {
    TLS_RSA_WITH_AES_128_CBC_SHA256 => 0x003c,
    TLS_RSA_WITH_AES_128_GCM_SHA256 => 0x009c,
    TLS_RSA_WITH_AES_256_GCM_SHA384 => 0x009d,
    TLS_DHE_RSA_WITH_AES_128_GCM_SHA256 => 0x009e,
    TLS_PSK_WITH_AES_128_GCM_SHA256 => 0x00a8,
    TLS_DHE_PSK_WITH_AES_128_GCM_SHA256 => 0x00aa,
    TLS_RSA_PSK_WITH_AES_128_GCM_SHA256 => 0x00ac,
    TLS_EMPTY_RENEGOTIATION_INFO_SCSV => 0x00ff,
    TLS13_AES_128_GCM_SHA256 => 0x1301,
    TLS13_AES_256_GCM_SHA384 => 0x1302,
    TLS13_CHACHA20_POLY1305_SHA256 => 0x1303,
    TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256 => 0xc027,
    TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256 => 0xc02b,
    TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384 => 0xc02c,
    TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256 => 0xc02f,
    TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384 => 0xc030,
    TLS_ECDHE_PSK_WITH_AES_128_CBC_SHA256 => 0xc037,
    TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256 => 0xcca8,
    TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256 => 0xcca9,
    TLCP_ECC_SM4_128_CBC_SM3 => 0xe013,
    TLCP_ECC_SM4_128_GCM_SM3 => 0xe053
  }
}

enum_builder! {@U8
  EnumName: Compression;
  EnumVal {
    Null => 0
  }
}

enum_builder! {@U16
  EnumName: NamedGroup;
  EnumVal {
    secp256r1 => 23,
    secp384r1 => 24,
    secp521r1 => 25,
    X25519 => 29,
    CurveSM2 => 41,
    FFDHE2048 => 256,
    FFDHE3072 => 257
  }
}

impl NamedGroup {
  pub fn is_ffdhe(&self) -> bool {
    matches!(self, NamedGroup::FFDHE2048 | NamedGroup::FFDHE3072)
  }
}

enum_builder! {@U8
  EnumName: HashAlgorithm;
  EnumVal {
    NONE => 0,
    MD5 => 1,
    SHA1 => 2,
    SHA224 => 3,
    SHA256 => 4,
    SHA384 => 5,
    SHA512 => 6,
    SM3 => 7
  }
}

enum_builder! {@U8
  EnumName: SignatureAlgorithm;
  EnumVal {
    Anonymous => 0,
    RSA => 1,
    DSA => 2,
    ECDSA => 3,
    ED25519 => 7,
    SM2 => 8
  }
}

enum_builder! {@U16
  EnumName: SignatureScheme;
  EnumVal {
    RSA_PKCS1_SHA1 => 0x0201,
    ECDSA_SHA1_Legacy => 0x0203,
    RSA_PKCS1_SHA256 => 0x0401,
    ECDSA_NISTP256_SHA256 => 0x0403,
    RSA_PKCS1_SHA384 => 0x0501,
    ECDSA_NISTP384_SHA384 => 0x0503,
    RSA_PKCS1_SHA512 => 0x0601,
    ECDSA_NISTP521_SHA512 => 0x0603,
    SM2SIG_SM3 => 0x0708,
    RSA_PSS_SHA256 => 0x0804,
    RSA_PSS_SHA384 => 0x0805,
    RSA_PSS_SHA512 => 0x0806,
    ED25519 => 0x0807
  }
}

enum_builder! {@U8
  EnumName: ECPointFormat;
  EnumVal {
    Uncompressed => 0,
    ANSIX962CompressedPrime => 1,
    ANSIX962CompressedChar2 => 2
  }
}

enum_builder! {@U8
  EnumName: ECCurveType;
  EnumVal {
    ExplicitPrime => 1,
    ExplicitChar2 => 2,
    NamedCurve => 3
  }
}

enum_builder! {@U8
  EnumName: ClientCertificateType;
  EnumVal {
    RSASign => 1,
    DSSSign => 2,
    ECDSASign => 64
  }
}

enum_builder! {@U8
  EnumName: ServerNameType;
  EnumVal {
    HostName => 0
  }
}

enum_builder! {@U8
  EnumName: PSKKeyExchangeMode;
  EnumVal {
    PSK_KE => 0,
    PSK_DHE_KE => 1
  }
}

enum_builder! {@U8
  EnumName: KeyUpdateRequest;
  EnumVal {
    UpdateNotRequested => 0,
    UpdateRequested => 1
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::msgs::codec::Codec;

  #[test]
  fn enums_round_trip_and_preserve_unknown() {
    let bytes = AlertDescription::UnknownPSKIdentity.get_encoding();
    assert_eq!(bytes, vec![115]);
    assert_eq!(
      AlertDescription::read_bytes(&bytes),
      Some(AlertDescription::UnknownPSKIdentity)
    );

    let unknown = ExtensionType::read_bytes(&[0x12, 0x34]).unwrap();
    assert_eq!(unknown, ExtensionType::Unknown(0x1234));
    assert_eq!(unknown.get_encoding(), vec![0x12, 0x34]);
  }

  #[test]
  fn version_families() {
    assert!(ProtocolVersion::DTLSv1_2.is_datagram());
    assert!(ProtocolVersion::TLCPv1_1.is_tls12_family());
    assert!(!ProtocolVersion::TLSv1_3.is_tls12_family());
  }
}
