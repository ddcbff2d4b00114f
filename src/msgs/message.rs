use crate::msgs::alert::AlertMessagePayload;
use crate::msgs::base::Payload;
use crate::msgs::codec::{Codec, Reader};
use crate::msgs::enums::{AlertDescription, AlertLevel, ContentType, HandshakeType};
use crate::msgs::enums::ProtocolVersion;
use crate::msgs::handshake::HandshakeMessagePayload;

#[derive(Clone, Debug, PartialEq)]
pub struct ChangeCipherSpecPayload;

impl Codec for ChangeCipherSpecPayload {
  fn encode(&self, bytes: &mut Vec<u8>) {
    bytes.push(1);
  }

  fn read(r: &mut Reader) -> Option<ChangeCipherSpecPayload> {
    let typ = r.take(1)?;

    if typ[0] == 1 && !r.any_left() {
      Some(ChangeCipherSpecPayload)
    } else {
      None
    }
  }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MessagePayload {
  Alert(AlertMessagePayload),
  Handshake(HandshakeMessagePayload),
  ChangeCipherSpec(ChangeCipherSpecPayload),
  Opaque(Payload),
}

impl MessagePayload {
  pub fn encode(&self, bytes: &mut Vec<u8>) {
    match *self {
      MessagePayload::Alert(ref x) => x.encode(bytes),
      MessagePayload::Handshake(ref x) => x.encode(bytes),
      MessagePayload::ChangeCipherSpec(ref x) => x.encode(bytes),
      MessagePayload::Opaque(ref x) => x.encode(bytes),
    }
  }
}

/// One protocol message, already freed of record framing by the record
/// layer.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
  pub typ: ContentType,
  pub version: ProtocolVersion,
  pub payload: MessagePayload,
}

impl Message {
  /// Parse the record layer's output into a typed message.  `version` is
  /// the version the connection is operating under: it chooses between
  /// the TLS 1.2, TLS 1.3 and DTLS readings of the handshake framing.
  pub fn parse(typ: ContentType, version: ProtocolVersion, bytes: &[u8]) -> Option<Message> {
    let mut r = Reader::init(bytes);

    let payload = match typ {
      ContentType::Alert => MessagePayload::Alert(AlertMessagePayload::read(&mut r)?),
      ContentType::Handshake => {
        MessagePayload::Handshake(HandshakeMessagePayload::read_version(&mut r, version)?)
      }
      ContentType::ChangeCipherSpec => {
        MessagePayload::ChangeCipherSpec(ChangeCipherSpecPayload::read(&mut r)?)
      }
      ContentType::ApplicationData => MessagePayload::Opaque(Payload::read(&mut r)?),
      ContentType::Unknown(_) => return None,
    };

    if r.any_left() {
      return None;
    }

    Some(Message {
      typ,
      version,
      payload,
    })
  }

  pub fn is_content_type(&self, typ: ContentType) -> bool {
    self.typ == typ
  }

  pub fn is_handshake_type(&self, hstyp: HandshakeType) -> bool {
    match self.payload {
      MessagePayload::Handshake(ref hsp) => hsp.typ == hstyp,
      _ => false,
    }
  }

  pub fn handshake_type(&self) -> Option<HandshakeType> {
    match self.payload {
      MessagePayload::Handshake(ref hsp) => Some(hsp.typ),
      _ => None,
    }
  }

  pub fn take_opaque_payload(&mut self) -> Option<Payload> {
    if let MessagePayload::Opaque(ref mut op) = self.payload {
      Some(Payload(std::mem::take(&mut op.0)))
    } else {
      None
    }
  }

  pub fn build_alert(level: AlertLevel, desc: AlertDescription) -> Message {
    Message {
      typ: ContentType::Alert,
      version: ProtocolVersion::TLSv1_2,
      payload: MessagePayload::Alert(AlertMessagePayload {
        level,
        description: desc,
      }),
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn ccs_wants_exactly_one_byte() {
    assert!(ChangeCipherSpecPayload::read_bytes(&[1]).is_some());
    assert!(ChangeCipherSpecPayload::read_bytes(&[2]).is_none());
    assert!(ChangeCipherSpecPayload::read_bytes(&[1, 1]).is_none());
  }

  #[test]
  fn trailing_garbage_rejected() {
    let alert = Message::build_alert(AlertLevel::Fatal, AlertDescription::DecodeError).payload;
    let mut bytes = Vec::new();
    alert.encode(&mut bytes);
    bytes.push(0);
    assert!(Message::parse(ContentType::Alert, ProtocolVersion::TLSv1_2, &bytes).is_none());
  }
}
