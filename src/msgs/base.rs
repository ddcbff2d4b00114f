use crate::msgs::codec;
use crate::msgs::codec::{Codec, Reader};

/// An arbitrary, unknown-content, u24-length-prefixed payload.
///
/// The variants without a prefix (`Payload`) consume to end-of-message.
#[derive(Clone, Debug, PartialEq)]
pub struct Payload(pub Vec<u8>);

impl Codec for Payload {
  fn encode(&self, bytes: &mut Vec<u8>) {
    bytes.extend_from_slice(&self.0);
  }

  fn read(r: &mut Reader) -> Option<Payload> {
    Some(Payload(r.rest().to_vec()))
  }
}

impl Payload {
  pub fn new(bytes: Vec<u8>) -> Payload {
    Payload(bytes)
  }

  pub fn empty() -> Payload {
    Payload(Vec::new())
  }
}

/// An arbitrary, unknown-content, u8-length-prefixed payload.
#[derive(Clone, Debug, PartialEq)]
pub struct PayloadU8(pub Vec<u8>);

impl PayloadU8 {
  pub fn new(bytes: Vec<u8>) -> PayloadU8 {
    PayloadU8(bytes)
  }

  pub fn empty() -> PayloadU8 {
    PayloadU8(Vec::new())
  }
}

impl Codec for PayloadU8 {
  fn encode(&self, bytes: &mut Vec<u8>) {
    debug_assert!(self.0.len() <= 0xff);
    codec::encode_u8(self.0.len() as u8, bytes);
    bytes.extend_from_slice(&self.0);
  }

  fn read(r: &mut Reader) -> Option<PayloadU8> {
    let len = codec::read_u8(r)? as usize;
    let body = r.take(len)?;
    Some(PayloadU8(body.to_vec()))
  }
}

/// An arbitrary, unknown-content, u16-length-prefixed payload.
#[derive(Clone, Debug, PartialEq)]
pub struct PayloadU16(pub Vec<u8>);

impl PayloadU16 {
  pub fn new(bytes: Vec<u8>) -> PayloadU16 {
    PayloadU16(bytes)
  }

  pub fn empty() -> PayloadU16 {
    PayloadU16(Vec::new())
  }
}

impl Codec for PayloadU16 {
  fn encode(&self, bytes: &mut Vec<u8>) {
    debug_assert!(self.0.len() <= 0xffff);
    codec::encode_u16(self.0.len() as u16, bytes);
    bytes.extend_from_slice(&self.0);
  }

  fn read(r: &mut Reader) -> Option<PayloadU16> {
    let len = codec::read_u16(r)? as usize;
    let body = r.take(len)?;
    Some(PayloadU16(body.to_vec()))
  }
}

/// An arbitrary, unknown-content, u24-length-prefixed payload.
#[derive(Clone, Debug, PartialEq)]
pub struct PayloadU24(pub Vec<u8>);

impl PayloadU24 {
  pub fn new(bytes: Vec<u8>) -> PayloadU24 {
    PayloadU24(bytes)
  }
}

impl Codec for PayloadU24 {
  fn encode(&self, bytes: &mut Vec<u8>) {
    debug_assert!(self.0.len() <= 0xff_ffff);
    codec::encode_u24(self.0.len() as u32, bytes);
    bytes.extend_from_slice(&self.0);
  }

  fn read(r: &mut Reader) -> Option<PayloadU24> {
    let len = codec::read_u24(r)? as usize;
    let body = r.take(len)?;
    Some(PayloadU24(body.to_vec()))
  }
}
