use crate::msgs::enums::{AlertDescription, ContentType, HandshakeType};
use crate::provider::{CertError, ProviderError};

/// The reasons a connection could fail, in terms a caller can match on.
///
/// Every variant that corresponds to a protocol violation maps onto the
/// fatal alert the state machine sends before giving up; see
/// [`Error::alert`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
  /// We received a message of the wrong content type for our state.
  #[error("received {got_type:?} message while expecting {expect_types:?}")]
  InappropriateMessage {
    expect_types: Vec<ContentType>,
    got_type: ContentType,
  },

  /// We received a handshake message of the wrong kind for our state.
  #[error("received {got_type:?} handshake message while expecting {expect_types:?}")]
  InappropriateHandshakeMessage {
    expect_types: Vec<HandshakeType>,
    got_type: HandshakeType,
  },

  /// The wire bytes could not be decoded as the expected structure.
  #[error("cannot decode message: {0}")]
  DecodeError(&'static str),

  /// Version selection failed, or a downgrade sentinel tripped.
  #[error("no acceptable protocol version")]
  ProtocolVersion,

  /// The peer sent an extension we did not offer or cannot accept.
  #[error("unsupported extension: {0}")]
  UnsupportedExtension(&'static str),

  /// The peer omitted an extension the negotiated parameters require.
  #[error("missing extension: {0}")]
  MissingExtension(&'static str),

  /// A field value was outside its legal range for this negotiation.
  #[error("illegal parameter: {0}")]
  IllegalParameter(&'static str),

  /// No common cipher suite, group or signature scheme.
  #[error("handshake failure: {0}")]
  HandshakeFailure(&'static str),

  /// The peer violated the protocol in a way with no better description.
  #[error("peer misbehaved: {0}")]
  PeerMisbehaved(&'static str),

  /// A Finished or PSK binder check failed.
  #[error("verify data or binder mismatch")]
  DecryptError,

  /// Certificate processing failed.
  #[error("certificate error: {0}")]
  Certificate(#[from] CertError),

  /// No offered PSK identity was acceptable and policy forbids continuing.
  #[error("no acceptable PSK identity")]
  UnknownPskIdentity,

  /// The application callback rejected the handshake.
  #[error("rejected by application callback")]
  RejectedByCallback(AlertDescription),

  /// The peer sent us a fatal alert.
  #[error("received fatal alert: {0:?}")]
  AlertReceived(AlertDescription),

  /// An operation that needs a completed handshake was called early.
  #[error("handshake not complete")]
  HandshakeNotComplete,

  /// A collaborator failed in a way we cannot map to a protocol alert.
  #[error("internal error: {0}")]
  Internal(&'static str),

  /// The crypto provider reported a failure.
  #[error("crypto provider error: {0}")]
  Provider(#[from] ProviderError),
}

impl Error {
  /// The fatal alert this error is reported to the peer as.
  pub fn alert(&self) -> AlertDescription {
    match self {
      Error::InappropriateMessage { .. } | Error::InappropriateHandshakeMessage { .. } => {
        AlertDescription::UnexpectedMessage
      }
      Error::DecodeError(_) => AlertDescription::DecodeError,
      Error::ProtocolVersion => AlertDescription::ProtocolVersion,
      Error::UnsupportedExtension(_) => AlertDescription::UnsupportedExtension,
      Error::MissingExtension(_) => AlertDescription::MissingExtension,
      Error::IllegalParameter(_) => AlertDescription::IllegalParameter,
      Error::HandshakeFailure(_) | Error::PeerMisbehaved(_) => AlertDescription::HandshakeFailure,
      Error::DecryptError => AlertDescription::DecryptError,
      Error::Certificate(ce) => ce.alert(),
      Error::UnknownPskIdentity => AlertDescription::UnknownPSKIdentity,
      Error::RejectedByCallback(alert) => *alert,
      Error::AlertReceived(_)
      | Error::HandshakeNotComplete
      | Error::Internal(_)
      | Error::Provider(_) => AlertDescription::InternalError,
    }
  }
}

#[cfg(test)]
mod test {
  use super::Error;
  use crate::msgs::enums::AlertDescription;

  #[test]
  fn errors_map_to_alerts() {
    assert_eq!(
      Error::DecodeError("x").alert(),
      AlertDescription::DecodeError
    );
    assert_eq!(Error::DecryptError.alert(), AlertDescription::DecryptError);
    assert_eq!(
      Error::IllegalParameter("x").alert(),
      AlertDescription::IllegalParameter
    );
    assert_eq!(
      Error::Internal("x").alert(),
      AlertDescription::InternalError
    );
  }
}
