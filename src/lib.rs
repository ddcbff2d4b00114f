//! veiltls is a handshake-layer TLS engine.  It owns version, cipher-suite
//! and extension negotiation, the per-connection handshake state machines
//! for TLS 1.2, TLS 1.3, DTLS 1.2 and TLCP 1.1, session resumption by
//! session-ID and by ticket, renegotiation and TLS 1.3 post-handshake
//! messages.
//!
//! It deliberately does not own record framing, X.509 processing or
//! primitive cryptography: those arrive through the `RecordLayer`,
//! `CertVerifier` and `CryptoProvider` traits in [`provider`].  A default
//! `CryptoProvider` backed by *ring* is included.
//!
//! The entry points are [`LibContext`], [`ClientConfig`]/[`ServerConfig`],
//! and [`ClientSession`]/[`ServerSession`] driven through their `step()`
//! method.

#[macro_use]
mod log;

pub mod msgs;

mod cache;
mod client;
mod client_hs;
mod error;
mod hash_hs;
mod key_schedule;
mod kx;
mod negotiation;
pub mod provider;
mod server;
mod server_hs;
mod session;
pub mod suites;
mod ticketer;
mod util;

pub use crate::cache::SessionCache;
pub use crate::client::{ClientConfig, ClientSession, ExternalPsk, PskClientCallback};
pub use crate::error::Error;
pub use crate::msgs::enums::{
  AlertDescription, AlertLevel, CipherSuite, ContentType, HandshakeType, HashAlgorithm,
  NamedGroup, ProtocolVersion, SignatureScheme,
};
pub use crate::msgs::persist::SessionValue;
pub use crate::negotiation::VersionRange;
pub use crate::provider::{
  ActiveKeyExchange, CertError, CertUsage, CertVerifier, CryptoProvider, Decrypter,
  DirectionKeys, HashContext, KeyTransport, ProviderError, RecordLayer, RingProvider, Signer,
};
pub use crate::server::{
  AlpnDecision, AlwaysResolvesChain, ClientAuthMode, ResolvesNoCert, ResolvesServerCert,
  ServerConfig, ServerExternalPsk, ServerIdentity, ServerSession,
};
pub use crate::session::{CallbackAction, ErrorOrigin, LibContext, SessionCacheMode, Status};
pub use crate::suites::{BulkAlgorithm, SupportedCipherSuite};
pub use crate::ticketer::{TicketRotator, TimeBase};
