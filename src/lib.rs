//! petrel — a TLS/DTLS protocol core.
//!
//! This crate implements the record layer, handshake state machines and
//! key schedule for TLS 1.2, TLS 1.3, DTLS 1.0/1.2 and the DTLS 1.3
//! record layer. Cryptographic primitives come from *ring*; certificate
//! chain validation from *webpki*. The library performs no I/O of its
//! own: callers feed transport bytes in and drain queued bytes out, and
//! drive the handshake until it reports completion or a wait condition
//! they must satisfy (see [`Wait`]).
//!
//! ```no_run
//! use std::sync::Arc;
//! use petrel::{ClientConfig, ClientConnection, RootCertStore, WebPkiServerVerifier};
//!
//! let roots = RootCertStore::empty();
//! let config = ClientConfig::new(Arc::new(WebPkiServerVerifier::new(roots)));
//! let mut conn = ClientConnection::new(Arc::new(config), "example.com").unwrap();
//! // read_tls / process_new_packets / write_tls against a socket ...
//! ```

mod cipher;
mod client;
mod client_hs;
mod client_tls13;
mod conn;
mod error;
mod handoff;
mod hash_hs;
mod key_schedule;
mod prf;
mod rand;
mod record_layer;
mod server;
mod server_hs;
mod server_tls13;
mod session;
mod sign;
mod suites;
mod ticketer;
mod util;
mod verify;

pub mod dtls;
pub mod msgs;

pub use crate::cipher::{AeadContext, CipherForm, Direction};
pub use crate::client::{ClientConfig, ClientConnection, RenegotiationMode};
pub use crate::conn::Wait;
pub use crate::dtls::TimeoutOutcome;
pub use crate::error::Error;
pub use crate::key_schedule::{KeySchedule, SecretKind};
pub use crate::msgs::enums::{
    AlertDescription, CipherSuite, ContentType, HandshakeType, NamedGroup, ProtocolVersion,
    SignatureScheme,
};
pub use crate::msgs::persist::SessionValue;
pub use crate::rand::{Rng, SystemRng};
pub use crate::server::{ServerConfig, ServerConnection, VerifyMode};
pub use crate::session::{
    ClientSessionStore, ServerSessionCache, Session, SessionCacheMode,
};
pub use crate::sign::{
    AlwaysResolvesChain, CertResolution, CertifiedKey, EcdsaSigningKey, Ed25519SigningKey,
    ResolvesServerCert, RsaSigningKey, SigningKey,
};
pub use crate::suites::{
    SupportedCipherSuite, ALL_CIPHERSUITES, TLS13_AES_128_GCM_SHA256, TLS13_AES_256_GCM_SHA384,
    TLS13_CHACHA20_POLY1305_SHA256, TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256, TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384, TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
};
pub use crate::ticketer::{AeadTicketer, NoTickets, ProducesTickets};
pub use crate::verify::{
    AllowAnyAuthenticatedClient, ClientCertVerifier, NoClientAuth, RootCertStore,
    ServerCertVerifier, WebPkiServerVerifier,
};

/// Test-only helpers exposed for the integration suite.
#[doc(hidden)]
pub mod internal {
    pub use crate::rand::FixedRng;
    pub use crate::sign::DeferredSigningKey;
    pub use crate::verify::DangerousAcceptAnyServerCert;
}
