//! Mutual TLS with intent-based authorization.
//!
//! # Architecture
//!
//! ```text
//! TCP connection
//!   → TLS handshake  (rustls calls IntentVerifier)
//!       → webpki validates the chain against the client CA pool
//!       → intent decoded from the SAN otherName
//!       → lease lookup / remote authorization
//!   → relay to backend
//! ```
//!
//! # Modules
//!
//! - [`config`] — YAML configuration of TLS material (`TlsConfig`)
//! - [`intent`] — SAN `otherName` decoding (`extract_intent`)
//! - [`verifier`] — rustls `ClientCertVerifier` (`IntentVerifier`)
//! - [`cert_manager`] — rustls config building and certificate generation CLI helpers

pub mod cert_manager;
pub mod config;
pub mod intent;
pub mod verifier;

pub use cert_manager::{
    CaParams, CertGenerator, GeneratedCert, ServerIdentity, build_server_config,
    build_webpki_verifier, load_certs, load_crls, load_private_key,
};
pub use config::TlsConfig;
pub use intent::{Intent, extract_intent};
pub use verifier::{Admission, IntentVerifier};
