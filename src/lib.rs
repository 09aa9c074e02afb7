//! Intent Proxy Library
//!
//! Mutual-TLS terminating proxy for database backends. Client certificates
//! carry an authorization *intent* in their Subject Alternative Name; the
//! proxy approves it against an external authorization service during the
//! handshake and then relays bytes to the backend unchanged.
//!
//! # Features
//!
//! - **Intent extraction**: strict decoding of the SAN `otherName` entry
//! - **Leases**: approvals are honoured for 10 seconds per certificate
//! - **Fail closed**: denials, timeouts and unreachable services all reject
//! - **Transparent relay**: half-close propagation, both sockets closed exactly once

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod authz;
pub mod cli;
pub mod config;
pub mod error;
pub mod lease;
pub mod mtls;
pub mod relay;
pub mod server;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns `Error::Config` if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    }
    .map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))
}
