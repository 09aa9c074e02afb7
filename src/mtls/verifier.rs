//! Client certificate verification with intent authorization.
//!
//! Plugged into rustls as the [`ClientCertVerifier`] of the listener.
//! Every handshake runs, in order:
//!
//! ```text
//! chain validation (webpki, CA pool + CRL)
//!   → intent extraction from the SAN
//!   → lease lookup ── valid ──→ accept
//!   → remote authorization ── denied / unreachable ──→ reject
//!   → lease recorded → accept
//! ```
//!
//! The lease lock is never held across the remote call. Any failure is
//! reported to rustls as an invalid certificate, which aborts the handshake.

use std::fmt;
use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, OtherError, SignatureScheme};
use tracing::{debug, info, warn};

use super::intent::extract_intent;
use crate::authz::Authorizer;
use crate::lease::{Fingerprint, LeaseCache};
use crate::{Error, Result};

/// How an accepted handshake was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A valid lease already covered the certificate.
    Leased,
    /// The authorization service approved the intent just now.
    Authorized,
}

/// rustls client verifier that gates handshakes on an authorized intent.
pub struct IntentVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    leases: Arc<LeaseCache>,
    authorizer: Arc<dyn Authorizer>,
    user: u64,
}

impl IntentVerifier {
    /// Create a verifier.
    ///
    /// `inner` performs chain validation; `user` is the identifier reported
    /// to the authorization service alongside each intent.
    pub fn new(
        inner: Arc<dyn ClientCertVerifier>,
        leases: Arc<LeaseCache>,
        authorizer: Arc<dyn Authorizer>,
        user: u64,
    ) -> Self {
        Self {
            inner,
            leases,
            authorizer,
            user,
        }
    }

    /// Identifier reported to the authorization service.
    pub fn user(&self) -> u64 {
        self.user
    }

    /// Decide on an already chain-validated certificate chain (leaf first).
    ///
    /// # Errors
    ///
    /// Any intent parsing error, or the authorizer's denial or failure.
    pub fn decide(&self, chain: &[CertificateDer<'_>]) -> Result<Admission> {
        let intent = extract_intent(&[chain])?;
        let der = intent.certificate.as_ref();
        let fingerprint = Fingerprint::of(der);

        if self.leases.check_valid(der) {
            debug!(%fingerprint, intent = %intent.value, "Lease valid, skipping authorization");
            return Ok(Admission::Leased);
        }

        self.authorizer.authorize(&intent.value, self.user)?;
        self.leases.insert(der);

        info!(
            %fingerprint,
            intent = %intent.value,
            user = self.user,
            leases = self.leases.len(),
            "Intent authorized, lease granted"
        );
        Ok(Admission::Authorized)
    }
}

impl fmt::Debug for IntentVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntentVerifier")
            .field("authorizer", &self.authorizer)
            .field("lease_duration", &self.leases.duration())
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl ClientCertVerifier for IntentVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        let verified = self
            .inner
            .verify_client_cert(end_entity, intermediates, now)
            .inspect_err(|e| warn!(error = %e, "Client certificate chain rejected"))?;

        let mut chain = Vec::with_capacity(1 + intermediates.len());
        chain.push(end_entity.clone());
        chain.extend(intermediates.iter().cloned());

        match self.decide(&chain) {
            Ok(_) => Ok(verified),
            Err(e) => {
                if e.is_parse_error() {
                    warn!(error = %e, "Client certificate carries no usable intent");
                } else {
                    warn!(error = %e, "Client intent rejected");
                }
                Err(rejection(e))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn rejection(err: Error) -> rustls::Error {
    rustls::Error::InvalidCertificate(CertificateError::Other(OtherError(Arc::new(err))))
}
