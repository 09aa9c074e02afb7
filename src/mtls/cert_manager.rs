//! Certificate management — loading, rustls config building, and CLI helpers.
//!
//! Provides:
//! - [`ServerIdentity`] — the proxy's own certificate chain, key and serial
//! - [`build_server_config`] — a TLS 1.3 `rustls::ServerConfig` around a client verifier
//! - [`build_webpki_verifier`] — chain validation against the trusted client CA pool
//! - [`load_certs`] / [`load_private_key`] / [`load_crls`] — PEM file loading
//! - [`CertGenerator`] — `rcgen`-backed generation for `intent-proxy cert` commands
//!
//! # File format
//!
//! All certificate and key files are expected in **PEM format**.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use rcgen::string::Ia5String;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, OtherNameValue, SanType, SerialNumber, date_time_ymd,
};
use rustls::ServerConfig;
use rustls::server::NoServerSessionStorage;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::ClientCertVerifier;
use tracing::debug;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use super::config::TlsConfig;
use crate::{Error, Result};

/// `otherName` type-id under which intents are issued (2.5.29.17).
pub const INTENT_TYPE_ID: &[u64] = &[2, 5, 29, 17];

// ─────────────────────────────────────────────────────────────────────────────
// Public: server identity and TLS config
// ─────────────────────────────────────────────────────────────────────────────

/// The proxy's own TLS identity.
#[derive(Debug)]
pub struct ServerIdentity {
    /// Certificate chain, leaf first.
    pub certs: Vec<CertificateDer<'static>>,
    /// Private key matching the leaf.
    pub key: PrivateKeyDer<'static>,
    /// Low 64 bits of the leaf certificate's serial number.
    pub serial: u64,
}

impl ServerIdentity {
    /// Load the identity from the configured PEM files.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a file is missing or unparseable.
    pub fn load(config: &TlsConfig) -> Result<Self> {
        let certs = load_certs(&config.server_cert_path())?;
        let key = load_private_key(&config.server_key_path())?;
        Self::new(certs, key)
    }

    /// Build an identity from already-decoded material.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the chain is empty or the leaf is not X.509.
    pub fn new(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<Self> {
        let leaf = certs
            .first()
            .ok_or_else(|| Error::Config("Server certificate chain is empty".to_string()))?;
        let serial = serial_u64(leaf)?;
        Ok(Self { certs, key, serial })
    }
}

/// Low 64 bits of a certificate's serial number.
///
/// # Errors
///
/// Returns `Error::Config` if the certificate cannot be parsed.
pub fn serial_u64(cert: &CertificateDer<'_>) -> Result<u64> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref())
        .map_err(|e| Error::Config(format!("Failed to parse server certificate: {e}")))?;
    let raw = parsed.raw_serial();
    let low = &raw[raw.len().saturating_sub(8)..];
    Ok(low.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

/// Crypto provider shared by every rustls config the proxy builds.
#[must_use]
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Build a TLS 1.3 `rustls::ServerConfig` presenting `identity` and
/// verifying clients with `verifier`.
///
/// Session resumption is disabled: a resumed handshake skips client
/// certificate verification, so every connection must run `verifier`.
///
/// # Errors
///
/// Returns an error if the certificate and key do not match.
pub fn build_server_config(
    identity: &ServerIdentity,
    verifier: Arc<dyn ClientCertVerifier>,
) -> Result<ServerConfig> {
    let mut tls_cfg = ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::Tls(format!("Unsupported protocol versions: {e}")))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(identity.certs.clone(), identity.key.clone_key())
        .map_err(|e| Error::Config(format!("TLS config error (cert/key mismatch?): {e}")))?;

    tls_cfg.session_storage = Arc::new(NoServerSessionStorage {});
    tls_cfg.send_tls13_tickets = 0;

    debug!(serial = identity.serial, "mTLS server config built");

    Ok(tls_cfg)
}

/// Build a `WebPkiClientVerifier` that requires a client certificate chaining
/// to one of `ca_certs`, optionally checking `crls`.
///
/// # Errors
///
/// Returns `Error::Config` if a CA certificate is invalid or the verifier
/// cannot be built.
pub fn build_webpki_verifier(
    ca_certs: &[CertificateDer<'static>],
    crls: Vec<CertificateRevocationListDer<'static>>,
) -> Result<Arc<dyn ClientCertVerifier>> {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in ca_certs {
        root_store
            .add(cert.clone())
            .map_err(|e| Error::Config(format!("Failed to add CA cert to trust store: {e}")))?;
    }

    let builder = WebPkiClientVerifier::builder_with_provider(Arc::new(root_store), crypto_provider());
    let builder = if crls.is_empty() {
        builder
    } else {
        builder.with_crls(crls)
    };

    builder
        .build()
        .map_err(|e| Error::Config(format!("Failed to build client verifier: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: PEM loading
// ─────────────────────────────────────────────────────────────────────────────

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no valid PEM
/// certificate blocks.
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem_data = read_file(path)?;
    let certs = parse_certs(&pem_data)
        .map_err(|e| Error::Config(format!("Failed to parse certs from '{path}': {e}")))?;

    if certs.is_empty() {
        return Err(Error::Config(format!("No certificates found in '{path}'")));
    }

    Ok(certs)
}

/// Load the first private key from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no private key.
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let pem_data = read_file(path)?;
    rustls_pemfile::private_key(&mut pem_data.as_slice())
        .map_err(|e| Error::Config(format!("Failed to parse private key from '{path}': {e}")))?
        .ok_or_else(|| Error::Config(format!("No private key found in '{path}'")))
}

/// Load CRL entries from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_crls(path: &str) -> Result<Vec<CertificateRevocationListDer<'static>>> {
    let pem_data = read_file(path)?;
    rustls_pemfile::crls(&mut pem_data.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("Failed to parse CRL from '{path}': {e}")))
}

fn parse_certs(pem: &[u8]) -> std::io::Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut &pem[..]).collect()
}

fn read_file(path: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Config(format!("Cannot read '{path}': {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: certificate generation (CLI helpers)
// ─────────────────────────────────────────────────────────────────────────────

/// Parameters for generating a CA certificate.
#[derive(Debug)]
pub struct CaParams<'a> {
    /// Common Name for the root CA.
    pub cn: &'a str,
    /// Validity period in days.
    pub validity_days: u32,
}

/// Generated certificate and key pair in PEM format.
#[derive(Debug, Clone)]
pub struct GeneratedCert {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

impl GeneratedCert {
    /// DER encoding of the certificate.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the PEM holds no certificate.
    pub fn cert_der(&self) -> Result<CertificateDer<'static>> {
        parse_certs(self.cert_pem.as_bytes())
            .map_err(|e| Error::Config(format!("Invalid certificate PEM: {e}")))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Config("No certificate in PEM".to_string()))
    }

    /// DER encoding of the private key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the PEM holds no key.
    pub fn key_der(&self) -> Result<PrivateKeyDer<'static>> {
        rustls_pemfile::private_key(&mut self.key_pem.as_bytes())
            .map_err(|e| Error::Config(format!("Invalid key PEM: {e}")))?
            .ok_or_else(|| Error::Config("No private key in PEM".to_string()))
    }
}

/// Certificate generator backed by `rcgen`.
///
/// Issues the CA, the proxy's server certificate, and client certificates
/// carrying an intent in their Subject Alternative Name.
pub struct CertGenerator;

impl CertGenerator {
    /// Generate a self-signed CA certificate.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or certificate serialisation fails.
    pub fn init_ca(params: &CaParams<'_>) -> Result<GeneratedCert> {
        let key_pair = KeyPair::generate()
            .map_err(|e| Error::Config(format!("Failed to generate CA key: {e}")))?;

        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name = common_name(params.cn);
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.not_after = validity_to_date(params.validity_days)?;

        let ca_cert = ca_params
            .self_signed(&key_pair)
            .map_err(|e| Error::Config(format!("CA cert generation failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: ca_cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Issue the proxy's server certificate for `dns_names`.
    ///
    /// `serial` pins the serial number, which is what the proxy reports to
    /// the authorization service as its user identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the CA material cannot be parsed or signing fails.
    pub fn issue_server(
        cn: &str,
        dns_names: &[String],
        serial: Option<u64>,
        validity_days: u32,
        ca: &GeneratedCert,
    ) -> Result<GeneratedCert> {
        let mut params = CertificateParams::default();
        params.distinguished_name = common_name(cn);
        params.not_after = validity_to_date(validity_days)?;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        if let Some(serial) = serial {
            params.serial_number = Some(SerialNumber::from_slice(&serial.to_be_bytes()));
        }
        params.subject_alt_names = dns_names
            .iter()
            .map(|dns| {
                Ia5String::try_from(dns.as_str())
                    .map(SanType::DnsName)
                    .map_err(|e| Error::Config(format!("Invalid DNS SAN '{dns}': {e}")))
            })
            .collect::<Result<_>>()?;

        Self::sign(&params, ca)
    }

    /// Issue a client certificate whose first SAN entry is the `intent`
    /// `otherName`.
    ///
    /// # Errors
    ///
    /// Returns an error if the CA material cannot be parsed or signing fails.
    pub fn issue_client(
        cn: &str,
        intent: &str,
        validity_days: u32,
        ca: &GeneratedCert,
    ) -> Result<GeneratedCert> {
        let mut params = CertificateParams::default();
        params.distinguished_name = common_name(cn);
        params.not_after = validity_to_date(validity_days)?;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.subject_alt_names = vec![SanType::OtherName((
            INTENT_TYPE_ID.to_vec(),
            OtherNameValue::Utf8String(intent.to_string()),
        ))];

        Self::sign(&params, ca)
    }

    /// Write a [`GeneratedCert`] to disk as `<stem>.crt` and `<stem>.key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or files cannot be written.
    pub fn write_to_dir(cert: &GeneratedCert, dir: &Path, stem: &str) -> Result<()> {
        fs::create_dir_all(dir)
            .map_err(|e| Error::Config(format!("Cannot create dir '{}': {e}", dir.display())))?;

        fs::write(dir.join(format!("{stem}.crt")), &cert.cert_pem)
            .map_err(|e| Error::Config(format!("Cannot write cert: {e}")))?;

        fs::write(dir.join(format!("{stem}.key")), &cert.key_pem)
            .map_err(|e| Error::Config(format!("Cannot write key: {e}")))?;

        Ok(())
    }

    fn sign(params: &CertificateParams, ca: &GeneratedCert) -> Result<GeneratedCert> {
        let issuer = load_issuer(ca)?;
        let leaf_key = KeyPair::generate()
            .map_err(|e| Error::Config(format!("Failed to generate leaf key: {e}")))?;

        let leaf_cert = params
            .signed_by(&leaf_key, &issuer)
            .map_err(|e| Error::Config(format!("Leaf cert signing failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: leaf_cert.pem(),
            key_pem: leaf_key.serialize_pem(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Private helpers
// ─────────────────────────────────────────────────────────────────────────────

fn common_name(cn: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    dn
}

/// Parse CA PEM material back into an `rcgen` issuer.
fn load_issuer(ca: &GeneratedCert) -> Result<Issuer<'static, KeyPair>> {
    let ca_key = KeyPair::from_pem(&ca.key_pem)
        .map_err(|e| Error::Config(format!("Failed to parse CA key: {e}")))?;
    let ca_der = ca.cert_der()?;
    Issuer::from_ca_cert_der(&ca_der, ca_key)
        .map_err(|e| Error::Config(format!("Failed to parse CA cert: {e}")))
}

/// Convert a validity period (days) into a future `OffsetDateTime` for `rcgen`.
fn validity_to_date(days: u32) -> Result<time::OffsetDateTime> {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Config(format!("System time error: {e}")))?
        .as_secs();

    let future_secs = now_secs.saturating_add(u64::from(days) * 86_400);

    let dt = time::OffsetDateTime::from_unix_timestamp(
        i64::try_from(future_secs).unwrap_or(i64::MAX),
    )
    .map_err(|e| Error::Config(format!("Date calculation error: {e}")))?;

    Ok(date_time_ymd(dt.year(), dt.month() as u8, dt.day()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
