//! TLS material configuration.
//!
//! Paths to the proxy's certificate, key, client CA and optional CRL.
//! A `pem_folder` supplies the conventional file names for any path that
//! is not set explicitly.
//!
//! # Example YAML
//!
//! ```yaml
//! tls:
//!   pem_folder: "/config"
//!   # overrides /config/keys.pem
//!   server_key: "/run/secrets/proxy.key"
//!   crl_path: "/config/revoked.pem"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Server certificate file name inside `pem_folder`.
pub const SERVER_CERT_FILE: &str = "certificate.pem";
/// Server key file name inside `pem_folder`.
pub const SERVER_KEY_FILE: &str = "keys.pem";
/// Client CA file name inside `pem_folder`.
pub const CA_CERT_FILE: &str = "CAcert.pem";

/// TLS configuration block.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct TlsConfig {
    /// Folder holding `certificate.pem`, `keys.pem` and `CAcert.pem`.
    pub pem_folder: Option<String>,

    /// Path to the PEM-encoded server certificate chain.
    pub server_cert: Option<String>,

    /// Path to the PEM-encoded server private key.
    pub server_key: Option<String>,

    /// Path to the PEM-encoded CA bundle trusted for client certificates.
    pub ca_cert: Option<String>,

    /// Optional path to a PEM-encoded Certificate Revocation List.
    pub crl_path: Option<String>,
}

impl TlsConfig {
    /// Effective server certificate path.
    #[must_use]
    pub fn server_cert_path(&self) -> String {
        self.resolve(self.server_cert.as_deref(), SERVER_CERT_FILE)
    }

    /// Effective server key path.
    #[must_use]
    pub fn server_key_path(&self) -> String {
        self.resolve(self.server_key.as_deref(), SERVER_KEY_FILE)
    }

    /// Effective client CA path.
    #[must_use]
    pub fn ca_cert_path(&self) -> String {
        self.resolve(self.ca_cert.as_deref(), CA_CERT_FILE)
    }

    /// Whether every path can be resolved (explicitly or through `pem_folder`).
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.pem_folder.is_some()
            || (self.server_cert.is_some() && self.server_key.is_some() && self.ca_cert.is_some())
    }

    fn resolve(&self, explicit: Option<&str>, file: &str) -> String {
        match (explicit, self.pem_folder.as_deref()) {
            (Some(path), _) => path.to_string(),
            (None, Some(folder)) => Path::new(folder).join(file).display().to_string(),
            (None, None) => file.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pem_folder_supplies_conventional_names() {
        let cfg = TlsConfig {
            pem_folder: Some("/config".to_string()),
            ..Default::default()
        };
        assert_eq!(cfg.server_cert_path(), "/config/certificate.pem");
        assert_eq!(cfg.server_key_path(), "/config/keys.pem");
        assert_eq!(cfg.ca_cert_path(), "/config/CAcert.pem");
        assert!(cfg.is_complete());
    }

    #[test]
    fn explicit_path_beats_pem_folder() {
        let cfg = TlsConfig {
            pem_folder: Some("/config".to_string()),
            server_key: Some("/run/secrets/proxy.key".to_string()),
            ..Default::default()
        };
        assert_eq!(cfg.server_key_path(), "/run/secrets/proxy.key");
        assert_eq!(cfg.server_cert_path(), "/config/certificate.pem");
    }

    #[test]
    fn incomplete_without_folder_or_all_paths() {
        let cfg = TlsConfig {
            server_cert: Some("a.pem".to_string()),
            ca_cert: Some("ca.pem".to_string()),
            ..Default::default()
        };
        assert!(!cfg.is_complete());
    }

    #[test]
    fn deserializes_from_yaml() {
        let yaml = r#"
pem_folder: "/config"
crl_path: "/config/revoked.pem"
"#;
        let cfg: TlsConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.pem_folder.as_deref(), Some("/config"));
        assert_eq!(cfg.crl_path.as_deref(), Some("/config/revoked.pem"));
        assert!(cfg.server_cert.is_none());
    }
}
