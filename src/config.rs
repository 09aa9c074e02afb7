//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::authz::DEFAULT_TIMEOUT;
use crate::mtls::TlsConfig;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `${VAR}` resolution.
    pub env_files: Vec<String>,
    /// Address the TLS listener binds. A bare port binds all interfaces.
    pub listen_addr: String,
    /// Backend to relay approved connections to. A bare port means `localhost`.
    pub backend_addr: String,
    /// Upper bound on a single TLS handshake, authorization included.
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Authorization service
    pub authz: AuthzConfig,
    /// TLS material
    pub tls: TlsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: Vec::new(),
            listen_addr: String::new(),
            backend_addr: String::new(),
            handshake_timeout: Duration::from_secs(10),
            authz: AuthzConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

/// Authorization service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthzConfig {
    /// Endpoint queried with `?intent=..&user=..`. A bare port means
    /// `http://localhost:<port>/`.
    pub url: String,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Identifier sent as `user`. Defaults to the server certificate serial.
    pub user: Option<u64>,
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout: DEFAULT_TIMEOUT,
            user: None,
        }
    }
}

impl AuthzConfig {
    /// Effective endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> String {
        match bare_port(&self.url) {
            Some(port) => format!("http://localhost:{port}/"),
            None => self.url.clone(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // INTENT_PROXY_AUTHZ__URL -> authz.url
        figment = figment.merge(Env::prefixed("INTENT_PROXY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars()?;

        Ok(config)
    }

    /// Check that everything needed to serve is present.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first missing or invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.trim().is_empty() {
            return Err(Error::Config("listen_addr is not set".to_string()));
        }
        if self.backend_addr.trim().is_empty() {
            return Err(Error::Config("backend_addr is not set".to_string()));
        }
        if self.authz.url.trim().is_empty() {
            return Err(Error::Config("authz.url is not set".to_string()));
        }
        if self.authz.timeout.is_zero() {
            return Err(Error::Config("authz.timeout must be positive".to_string()));
        }
        if self.handshake_timeout.is_zero() {
            return Err(Error::Config(
                "handshake_timeout must be positive".to_string(),
            ));
        }
        if !self.tls.is_complete() {
            return Err(Error::Config(
                "tls.pem_folder or all of tls.server_cert, tls.server_key, tls.ca_cert must be set"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Socket address the listener binds.
    #[must_use]
    pub fn listen_socket(&self) -> String {
        match bare_port(&self.listen_addr) {
            Some(port) => format!("0.0.0.0:{port}"),
            None => self.listen_addr.clone(),
        }
    }

    /// Address dialled for each approved connection.
    #[must_use]
    pub fn backend_target(&self) -> String {
        match bare_port(&self.backend_addr) {
            Some(port) => format!("localhost:{port}"),
            None => self.backend_addr.clone(),
        }
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = match (path_str.strip_prefix('~'), dirs::home_dir()) {
                (Some(rest), Some(home)) => format!("{}{rest}", home.display()),
                _ => path_str.clone(),
            };

            let path = Path::new(&expanded);
            if !path.exists() {
                tracing::debug!("Env file not found (skipped): {expanded}");
                continue;
            }
            match dotenvy::from_path(path) {
                Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` in addresses, URL and TLS paths
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Config(format!("Invalid expansion pattern: {e}")))?;

        for value in [
            &mut self.listen_addr,
            &mut self.backend_addr,
            &mut self.authz.url,
        ] {
            *value = Self::expand_string(&re, value);
        }

        for value in [
            &mut self.tls.pem_folder,
            &mut self.tls.server_cert,
            &mut self.tls.server_key,
            &mut self.tls.ca_cert,
            &mut self.tls.crl_path,
        ]
        .into_iter()
        .flatten()
        {
            *value = Self::expand_string(&re, value);
        }

        Ok(())
    }

    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// `"3001"` or `":3001"` → port.
fn bare_port(addr: &str) -> Option<u16> {
    let digits = addr.trim().strip_prefix(':').unwrap_or(addr.trim());
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Human-readable `Duration` fields (`"10s"`, `"500ms"`, `"2m"`)
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize as whole seconds when exact, milliseconds otherwise.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize `"30s"`, `"5m"`, `"100ms"`, or a bare number of seconds.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).map_err(serde::de::Error::custom)
    }

    fn parse(s: &str) -> Result<Duration, String> {
        let number = |digits: &str| {
            digits
                .parse::<u64>()
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        };
        // "ms" must be tried before "s" and "m".
        if let Some(ms) = s.strip_suffix("ms") {
            number(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            number(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            number(mins)?
                .checked_mul(60)
                .map(Duration::from_secs)
                .ok_or_else(|| format!("duration '{s}' is out of range"))
        } else {
            number(s).map(Duration::from_secs)
        }
    }
}
