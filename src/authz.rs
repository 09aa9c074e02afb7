//! Remote authorization decisions
//!
//! The proxy asks an external HTTP service whether a caller may act on an
//! intent. The request is `GET <url>?intent=<intent>&user=<user>`; the
//! service approves with exactly `200 OK`, anything else denies.
//!
//! rustls runs client-certificate verification synchronously inside the
//! handshake, so [`Authorizer`] is a blocking trait. [`HttpAuthorizer`]
//! drives its async client on the surrounding multi-threaded runtime via
//! `block_in_place`.

use std::fmt;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};
use url::Url;

use crate::{Error, Result};

/// Default bound on one authorization round-trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Approves or denies an `(intent, user)` pair.
pub trait Authorizer: Send + Sync + fmt::Debug {
    /// `Ok(())` when approved.
    ///
    /// # Errors
    ///
    /// `Error::AuthorizationDenied` when the service refuses,
    /// `Error::AuthorizationService` when no decision could be obtained.
    fn authorize(&self, intent: &str, user: u64) -> Result<()>;
}

/// [`Authorizer`] backed by an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpAuthorizer {
    client: Client,
    url: Url,
    timeout: Duration,
}

impl HttpAuthorizer {
    /// Create an authorizer for `url` with a per-request `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an unparseable URL and `Error::Http` if
    /// the client cannot be built.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::Config(format!("Invalid authorization URL '{url}': {e}")))?;

        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            url,
            timeout,
        })
    }

    /// Endpoint queried for decisions.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Per-request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Perform one authorization request.
    ///
    /// # Errors
    ///
    /// See [`Authorizer::authorize`].
    pub async fn request(&self, intent: &str, user: u64) -> Result<()> {
        let user = user.to_string();
        let response = self
            .client
            .get(self.url.clone())
            .query(&[("intent", intent), ("user", user.as_str())])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::AuthorizationService(format!(
                        "no answer within {}ms",
                        self.timeout.as_millis()
                    ))
                } else {
                    Error::AuthorizationService(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::OK {
            debug!(intent, user = %user, "Authorization granted");
            Ok(())
        } else {
            warn!(intent, user = %user, status = status.as_u16(), "Authorization denied");
            Err(Error::AuthorizationDenied {
                status: status.as_u16(),
            })
        }
    }
}

impl Authorizer for HttpAuthorizer {
    fn authorize(&self, intent: &str, user: u64) -> Result<()> {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| handle.block_on(self.request(intent, user)))
            }
            // Blocking a current-thread runtime would deadlock the request itself.
            Ok(_) => Err(Error::AuthorizationService(
                "authorization requires a multi-threaded runtime".to_string(),
            )),
            Err(_) => tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| Error::AuthorizationService(format!("runtime unavailable: {e}")))?
                .block_on(self.request(intent, user)),
        }
    }
}
