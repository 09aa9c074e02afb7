//! TLS listener and per-connection pipeline
//!
//! Accepts TCP connections, completes the mTLS handshake (which runs the
//! intent verifier), dials the backend and relays bytes until both sides
//! are done. A failing connection is logged and dropped; it never stops
//! the listener.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, CertificateRevocationListDer};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio_rustls::TlsAcceptor;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::authz::{Authorizer, HttpAuthorizer};
use crate::config::Config;
use crate::lease::LeaseCache;
use crate::mtls::{
    IntentVerifier, ServerIdentity, build_server_config, build_webpki_verifier, load_certs,
    load_crls,
};
use crate::relay::{ConnectionRelay, RelayReport};
use crate::{Error, Result};

/// Everything a connection needs, built once at startup.
#[derive(Debug)]
pub struct ProxyContext {
    /// Effective configuration
    pub config: Config,
    /// Identifier reported to the authorization service
    pub user: u64,
    /// Serial of the server certificate
    pub server_serial: u64,
    /// Shared lease table
    pub leases: Arc<LeaseCache>,
    /// Authorization backend
    pub authorizer: Arc<dyn Authorizer>,
    tls: Arc<rustls::ServerConfig>,
}

impl ProxyContext {
    /// Load TLS material from disk and connect to the configured
    /// authorization service.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is incomplete or any
    /// certificate, key or CRL cannot be loaded.
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;

        let identity = ServerIdentity::load(&config.tls)?;
        let ca_certs = load_certs(&config.tls.ca_cert_path())?;
        let crls = match config.tls.crl_path.as_deref() {
            Some(path) => load_crls(path)?,
            None => Vec::new(),
        };
        let authorizer = Arc::new(HttpAuthorizer::new(
            &config.authz.endpoint(),
            config.authz.timeout,
        )?);

        Self::new(
            config,
            identity,
            &ca_certs,
            crls,
            authorizer,
            Arc::new(LeaseCache::new()),
        )
    }

    /// Assemble a context from already-loaded parts.
    ///
    /// # Errors
    ///
    /// Returns an error if the CA pool or the server identity is unusable.
    pub fn new(
        config: Config,
        identity: ServerIdentity,
        ca_certs: &[CertificateDer<'static>],
        crls: Vec<CertificateRevocationListDer<'static>>,
        authorizer: Arc<dyn Authorizer>,
        leases: Arc<LeaseCache>,
    ) -> Result<Self> {
        let user = config.authz.user.unwrap_or(identity.serial);
        let inner = build_webpki_verifier(ca_certs, crls)?;
        let verifier = IntentVerifier::new(
            inner,
            Arc::clone(&leases),
            Arc::clone(&authorizer),
            user,
        );
        let tls = build_server_config(&identity, Arc::new(verifier))?;

        Ok(Self {
            config,
            user,
            server_serial: identity.serial,
            leases,
            authorizer,
            tls: Arc::new(tls),
        })
    }
}

/// The proxy listener.
pub struct ProxyServer {
    ctx: Arc<ProxyContext>,
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl ProxyServer {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the address cannot be bound.
    pub async fn bind(ctx: ProxyContext) -> Result<Self> {
        let addr = ctx.config.listen_socket();
        let listener = TcpListener::bind(&addr).await?;
        let acceptor = TlsAcceptor::from(Arc::clone(&ctx.tls));

        info!(
            listen = %addr,
            backend = %ctx.config.backend_target(),
            authz = %ctx.config.authz.endpoint(),
            user = ctx.user,
            lease_secs = ctx.leases.duration().as_secs(),
            "Intent proxy listening"
        );

        Ok(Self {
            ctx: Arc::new(ctx),
            listener,
            acceptor,
        })
    }

    /// Address actually bound.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared context.
    pub fn context(&self) -> &Arc<ProxyContext> {
        &self.ctx
    }

    /// Serve until Ctrl-C / SIGTERM.
    ///
    /// # Errors
    ///
    /// Currently infallible once bound; per-connection errors are logged.
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve until `shutdown` resolves. Connections already accepted keep
    /// relaying in their own tasks.
    ///
    /// # Errors
    ///
    /// Currently infallible once bound; per-connection errors are logged.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Listener shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let ctx = Arc::clone(&self.ctx);
                        let acceptor = self.acceptor.clone();
                        let span = info_span!("conn", id = %Uuid::new_v4(), %peer);
                        tokio::spawn(
                            async move {
                                match handle_connection(&ctx, acceptor, stream).await {
                                    Ok(_) => {}
                                    Err(e @ Error::Tls(_)) => warn!(error = %e, "Connection rejected"),
                                    Err(e) => error!(error = %e, "Connection failed"),
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
            }
        }

        let stats = self.ctx.leases.stats();
        info!(
            hits = stats.hits,
            misses = stats.misses,
            grants = stats.grants,
            leases = stats.size,
            "Listener stopped"
        );
        Ok(())
    }
}

async fn handle_connection(
    ctx: &ProxyContext,
    acceptor: TlsAcceptor,
    stream: TcpStream,
) -> Result<RelayReport> {
    debug!("Accepted TCP connection");

    let client = tokio::time::timeout(ctx.config.handshake_timeout, acceptor.accept(stream))
        .await
        .map_err(|_| {
            Error::Tls(format!(
                "handshake not completed within {}ms",
                ctx.config.handshake_timeout.as_millis()
            ))
        })?
        .map_err(|e| Error::Tls(format!("handshake failed: {e}")))?;
    debug!("Handshake complete");

    let target = ctx.config.backend_target();
    let backend = TcpStream::connect(&target).await.map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("backend {target} unreachable: {e}"),
        ))
    })?;
    backend.set_nodelay(true)?;

    let report = ConnectionRelay::new(client, backend).run().await;
    info!(
        sent = report.client_to_backend.bytes,
        received = report.backend_to_client.bytes,
        clean = report.is_clean(),
        "Connection closed"
    );
    for err in [
        &report.client_to_backend.error,
        &report.backend_to_client.error,
    ]
    .into_iter()
    .flatten()
    {
        debug!(error = %err, "Relay error");
    }

    Ok(report)
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthzConfig;
    use crate::mtls::{CaParams, CertGenerator, TlsConfig};

    #[derive(Debug)]
    struct Approve;

    impl Authorizer for Approve {
        fn authorize(&self, _intent: &str, _user: u64) -> Result<()> {
            Ok(())
        }
    }

    fn parts(user: Option<u64>) -> (Config, ServerIdentity, Vec<CertificateDer<'static>>) {
        let ca = CertGenerator::init_ca(&CaParams {
            cn: "Test CA",
            validity_days: 30,
        })
        .unwrap();
        let server =
            CertGenerator::issue_server("proxy", &["localhost".to_string()], Some(7), 30, &ca)
                .unwrap();
        let identity =
            ServerIdentity::new(vec![server.cert_der().unwrap()], server.key_der().unwrap())
                .unwrap();
        let config = Config {
            listen_addr: "127.0.0.1:0".to_string(),
            backend_addr: "9".to_string(),
            authz: AuthzConfig {
                url: "http://127.0.0.1:9/".to_string(),
                user,
                ..Default::default()
            },
            ..Default::default()
        };
        (config, identity, vec![ca.cert_der().unwrap()])
    }

    #[test]
    fn user_defaults_to_server_serial() {
        let (config, identity, ca) = parts(None);
        let ctx = ProxyContext::new(
            config,
            identity,
            &ca,
            Vec::new(),
            Arc::new(Approve),
            Arc::new(LeaseCache::new()),
        )
        .unwrap();
        assert_eq!(ctx.user, 7);
        assert_eq!(ctx.server_serial, 7);
    }

    #[test]
    fn configured_user_overrides_serial() {
        let (config, identity, ca) = parts(Some(1234));
        let ctx = ProxyContext::new(
            config,
            identity,
            &ca,
            Vec::new(),
            Arc::new(Approve),
            Arc::new(LeaseCache::new()),
        )
        .unwrap();
        assert_eq!(ctx.user, 1234);
    }

    #[test]
    fn from_config_rejects_incomplete_config() {
        let err = ProxyContext::from_config(Config::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn from_config_reports_missing_pem_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            listen_addr: "3001".to_string(),
            backend_addr: "27017".to_string(),
            authz: AuthzConfig {
                url: "8080".to_string(),
                ..Default::default()
            },
            tls: TlsConfig {
                pem_folder: Some(dir.path().display().to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = ProxyContext::from_config(config).unwrap_err().to_string();
        assert!(err.contains("certificate.pem"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bind_reports_ephemeral_port_and_stops_on_shutdown() {
        let (config, identity, ca) = parts(None);
        let ctx = ProxyContext::new(
            config,
            identity,
            &ca,
            Vec::new(),
            Arc::new(Approve),
            Arc::new(LeaseCache::new()),
        )
        .unwrap();

        let server = ProxyServer::bind(ctx).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        server.run_until(async {}).await.unwrap();
    }
}
