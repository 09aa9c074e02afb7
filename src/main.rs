//! Intent Proxy - mTLS database proxy with intent authorization

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use intent_proxy::{
    cli::{CertCommand, Cli, Command},
    config::Config,
    mtls::{CaParams, CertGenerator, GeneratedCert},
    server::{ProxyContext, ProxyServer},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Cert(cmd)) => run_cert_command(cmd),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Run certificate generation commands
fn run_cert_command(cmd: CertCommand) -> ExitCode {
    match cmd {
        CertCommand::InitCa {
            cn,
            days,
            out,
            name,
        } => {
            let ca = match CertGenerator::init_ca(&CaParams {
                cn: &cn,
                validity_days: days,
            }) {
                Ok(ca) => ca,
                Err(e) => {
                    eprintln!("❌ Failed to generate CA: {e}");
                    return ExitCode::FAILURE;
                }
            };
            write_pair(&ca, &out, &name)
        }

        CertCommand::Issue {
            ca_cert,
            ca_key,
            cn,
            intent,
            dns,
            serial,
            days,
            out,
            name,
        } => {
            let ca = match read_ca(&ca_cert, &ca_key) {
                Ok(ca) => ca,
                Err(e) => {
                    eprintln!("❌ {e}");
                    return ExitCode::FAILURE;
                }
            };

            let issued = match intent {
                Some(intent) => CertGenerator::issue_client(&cn, &intent, days, &ca),
                None => {
                    let dns = if dns.is_empty() { vec![cn.clone()] } else { dns };
                    CertGenerator::issue_server(&cn, &dns, serial, days, &ca)
                }
            };

            match issued {
                Ok(cert) => write_pair(&cert, &out, name.as_deref().unwrap_or(&cn)),
                Err(e) => {
                    eprintln!("❌ Failed to issue certificate: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn read_ca(cert: &Path, key: &Path) -> Result<GeneratedCert, String> {
    let cert_pem = std::fs::read_to_string(cert)
        .map_err(|e| format!("Cannot read CA certificate {}: {e}", cert.display()))?;
    let key_pem = std::fs::read_to_string(key)
        .map_err(|e| format!("Cannot read CA key {}: {e}", key.display()))?;
    Ok(GeneratedCert { cert_pem, key_pem })
}

fn write_pair(cert: &GeneratedCert, out: &Path, stem: &str) -> ExitCode {
    match CertGenerator::write_to_dir(cert, out, stem) {
        Ok(()) => {
            println!("✅ {}/{stem}.crt", out.display());
            println!("✅ {}/{stem}.key", out.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the proxy
async fn run_server(cli: Cli) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(addr) = cli.listen_addr {
                config.listen_addr = addr;
            }
            if let Some(addr) = cli.db_addr {
                config.backend_addr = addr;
            }
            if let Some(url) = cli.ca_addr {
                config.authz.url = url;
            }
            if let Some(folder) = cli.pem_folder {
                config.tls.pem_folder = Some(folder.display().to_string());
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen_addr,
        backend = %config.backend_addr,
        "Starting intent proxy"
    );

    let ctx = match ProxyContext::from_config(config) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("Failed to initialise proxy: {e}");
            return ExitCode::FAILURE;
        }
    };

    let server = match ProxyServer::bind(ctx).await {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to bind listener: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("Proxy error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Proxy shutdown complete");
    ExitCode::SUCCESS
}
