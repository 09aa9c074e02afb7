//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Mutual-TLS proxy that authorizes certificate intents before relaying to a database
#[derive(Parser, Debug)]
#[command(name = "intent-proxy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "INTENT_PROXY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Address to listen on (`host:port`, or a bare port)
    #[arg(long, env = "LISTEN_ADDR")]
    pub listen_addr: Option<String>,

    /// Backend to relay to (`host:port`, or a bare port on localhost)
    #[arg(long, env = "DB_ADDR")]
    pub db_addr: Option<String>,

    /// Authorization service URL (or a bare port on localhost)
    #[arg(long, env = "CA_ADDR")]
    pub ca_addr: Option<String>,

    /// Folder holding certificate.pem, keys.pem and CAcert.pem
    #[arg(long, env = "PEM_FOLDER")]
    pub pem_folder: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "INTENT_PROXY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "INTENT_PROXY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the proxy (default)
    Serve,

    /// Certificate generation commands
    #[command(subcommand)]
    Cert(CertCommand),
}

/// Certificate subcommands
#[derive(Subcommand, Debug)]
pub enum CertCommand {
    /// Create a self-signed CA (`<out>/<name>.crt`, `<out>/<name>.key`)
    InitCa {
        /// Common Name of the CA
        #[arg(long, default_value = "intent-proxy CA")]
        cn: String,

        /// Validity in days
        #[arg(long, default_value_t = 3650)]
        days: u32,

        /// Output directory
        #[arg(short, long, default_value = "pem")]
        out: PathBuf,

        /// File stem
        #[arg(long, default_value = "ca")]
        name: String,
    },

    /// Issue a certificate signed by an existing CA
    Issue {
        /// CA certificate (PEM)
        #[arg(long, default_value = "pem/ca.crt")]
        ca_cert: PathBuf,

        /// CA private key (PEM)
        #[arg(long, default_value = "pem/ca.key")]
        ca_key: PathBuf,

        /// Common Name of the new certificate
        #[arg(long)]
        cn: String,

        /// Issue a client certificate carrying this intent
        #[arg(long, conflicts_with_all = ["dns", "serial"])]
        intent: Option<String>,

        /// DNS names for a server certificate (repeatable)
        #[arg(long)]
        dns: Vec<String>,

        /// Serial number for a server certificate
        #[arg(long)]
        serial: Option<u64>,

        /// Validity in days
        #[arg(long, default_value_t = 365)]
        days: u32,

        /// Output directory
        #[arg(short, long, default_value = "pem")]
        out: PathBuf,

        /// File stem (defaults to the CN)
        #[arg(long)]
        name: Option<String>,
    },
}
