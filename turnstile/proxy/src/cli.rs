#![deny(missing_docs)]

use std::path::PathBuf;

use clap::Parser;

/// Command line arguments for the impersonation proxy.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Port to bind the TLS listener on
    #[arg(short = 'p', long, default_value_t = 8444)]
    pub port: u16,

    /// PEM file with the serving certificate chain. Re-read when rotated.
    #[arg(long)]
    pub tls_cert_file: PathBuf,

    /// PEM file with the serving private key. Re-read when rotated.
    #[arg(long)]
    pub tls_key_file: PathBuf,

    /// PEM bundle with the impersonation signer CA, trusted for client
    /// certificates alongside the upstream cluster's client CA.
    #[arg(long)]
    pub signer_ca_file: PathBuf,
}

/// Parses arguments, exiting with usage output on error.
pub fn parse_args() -> Args {
    Args::try_parse().unwrap_or_else(|err| err.exit())
}
