use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt::format::FmtSpan, prelude::*};
use turnstile_tls_util::{FileCaProvider, FileCertProvider};

use crate::{error::Result, server::ImpersonationProxy};

mod audit;
mod authenticate;
mod authorize;
mod cli;
mod client_ca;
mod error;
mod filters;
mod forward;
mod identity;
mod request;
mod response;
mod rewrite;
mod server;
mod service;
#[cfg(test)]
mod test;
mod tls;
mod transport;

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider())
        .expect("Failed to install crypto provider");

    if std::env::var("TURNSTILE_JSON_LOG")
        .map(|value| value.parse().unwrap_or_default())
        .unwrap_or_default()
    {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                    .json(),
            )
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                    .pretty()
                    .with_line_number(true),
            )
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    }

    info!(
        "Initializing turnstile-proxy, version {}.",
        env!("CARGO_PKG_VERSION")
    );

    let args = cli::parse_args();

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let sigterm = async {
                match signal(SignalKind::terminate()) {
                    Ok(mut stream) => {
                        stream.recv().await;
                    }
                    Err(error) => {
                        error!(%error, "Failed to install the SIGTERM handler.");
                        std::future::pending::<()>().await;
                    }
                }
            };

            tokio::select! {
                _ = sigterm => {}
                _ = tokio::signal::ctrl_c() => {}
            }

            info!("Shutdown signal received.");
            shutdown.cancel();
        });
    }

    match serve(args, shutdown).await {
        Ok(()) => info!("turnstile-proxy exiting successfully."),
        Err(error) => error!(%error, "turnstile-proxy exiting with an error."),
    }

    Ok(())
}

async fn serve(args: cli::Args, shutdown: CancellationToken) -> Result<()> {
    let serving_cert = Arc::new(FileCertProvider::new(args.tls_cert_file, args.tls_key_file));
    let signer_ca = Arc::new(FileCaProvider::new(args.signer_ca_file));

    let proxy = ImpersonationProxy::new(args.port, serving_cert, signer_ca).await?;
    proxy.run(shutdown).await
}
