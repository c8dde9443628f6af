use thiserror::Error;

/// Errors that abort proxy construction or serving.
#[derive(Debug, Error)]
pub(crate) enum ProxyError {
    #[error("io error: {0}")]
    IO(#[from] std::io::Error),

    #[error("failed to load the upstream client configuration: {0}")]
    UpstreamConfig(#[from] kube::config::InferConfigError),

    #[error("failed to build the upstream client: {0}")]
    UpstreamClient(#[from] kube::Error),

    #[error("upstream client configuration has no cluster CA certificates")]
    NoUpstreamRoots,

    #[error("upstream client configuration has no service account token file")]
    NoServiceAccountToken,

    #[error("upstream cluster URL is invalid: {0}")]
    InvalidUpstreamUrl(String),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] rustls::Error),

    #[error("{0}")]
    SanityCheck(&'static str),
}

pub(crate) type Result<T, E = ProxyError> = std::result::Result<T, E>;
