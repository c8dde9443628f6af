use std::{
    io,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use hyper::{
    body::{Body, Incoming},
    client::conn::{http1, http2},
    http::{Request, Response, Uri},
    rt::{Read, Write},
};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::{crypto::CryptoProvider, pki_types::ServerName, ClientConfig, RootCertStore};
use thiserror::Error;
use tokio::{net::TcpStream, time::Instant};
use tokio_rustls::TlsConnector;

use crate::{
    error::ProxyError,
    tls::{HTTP_1_1_ALPN_NAME, HTTP_2_ALPN_NAME},
};

#[derive(Debug, Error)]
pub(crate) enum TransportError {
    #[error("failed to connect to the upstream API server: {0}")]
    Connect(#[source] io::Error),

    #[error("TLS handshake with the upstream API server failed: {0}")]
    TlsHandshake(#[source] io::Error),

    #[error("HTTP handshake with the upstream API server failed: {0}")]
    HttpHandshake(#[source] hyper::Error),

    #[error("failed to read the service account token: {0}")]
    TokenFile(#[source] io::Error),
}

/// Helper enum for representing HTTP/1.1 and HTTP/2, which hyper drives
/// through different connection types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HttpVersion {
    V1,
    V2,
}

/// Connection details for the upstream API server, extracted from the
/// in-cluster client configuration.
#[derive(Clone, Debug)]
pub(crate) struct UpstreamConfig {
    pub base_uri: Uri,
    pub host: String,
    pub port: u16,
    pub sni: ServerName<'static>,
    pub root_certs_der: Vec<Vec<u8>>,
    pub token_file: Option<PathBuf>,
}

impl UpstreamConfig {
    pub(crate) fn from_kube(config: &kube::Config) -> Result<Self, ProxyError> {
        let base_uri = config.cluster_url.clone();

        if base_uri.scheme_str() != Some("https") {
            return Err(ProxyError::InvalidUpstreamUrl(format!(
                "cluster URL `{base_uri}` is not https"
            )));
        }

        let host = base_uri
            .host()
            .ok_or_else(|| {
                ProxyError::InvalidUpstreamUrl(format!("cluster URL `{base_uri}` has no host"))
            })?
            .to_string();
        let port = base_uri.port_u16().unwrap_or(443);

        let sni_host = config.tls_server_name.clone().unwrap_or_else(|| host.clone());
        let sni = ServerName::try_from(sni_host.clone())
            .map_err(|_| ProxyError::InvalidUpstreamUrl(format!("invalid SNI `{sni_host}`")))?;

        Ok(Self {
            base_uri,
            host,
            port,
            sni,
            root_certs_der: config.root_cert.clone().unwrap_or_default(),
            token_file: config.auth_info.token_file.clone().map(PathBuf::from),
        })
    }
}

/// Reads the proxy's own service account token.
///
/// The kubelet rotates projected tokens on disk, so the file is re-read
/// after a short grace period instead of once at startup.
pub(crate) struct TokenFile {
    path: PathBuf,
    cached: Mutex<Option<(Instant, String)>>,
}

impl TokenFile {
    const REFRESH_PERIOD: Duration = Duration::from_secs(60);

    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            cached: Mutex::new(None),
        }
    }

    pub(crate) async fn current(&self) -> Result<String, TransportError> {
        if let Some((read_at, token)) = self.cached.lock().expect("lock poisoned").as_ref() {
            if read_at.elapsed() < Self::REFRESH_PERIOD {
                return Ok(token.clone());
            }
        }

        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(TransportError::TokenFile)?;
        let token = raw.trim().to_string();

        *self.cached.lock().expect("lock poisoned") = Some((Instant::now(), token.clone()));

        Ok(token)
    }
}

/// What the outgoing connection is allowed to authenticate as.
pub(crate) enum Credential {
    /// The proxy's own service account, attached alongside impersonation
    /// headers.
    ServiceAccount(Arc<TokenFile>),
    /// No credential at all. Only ever used as the base for token
    /// passthrough, where the client's own bearer token is attached.
    Anonymous,
}

/// One of the four upstream round-trip configurations, pinned to a single
/// ALPN protocol and credential mode at construction.
pub(crate) struct UpstreamTransport {
    version: HttpVersion,
    pub(crate) credential: Credential,
    connector: TlsConnector,
    host: String,
    port: u16,
    sni: ServerName<'static>,
}

impl UpstreamTransport {
    pub(crate) fn version(&self) -> HttpVersion {
        self.version
    }

    /// Opens a fresh connection to the upstream: TCP, then TLS with the
    /// pinned ALPN protocol, then the matching HTTP handshake.
    pub(crate) async fn connect<B>(&self) -> Result<UpstreamSender<B>, TransportError>
    where
        B: Body + Send + Unpin + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(TransportError::Connect)?;
        let stream = self
            .connector
            .connect(self.sni.clone(), stream)
            .await
            .map_err(TransportError::TlsHandshake)?;

        UpstreamSender::handshake(TokioIo::new(stream), self.version).await
    }
}

/// The four upstream transports: `{HTTP/1.1, HTTP/2} x {service account,
/// anonymous}`. All are built eagerly so a bad upstream configuration fails
/// construction instead of the first request.
pub(crate) struct UpstreamTransports {
    http1: UpstreamTransport,
    http1_anonymous: UpstreamTransport,
    http2: UpstreamTransport,
    http2_anonymous: UpstreamTransport,
}

impl UpstreamTransports {
    pub(crate) fn new(
        config: &UpstreamConfig,
        crypto: Arc<CryptoProvider>,
    ) -> Result<Self, ProxyError> {
        let token_file = config
            .token_file
            .clone()
            .map(|path| Arc::new(TokenFile::new(path)))
            .ok_or(ProxyError::NoServiceAccountToken)?;

        let build = |alpn: &[u8], version, credential| -> Result<UpstreamTransport, ProxyError> {
            let tls = client_config(&config.root_certs_der, alpn, crypto.clone())?;
            Ok(UpstreamTransport {
                version,
                credential,
                connector: TlsConnector::from(tls),
                host: config.host.clone(),
                port: config.port,
                sni: config.sni.clone(),
            })
        };

        Ok(Self {
            http1: build(
                HTTP_1_1_ALPN_NAME,
                HttpVersion::V1,
                Credential::ServiceAccount(token_file.clone()),
            )?,
            http1_anonymous: build(HTTP_1_1_ALPN_NAME, HttpVersion::V1, Credential::Anonymous)?,
            http2: build(
                HTTP_2_ALPN_NAME,
                HttpVersion::V2,
                Credential::ServiceAccount(token_file),
            )?,
            http2_anonymous: build(HTTP_2_ALPN_NAME, HttpVersion::V2, Credential::Anonymous)?,
        })
    }

    /// Upgrades only work over HTTP/1.1; everything else rides HTTP/2.
    pub(crate) fn credentialed(&self, upgrade: bool) -> &UpstreamTransport {
        if upgrade {
            &self.http1
        } else {
            &self.http2
        }
    }

    pub(crate) fn anonymous(&self, upgrade: bool) -> &UpstreamTransport {
        if upgrade {
            &self.http1_anonymous
        } else {
            &self.http2_anonymous
        }
    }
}

fn client_config(
    root_certs_der: &[Vec<u8>],
    alpn: &[u8],
    crypto: Arc<CryptoProvider>,
) -> Result<Arc<ClientConfig>, ProxyError> {
    let mut roots = RootCertStore::empty();
    let (_, ignored) = roots.add_parsable_certificates(
        root_certs_der
            .iter()
            .map(|der| der.clone().into()),
    );
    if ignored > 0 {
        tracing::warn!("Ignored {ignored} invalid upstream CA certificate(s).");
    }
    if roots.is_empty() {
        return Err(ProxyError::NoUpstreamRoots);
    }

    let mut config = ClientConfig::builder_with_provider(crypto)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![alpn.to_vec()];

    Ok(Arc::new(config))
}

/// hyper uses different types for HTTP/1 and HTTP/2 request senders.
///
/// This is a simple `Either` over the two, with the HTTP/1.1 connection
/// driven `with_upgrades` so 101 responses can be bridged.
pub(crate) enum UpstreamSender<B> {
    V1(http1::SendRequest<B>),
    V2(http2::SendRequest<B>),
}

impl<B> UpstreamSender<B>
where
    B: Body + Send + Unpin + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    pub(crate) async fn handshake<IO>(io: IO, version: HttpVersion) -> Result<Self, TransportError>
    where
        IO: Read + Write + Send + Unpin + 'static,
    {
        match version {
            HttpVersion::V1 => {
                let (sender, conn) = http1::handshake(io)
                    .await
                    .map_err(TransportError::HttpHandshake)?;
                tokio::spawn(conn.with_upgrades());
                Ok(Self::V1(sender))
            }
            HttpVersion::V2 => {
                let (sender, conn) = http2::handshake(TokioExecutor::default(), io)
                    .await
                    .map_err(TransportError::HttpHandshake)?;
                tokio::spawn(conn);
                Ok(Self::V2(sender))
            }
        }
    }

    pub(crate) async fn send(&mut self, request: Request<B>) -> hyper::Result<Response<Incoming>> {
        match self {
            Self::V1(sender) => {
                sender.ready().await?;
                sender.send_request(request).await
            }
            Self::V2(sender) => {
                sender.ready().await?;
                sender.send_request(request).await
            }
        }
    }
}
