use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::{
    body::{Frame, Incoming},
    header::{HeaderMap, CONNECTION, UPGRADE},
    http::{Method, Request, Response, StatusCode, Uri, Version},
    service::Service,
    upgrade::OnUpgrade,
};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rcgen::CertifiedKey;
use rustls::{crypto::CryptoProvider, pki_types::ServerName, ClientConfig, ServerConfig};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use turnstile_tls_util::{
    cert_and_key_pem, generate_ca, generate_server_cert, union_root_store, StaticCaProvider,
    StaticCertProvider,
};

use crate::{
    authenticate::{AuthError, TokenAuthenticator},
    authorize::test::RecordingAuthorizer,
    identity::UserIdentity,
    request::is_upgrade_request,
    response::{full_body, BoxBody},
    server::{ImpersonationProxy, ProxyOptions, UpstreamOverrides},
    transport::{HttpVersion, UpstreamSender},
};

pub(crate) fn crypto() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// [`TokenAuthenticator`] that answers from a queue, one entry per call.
/// Lets a test authenticate a token one way and review it another, the way
/// a stale cache entry would.
pub(crate) struct SequencedTokenAuthenticator {
    responses: Mutex<VecDeque<Option<UserIdentity>>>,
}

impl SequencedTokenAuthenticator {
    pub(crate) fn new(responses: impl IntoIterator<Item = Option<UserIdentity>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
        }
    }
}

#[async_trait]
impl TokenAuthenticator for SequencedTokenAuthenticator {
    async fn authenticate(&self, _token: &str) -> Result<Option<UserIdentity>, AuthError> {
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }
}

/// What the fake upstream observed for one forwarded request.
#[derive(Debug)]
pub(crate) struct RecordedRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

/// A TLS-terminating fake API server that records every request it sees.
///
/// Routes:
/// * upgrade requests are answered with 101 and an echo loop,
/// * `watch=true` queries stream one event immediately and then stay open,
/// * `/hang` never answers,
/// * everything else gets a small JSON body.
pub(crate) struct FakeUpstream {
    pub addr: SocketAddr,
    pub ca: CertifiedKey,
    requests: tokio::sync::Mutex<mpsc::UnboundedReceiver<RecordedRequest>>,
}

impl FakeUpstream {
    pub(crate) async fn start(shutdown: CancellationToken) -> Self {
        let ca = generate_ca("upstream-ca").unwrap();
        let serving = generate_server_cert("127.0.0.1", &ca).unwrap();

        let mut server_config = ServerConfig::builder_with_provider(crypto())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(
                vec![serving.cert.der().clone()],
                serving.key_pair.serialize_der().try_into().unwrap(),
            )
            .unwrap();
        server_config.alpn_protocols =
            vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let service = UpstreamService {
            tx,
            shutdown: shutdown.clone(),
        };

        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, _)) => stream,
                        Err(..) => continue,
                    },
                    _ = shutdown.cancelled() => break,
                };

                let Ok(stream) = acceptor.accept(stream).await else {
                    continue;
                };
                let http2 = stream.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());
                let service = service.clone();

                tokio::spawn(async move {
                    if http2 {
                        let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::default())
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    } else {
                        let _ = hyper::server::conn::http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .with_upgrades()
                            .await;
                    }
                });
            }
        });

        Self {
            addr,
            ca,
            requests: tokio::sync::Mutex::new(rx),
        }
    }

    /// Next request the upstream saw, or a panic after one second.
    pub(crate) async fn recorded(&self) -> RecordedRequest {
        let mut requests = self.requests.lock().await;
        tokio::time::timeout(std::time::Duration::from_secs(1), requests.recv())
            .await
            .expect("no request reached the upstream in time")
            .expect("upstream recording channel closed")
    }

    /// Asserts that nothing reached the upstream.
    pub(crate) async fn assert_no_request(&self) {
        assert!(
            self.requests.lock().await.try_recv().is_err(),
            "a request unexpectedly reached the upstream",
        );
    }
}

#[derive(Clone)]
struct UpstreamService {
    tx: mpsc::UnboundedSender<RecordedRequest>,
    shutdown: CancellationToken,
}

impl Service<Request<Incoming>> for UpstreamService {
    type Response = Response<BoxBody>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn call(&self, mut request: Request<Incoming>) -> Self::Future {
        let tx = self.tx.clone();
        let shutdown = self.shutdown.clone();

        Box::pin(async move {
            let upgrade = is_upgrade_request(request.headers())
                .then(|| hyper::upgrade::on(&mut request));

            let _ = tx.send(RecordedRequest {
                method: request.method().clone(),
                uri: request.uri().clone(),
                version: request.version(),
                headers: request.headers().clone(),
            });

            if let Some(on_upgrade) = upgrade {
                tokio::spawn(echo_upgraded(on_upgrade));

                let response = Response::builder()
                    .status(StatusCode::SWITCHING_PROTOCOLS)
                    .header(CONNECTION, "Upgrade")
                    .header(UPGRADE, "SPDY/3.1")
                    .body(full_body(Bytes::new()))
                    .unwrap();
                return Ok(response);
            }

            if request.uri().path() == "/hang" {
                std::future::pending::<()>().await;
            }

            let watch = request
                .uri()
                .query()
                .is_some_and(|query| query.contains("watch=true"));
            if watch {
                let (frame_tx, frame_rx) =
                    mpsc::channel::<Result<Frame<Bytes>, hyper::Error>>(4);
                frame_tx
                    .try_send(Ok(Frame::data(Bytes::from_static(b"event-1\n"))))
                    .unwrap();
                // Keep the stream open until the harness shuts down.
                tokio::spawn(async move {
                    shutdown.cancelled().await;
                    drop(frame_tx);
                });

                let body = BodyExt::boxed(StreamBody::new(ReceiverStream::new(frame_rx)));
                return Ok(Response::new(body));
            }

            let response = Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json")
                .body(full_body(Bytes::from_static(b"{\"kind\":\"PodList\"}")))
                .unwrap();
            Ok(response)
        })
    }
}

async fn echo_upgraded(on_upgrade: OnUpgrade) {
    let Ok(upgraded) = on_upgrade.await else {
        return;
    };
    let mut io = TokioIo::new(upgraded);
    let mut buffer = [0u8; 1024];

    loop {
        match io.read(&mut buffer).await {
            Ok(0) | Err(..) => break,
            Ok(n) => {
                if io.write_all(&buffer[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// A running proxy wired to a [`FakeUpstream`] through the test seams.
pub(crate) struct Harness {
    pub proxy_addr: SocketAddr,
    pub serving_ca_pem: Vec<u8>,
    pub signer_ca: CertifiedKey,
    pub upstream: FakeUpstream,
    pub delegate: Arc<RecordingAuthorizer>,
    pub shutdown: CancellationToken,
    _token_dir: tempfile::TempDir,
}

pub(crate) const PROXY_SA_TOKEN: &str = "proxy-sa-token";

impl Harness {
    pub(crate) async fn start(
        authenticator: Arc<dyn TokenAuthenticator>,
        delegate: Arc<RecordingAuthorizer>,
        tune: Option<&(dyn Fn(&mut ProxyOptions) + Send + Sync)>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let upstream = FakeUpstream::start(shutdown.child_token()).await;

        let token_dir = tempfile::tempdir().unwrap();
        let token_path = token_dir.path().join("token");
        std::fs::write(&token_path, PROXY_SA_TOKEN).unwrap();

        let kube_config = upstream_kube_config(&upstream, &token_path);

        let serving_ca = generate_ca("proxy-serving-ca").unwrap();
        let serving_cert = generate_server_cert("127.0.0.1", &serving_ca).unwrap();
        let signer_ca = generate_ca("impersonation-signer-ca").unwrap();

        let overrides = UpstreamOverrides {
            config: Some(kube_config),
            authenticator: Some(authenticator),
            authorizer: Some(delegate.clone()),
            client_ca: Some(Arc::new(StaticCaProvider::default())),
        };

        let proxy = ImpersonationProxy::new_internal(
            0,
            Arc::new(StaticCertProvider::new(cert_and_key_pem(&serving_cert))),
            Arc::new(StaticCaProvider::new(cert_and_key_pem(&signer_ca).cert)),
            Some(overrides),
            tune,
        )
        .await
        .unwrap();

        let proxy_addr = proxy.local_addr().unwrap();
        tokio::spawn(proxy.run(shutdown.child_token()));

        Self {
            proxy_addr,
            serving_ca_pem: cert_and_key_pem(&serving_ca).cert,
            signer_ca,
            upstream,
            delegate,
            shutdown,
            _token_dir: token_dir,
        }
    }

    /// Opens a TLS connection to the proxy, optionally presenting a client
    /// certificate, and completes the HTTP handshake for `version`.
    pub(crate) async fn client(
        &self,
        client_cert: Option<&CertifiedKey>,
        version: HttpVersion,
    ) -> UpstreamSender<Full<Bytes>> {
        let roots = union_root_store([self.serving_ca_pem.as_slice()]);
        let builder = ClientConfig::builder_with_provider(crypto())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots);

        let mut config = match client_cert {
            Some(certified) => builder
                .with_client_auth_cert(
                    vec![certified.cert.der().clone()],
                    certified.key_pair.serialize_der().try_into().unwrap(),
                )
                .unwrap(),
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = match version {
            HttpVersion::V1 => vec![b"http/1.1".to_vec()],
            HttpVersion::V2 => vec![b"h2".to_vec()],
        };

        let stream = TcpStream::connect(("127.0.0.1", self.proxy_addr.port()))
            .await
            .unwrap();
        let stream = TlsConnector::from(Arc::new(config))
            .connect(ServerName::try_from("127.0.0.1").unwrap(), stream)
            .await
            .unwrap();

        UpstreamSender::handshake(TokioIo::new(stream), version)
            .await
            .unwrap()
    }
}

pub(crate) fn upstream_kube_config(
    upstream: &FakeUpstream,
    token_path: &std::path::Path,
) -> kube::Config {
    let mut config = kube::Config::new(
        format!("https://127.0.0.1:{}", upstream.addr.port())
            .parse()
            .unwrap(),
    );
    config.root_cert = Some(vec![upstream.ca.cert.der().to_vec()]);
    config.auth_info.token_file = Some(token_path.to_string_lossy().into_owned());
    config
}

/// Request builder with the right URI shape per protocol: HTTP/1.1 talks
/// origin-form, HTTP/2 wants an absolute URI for its pseudo headers.
pub(crate) fn proxy_request(
    harness: &Harness,
    version: HttpVersion,
    method: Method,
    path_and_query: &str,
) -> hyper::http::request::Builder {
    match version {
        HttpVersion::V1 => Request::builder()
            .method(method)
            .uri(path_and_query)
            .header("host", format!("127.0.0.1:{}", harness.proxy_addr.port())),
        HttpVersion::V2 => Request::builder().method(method).uri(format!(
            "https://127.0.0.1:{}{path_and_query}",
            harness.proxy_addr.port()
        )),
    }
}

pub(crate) fn empty_full_body() -> Full<Bytes> {
    Full::new(Bytes::new())
}

/// Reads the whole response body.
pub(crate) async fn read_body(response: Response<Incoming>) -> Bytes {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
}

/// Drives an incoming body until its first data frame.
pub(crate) async fn first_data_frame(body: &mut Incoming) -> Bytes {
    loop {
        let frame = body
            .frame()
            .await
            .expect("body ended before the first data frame")
            .expect("body errored before the first data frame");
        if let Ok(data) = frame.into_data() {
            return data;
        }
    }
}
