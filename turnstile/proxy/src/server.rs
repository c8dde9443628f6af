use std::{net::SocketAddr, pin::Pin, sync::Arc, time::Duration};

use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::{CancellationToken, DropGuard};
use turnstile_tls_util::{CaBundleProvider, ServingCertProvider, StaticCaProvider};

use crate::{
    audit::{AuditSink, LogAuditSink},
    authenticate::{user_from_client_cert, TokenAuthenticator, TokenReviewAuthenticator},
    authorize::{Authorizer, NestedImpersonationAuthorizer, SubjectAccessReviewAuthorizer},
    client_ca,
    error::{ProxyError, Result},
    service::{ConnectionContext, ProxyService, ProxyState},
    tls,
    transport::{UpstreamConfig, UpstreamTransports},
};

/// Test seam: replaces pieces that normally come from the in-cluster client.
/// Must be `None` in production.
#[derive(Default)]
pub(crate) struct UpstreamOverrides {
    pub config: Option<kube::Config>,
    pub authenticator: Option<Arc<dyn TokenAuthenticator>>,
    /// Replaces the delegating authorizer that backs the verb policy.
    pub authorizer: Option<Arc<dyn Authorizer>>,
    pub client_ca: Option<Arc<dyn CaBundleProvider>>,
}

/// Tunables applied between construction and the prepare step.
pub(crate) struct ProxyOptions {
    pub request_timeout: Duration,
    pub audit_sink: Arc<dyn AuditSink>,
    /// Replaces the authorizer the prepared server serves with. Anything
    /// other than the one installed at construction fails the post-prepare
    /// sanity check; the verb policy must not be wrapped or swapped.
    pub authorizer: Option<Arc<dyn Authorizer>>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            audit_sink: Arc::new(LogAuditSink),
            authorizer: None,
        }
    }
}

/// A fully constructed impersonation proxy, bound to its port and ready to
/// serve.
///
/// [`Self::run`] consumes the value, so a stopped proxy cannot be started
/// again; call [`Self::new`] for a fresh one.
pub(crate) struct ImpersonationProxy {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    state: Arc<ProxyState>,
    /// Cancels the client-CA watch when the proxy is dropped or finishes.
    _background: DropGuard,
}

impl ImpersonationProxy {
    pub(crate) async fn new(
        port: u16,
        serving_cert: Arc<dyn ServingCertProvider>,
        signer_ca: Arc<dyn CaBundleProvider>,
    ) -> Result<Self> {
        Self::new_internal(port, serving_cert, signer_ca, None, None).await
    }

    /// Builds the proxy synchronously. The listener is bound first, so any
    /// later failure drops it and frees the port before returning.
    pub(crate) async fn new_internal(
        port: u16,
        serving_cert: Arc<dyn ServingCertProvider>,
        signer_ca: Arc<dyn CaBundleProvider>,
        overrides: Option<UpstreamOverrides>,
        tune: Option<&(dyn Fn(&mut ProxyOptions) + Send + Sync)>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;

        let overrides = overrides.unwrap_or_default();
        let kube_config = match overrides.config.clone() {
            Some(config) => config,
            None => kube::Config::infer().await?,
        };
        let upstream = UpstreamConfig::from_kube(&kube_config)?;
        let crypto = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

        let client = if overrides.authenticator.is_none()
            || overrides.authorizer.is_none()
            || overrides.client_ca.is_none()
        {
            Some(kube::Client::try_from(kube_config.clone())?)
        } else {
            None
        };

        let authenticator: Arc<dyn TokenAuthenticator> =
            match (overrides.authenticator, client.as_ref()) {
                (Some(authenticator), _) => authenticator,
                (None, Some(client)) => Arc::new(TokenReviewAuthenticator::new(client.clone())),
                (None, None) => unreachable!("client is built whenever an override is missing"),
            };

        let delegate: Arc<dyn Authorizer> = match (overrides.authorizer, client.as_ref()) {
            (Some(authorizer), _) => authorizer,
            (None, Some(client)) => Arc::new(SubjectAccessReviewAuthorizer::new(client.clone())),
            (None, None) => unreachable!("client is built whenever an override is missing"),
        };
        let nested: Arc<dyn Authorizer> = Arc::new(NestedImpersonationAuthorizer::new(delegate));

        let background = CancellationToken::new();
        let upstream_client_ca: Arc<dyn CaBundleProvider> =
            match (overrides.client_ca, client.as_ref()) {
                (Some(provider), _) => provider,
                (None, Some(client)) => {
                    let provider = Arc::new(StaticCaProvider::default());
                    client_ca::spawn_watch(
                        client.clone(),
                        provider.clone(),
                        background.child_token(),
                    );
                    provider
                }
                (None, None) => unreachable!("client is built whenever an override is missing"),
            };
        let background = background.drop_guard();

        let mut options = ProxyOptions::default();
        if let Some(tune) = tune {
            tune(&mut options);
        }

        let transports = UpstreamTransports::new(&upstream, crypto.clone())?;

        let server_config = tls::server_config(
            serving_cert,
            signer_ca,
            upstream_client_ca,
            crypto,
        )?;
        let acceptor = TlsAcceptor::from(server_config);

        // Prepare step: this is the state the accept loop will serve with.
        let serving_authorizer = options.authorizer.unwrap_or_else(|| nested.clone());
        let state = Arc::new(ProxyState {
            base_uri: upstream.base_uri.clone(),
            transports,
            authenticator,
            authorizer: serving_authorizer,
            audit_sink: options.audit_sink,
            request_timeout: options.request_timeout,
        });

        // Post-prepare sanity checks. Violations are fatal, not warnings.
        if !Arc::ptr_eq(&state.authorizer, &nested) {
            return Err(ProxyError::SanityCheck(
                "invalid mutation of impersonation authorizer detected",
            ));
        }
        if kube_config.auth_info.token.is_some() || kube_config.auth_info.token_file.is_none() {
            return Err(ProxyError::SanityCheck(
                "invalid impersonator loopback rest config has wrong bearer token semantics",
            ));
        }

        Ok(Self {
            listener,
            acceptor,
            state,
            _background: background,
        })
    }

    pub(crate) fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Into::into)
    }

    /// Serves until `shutdown` fires, then drains in-flight connections.
    pub(crate) async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            listener,
            acceptor,
            state,
            _background,
        } = self;

        tracing::info!(addr = ?listener.local_addr().ok(), "Impersonation proxy is serving.");

        let mut connection_tasks = JoinSet::new();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(accepted) => accepted,
                        Err(error) => {
                            tracing::warn!(%error, "Failed to accept a connection.");
                            continue;
                        }
                    };

                    connection_tasks.spawn(handle_connection(
                        stream,
                        peer_addr,
                        acceptor.clone(),
                        state.clone(),
                        shutdown.clone(),
                    ));
                }
                _ = shutdown.cancelled() => break,
            }

            while connection_tasks.try_join_next().is_some() {}
        }

        // Stop accepting before draining.
        drop(listener);
        while connection_tasks.join_next().await.is_some() {}

        tracing::info!("Impersonation proxy stopped.");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    state: Arc<ProxyState>,
    shutdown: CancellationToken,
) {
    let stream = match acceptor.accept(stream).await {
        Ok(stream) => stream,
        Err(error) => {
            tracing::debug!(%error, %peer_addr, "TLS handshake failed.");
            return;
        }
    };

    let (_, server_conn) = stream.get_ref();
    let http2 = server_conn.alpn_protocol() == Some(tls::HTTP_2_ALPN_NAME);
    let cert_user = match server_conn
        .peer_certificates()
        .and_then(|certs| certs.first())
    {
        Some(der) => match user_from_client_cert(der) {
            Ok(user) => Some(user),
            Err(error) => {
                tracing::warn!(%error, %peer_addr, "Verified client certificate has no usable identity.");
                return;
            }
        },
        None => None,
    };

    let service = ProxyService {
        state,
        conn: Arc::new(ConnectionContext {
            peer_addr,
            cert_user,
        }),
    };

    if http2 {
        let mut conn = hyper::server::conn::http2::Builder::new(TokioExecutor::default())
            .serve_connection(TokioIo::new(stream), service);

        tokio::select! {
            result = &mut conn => log_connection_end(result, peer_addr),
            _ = shutdown.cancelled() => {
                Pin::new(&mut conn).graceful_shutdown();
                log_connection_end(conn.await, peer_addr);
            }
        }
    } else {
        let mut conn = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades();

        tokio::select! {
            result = &mut conn => log_connection_end(result, peer_addr),
            _ = shutdown.cancelled() => {
                Pin::new(&mut conn).graceful_shutdown();
                log_connection_end(conn.await, peer_addr);
            }
        }
    }
}

fn log_connection_end(result: hyper::Result<()>, peer_addr: SocketAddr) {
    // Abrupt client disconnects are expected, especially on long watches.
    if let Err(error) = result {
        tracing::debug!(%error, %peer_addr, "Connection ended with an error.");
    }
}
