use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use hyper::{
    body::Incoming,
    header::AUTHORIZATION,
    http::{Request, Uri, Version},
    service::Service,
};
use tracing::Instrument;

use crate::{
    audit::{AuditEvent, AuditSink},
    authenticate::TokenAuthenticator,
    authorize::{Attributes, Authorizer, Decision},
    filters::{
        apply_security_headers, capture_bearer_token, find_impersonation_header,
        process_impersonation, scrub_impersonation_headers, ImpersonationError,
    },
    forward::forward,
    identity::{UserIdentity, AUTHENTICATED_GROUP},
    request::{is_upgrade_request, RequestInfo},
    response::{self, BoxResponse},
    rewrite::{plan_outbound, OutboundCredential},
    transport::UpstreamTransports,
};

/// Immutable per-proxy state shared by all connections.
pub(crate) struct ProxyState {
    pub base_uri: Uri,
    pub transports: UpstreamTransports,
    pub authenticator: Arc<dyn TokenAuthenticator>,
    pub authorizer: Arc<dyn Authorizer>,
    pub audit_sink: Arc<dyn AuditSink>,
    pub request_timeout: Duration,
}

/// Per-connection context captured during the TLS handshake.
pub(crate) struct ConnectionContext {
    pub peer_addr: SocketAddr,
    /// Identity from the verified client certificate, if one was presented.
    /// Takes precedence over bearer tokens.
    pub cert_user: Option<UserIdentity>,
}

/// hyper service handling one inbound request end to end. Never fails;
/// errors are rendered as Kubernetes `Status` responses.
#[derive(Clone)]
pub(crate) struct ProxyService {
    pub state: Arc<ProxyState>,
    pub conn: Arc<ConnectionContext>,
}

impl Service<Request<Incoming>> for ProxyService {
    type Response = BoxResponse;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn call(&self, request: Request<Incoming>) -> Self::Future {
        let state = self.state.clone();
        let conn = self.conn.clone();

        Box::pin(async move { Ok(handle_request(state, conn, request).await) })
    }
}

/// Outermost filter: everything below runs inside the `securityheaders`
/// marker span and the fixed browser-safety headers are stamped onto
/// whatever response comes back, error or not.
async fn handle_request(
    state: Arc<ProxyState>,
    conn: Arc<ConnectionContext>,
    request: Request<Incoming>,
) -> BoxResponse {
    let version = request.version();

    let mut response = preserve_bearer_token(state, conn, request, version)
        .instrument(tracing::trace_span!("securityheaders"))
        .await;
    apply_security_headers(response.headers_mut());

    response
}

/// Grabs the raw bearer token before the standard chain deletes
/// `Authorization`. The token is carried in a plain local, never in any
/// logged structure.
async fn preserve_bearer_token(
    state: Arc<ProxyState>,
    conn: Arc<ConnectionContext>,
    request: Request<Incoming>,
    version: Version,
) -> BoxResponse {
    let span = tracing::trace_span!("bearertokenpreservation");
    async move {
        let token = capture_bearer_token(request.headers());
        standard_chain(state, conn, request, version, token).await
    }
    .instrument(span)
    .await
}

/// The analog of the hosting framework's default chain: request-info,
/// timeout for non-long-running requests, authentication, audit,
/// impersonation and authorization.
async fn standard_chain(
    state: Arc<ProxyState>,
    conn: Arc<ConnectionContext>,
    request: Request<Incoming>,
    version: Version,
    token: Option<String>,
) -> BoxResponse {
    let info = RequestInfo::parse(request.method(), request.uri());

    if info.is_long_running() {
        return authenticate_and_serve(state, conn, request, version, info, token).await;
    }

    let timeout = state.request_timeout;
    match tokio::time::timeout(
        timeout,
        authenticate_and_serve(state, conn, request, version, info.clone(), token),
    )
    .await
    {
        Ok(response) => response,
        Err(_) => response::timeout(&info, version),
    }
}

async fn authenticate_and_serve(
    state: Arc<ProxyState>,
    conn: Arc<ConnectionContext>,
    mut request: Request<Incoming>,
    version: Version,
    info: RequestInfo,
    token: Option<String>,
) -> BoxResponse {
    let user = if let Some(cert_user) = &conn.cert_user {
        cert_user.clone().with_group(AUTHENTICATED_GROUP)
    } else if let Some(token) = &token {
        match state.authenticator.authenticate(token).await {
            Ok(Some(user)) => user.with_group(AUTHENTICATED_GROUP),
            Ok(None) => return response::unauthorized(&info, version),
            Err(error) => {
                tracing::warn!(%error, "Token authentication failed.");
                return response::unauthorized(&info, version);
            }
        }
    } else {
        UserIdentity::anonymous()
    };

    // The standard chain consumes the inbound credential; only the stashed
    // copy survives, for the passthrough path.
    request.headers_mut().remove(AUTHORIZATION);

    let mut audit = AuditEvent::new(
        user.clone(),
        info.verb.clone(),
        request_uri(request.uri()),
    );

    let mut effective_user = user.clone();
    match process_impersonation(request.headers(), &user, state.authorizer.as_ref()).await {
        Ok(None) => {}
        Ok(Some(impersonated)) => {
            audit.impersonated_user = Some(impersonated.user.clone());
            effective_user = impersonated.user;
            *request.headers_mut() = impersonated.headers;
        }
        Err(ImpersonationError::Forbidden(message)) => {
            return response::forbidden(&info, version, message)
        }
        Err(ImpersonationError::BadRequest(message)) => {
            return response::bad_request(&info, version, message)
        }
        Err(ImpersonationError::Authz(error)) => {
            tracing::warn!(%error, "Impersonation authorization failed.");
            return response::internal_error(&info, version, "authorization failed");
        }
    }

    let attributes = Attributes::for_request(effective_user.clone(), &info);
    match state.authorizer.authorize(&attributes).await {
        Ok(Decision::Allow { .. }) => {}
        Ok(Decision::Deny { reason }) => {
            let message = if reason.is_empty() {
                format!(
                    "User {:?} cannot {} the requested resource",
                    effective_user.name, info.verb,
                )
            } else {
                reason
            };
            return response::forbidden(&info, version, message);
        }
        Err(error) => {
            tracing::warn!(%error, "Request authorization failed.");
            return response::internal_error(&info, version, "authorization failed");
        }
    }

    // One metadata-level event per request, written before forwarding so
    // the original caller of a nested impersonation is always on record.
    state.audit_sink.process(&audit);

    scrub_and_proxy(
        state,
        conn,
        request,
        version,
        info,
        effective_user,
        audit,
        token,
    )
    .await
}

/// Removes any impersonation headers the standard chain left behind, then
/// hands off to the terminal proxy handler. Never mutates shared state; the
/// scrub builds a fresh header map.
#[allow(clippy::too_many_arguments)]
async fn scrub_and_proxy(
    state: Arc<ProxyState>,
    conn: Arc<ConnectionContext>,
    mut request: Request<Incoming>,
    version: Version,
    info: RequestInfo,
    user: UserIdentity,
    audit: AuditEvent,
    token: Option<String>,
) -> BoxResponse {
    let span = tracing::trace_span!("deleteimpersonationheaders");
    async move {
        if let Some(scrubbed) = scrub_impersonation_headers(request.headers()) {
            *request.headers_mut() = scrubbed;
        }

        impersonation_proxy(
            &state,
            &conn,
            request,
            version,
            &info,
            Some(&user),
            Some(&audit),
            token.as_deref(),
        )
        .instrument(tracing::trace_span!("impersonationproxy"))
        .await
    }
    .instrument(span)
    .await
}

/// Terminal handler: re-issues the request upstream on behalf of the
/// authenticated user.
///
/// The first four checks are defense in depth against the standard chain
/// failing to do its job; each renders an internal error rather than
/// trusting the request any further.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn impersonation_proxy(
    state: &ProxyState,
    conn: &ConnectionContext,
    request: Request<Incoming>,
    version: Version,
    info: &RequestInfo,
    user: Option<&UserIdentity>,
    audit: Option<&AuditEvent>,
    token: Option<&str>,
) -> BoxResponse {
    let path = request.uri().path().to_string();
    let method = request.method().clone();

    if request.headers().get(AUTHORIZATION).is_some() {
        tracing::warn!(
            %path,
            %method,
            "The standard filter chain did not delete the authorization header but it is always supposed to do so.",
        );
        return response::internal_error(info, version, "invalid authorization header");
    }

    if let Some(header) = find_impersonation_header(request.headers()) {
        tracing::error!(
            %path,
            %method,
            %header,
            "An impersonation header reached the proxy handler.",
        );
        return response::internal_error(info, version, "invalid impersonation");
    }

    let Some(user) = user else {
        tracing::warn!(
            %path,
            %method,
            "The standard filter chain did not set user info but it is always supposed to do so.",
        );
        return response::internal_error(info, version, "invalid user");
    };

    let Some(audit) = audit else {
        tracing::warn!(
            %path,
            %method,
            "The standard filter chain did not set an audit event but it is always supposed to do so.",
        );
        return response::internal_error(info, version, "invalid audit event");
    };

    // Upgrades only work over HTTP/1.1, everything else defaults to HTTP/2.
    let upgrade = is_upgrade_request(request.headers());

    let plan = match plan_outbound(user, audit, token, state.authenticator.as_ref()).await {
        Ok(plan) => plan,
        Err(error) => {
            tracing::warn!(
                %error,
                %path,
                %method,
                is_upgrade_request = upgrade,
                "rejecting request as we cannot act as the current user",
            );
            return response::internal_error(
                info,
                version,
                "unimplemented functionality - unable to act as current user",
            );
        }
    };

    let transport = match &plan {
        OutboundCredential::Impersonate(..) => state.transports.credentialed(upgrade),
        OutboundCredential::BearerPassthrough(..) => state.transports.anonymous(upgrade),
    };

    tracing::debug!(
        %path,
        %method,
        is_upgrade_request = upgrade,
        "impersonation proxy servicing request",
    );
    tracing::trace!(
        %path,
        %method,
        is_upgrade_request = upgrade,
        username = %user.name,
        "impersonation proxy servicing request was for user",
    );

    match forward(
        request,
        &state.base_uri,
        transport,
        &plan,
        conn.peer_addr.ip(),
    )
    .await
    {
        Ok(response) => response,
        Err(error) => {
            tracing::warn!(%error, %path, %method, "Failed to proxy the request upstream.");
            response::bad_gateway(
                info,
                version,
                "failed to reach the upstream API server".to_string(),
            )
        }
    }
}

fn request_uri(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string())
}
