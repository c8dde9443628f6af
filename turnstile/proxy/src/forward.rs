use std::{collections::HashSet, net::IpAddr};

use http_body_util::BodyExt;
use hyper::{
    body::Incoming,
    header::{
        HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONNECTION, HOST, PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
    },
    http::{Method, Request, StatusCode, Uri, Version},
    upgrade::OnUpgrade,
};
use hyper_util::rt::TokioIo;
use thiserror::Error;

use crate::{
    filters::{IMPERSONATE_GROUP_HEADER, IMPERSONATE_USER_HEADER},
    request::is_upgrade_request,
    response::BoxResponse,
    rewrite::{escape_extra_key, OutboundCredential},
    transport::{Credential, HttpVersion, TransportError, UpstreamTransport},
};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

#[derive(Debug, Error)]
pub(crate) enum ForwardError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to send the request upstream: {0}")]
    Upstream(#[source] hyper::Error),

    #[error("failed to build the outgoing request: {0}")]
    BuildRequest(#[source] hyper::http::Error),

    #[error("outgoing credential does not match the transport")]
    CredentialMismatch,

    #[error("failed to attach an outbound header: {0}")]
    InvalidHeader(String),
}

/// Forwards the request to the upstream over the chosen transport, streaming
/// the response back and bridging protocol upgrades.
///
/// The client aborting mid-stream drops this future, which cancels the
/// upstream call; the finish marker is emitted from a drop guard so it fires
/// on that path too.
pub(crate) async fn forward(
    mut request: Request<Incoming>,
    base_uri: &Uri,
    transport: &UpstreamTransport,
    credential: &OutboundCredential,
    peer_ip: IpAddr,
) -> Result<BoxResponse, ForwardError> {
    let upgrade = is_upgrade_request(request.headers());
    let inbound_upgrade = upgrade.then(|| hyper::upgrade::on(&mut request));

    let (parts, body) = request.into_parts();

    let _finished = FinishGuard {
        method: parts.method.clone(),
        path: parts.uri.path().to_string(),
        upgrade,
    };

    let upgrade_protocol = parts.headers.get(UPGRADE).cloned();
    let mut headers = strip_hop_by_hop(&parts.headers);

    // Clients must not get to spoof this header; replace any inbound value
    // with the address the connection actually came from.
    headers.remove(X_FORWARDED_FOR);
    headers.insert(
        X_FORWARDED_FOR,
        HeaderValue::from_str(&peer_ip.to_string())
            .map_err(|_| ForwardError::InvalidHeader("x-forwarded-for".to_string()))?,
    );

    if upgrade {
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        if let Some(protocol) = upgrade_protocol {
            headers.insert(UPGRADE, protocol);
        }
    }

    let service_account_token = match (credential, &transport.credential) {
        (OutboundCredential::Impersonate(..), Credential::ServiceAccount(token_file)) => {
            Some(token_file.current().await?)
        }
        (OutboundCredential::BearerPassthrough(..), Credential::Anonymous) => None,
        _ => return Err(ForwardError::CredentialMismatch),
    };
    apply_credential(&mut headers, credential, service_account_token.as_deref())?;

    let authority = match base_uri.port_u16() {
        Some(port) => format!("{}:{port}", base_uri.host().unwrap_or_default()),
        None => base_uri.host().unwrap_or_default().to_string(),
    };
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let (uri, version) = match transport.version() {
        HttpVersion::V1 => {
            headers.insert(
                HOST,
                HeaderValue::from_str(&authority)
                    .map_err(|_| ForwardError::InvalidHeader("host".to_string()))?,
            );
            let uri = Uri::try_from(path_and_query)
                .map_err(|error| ForwardError::InvalidHeader(error.to_string()))?;
            (uri, Version::HTTP_11)
        }
        HttpVersion::V2 => {
            headers.remove(HOST);
            let uri = Uri::builder()
                .scheme("https")
                .authority(authority)
                .path_and_query(path_and_query)
                .build()
                .map_err(ForwardError::BuildRequest)?;
            (uri, Version::HTTP_2)
        }
    };

    let mut outbound = Request::builder()
        .method(parts.method)
        .uri(uri)
        .version(version)
        .body(body)
        .map_err(ForwardError::BuildRequest)?;
    *outbound.headers_mut() = headers;

    let mut sender = transport.connect().await?;
    let mut response = sender.send(outbound).await.map_err(ForwardError::Upstream)?;

    let outbound_upgrade = (response.status() == StatusCode::SWITCHING_PROTOCOLS)
        .then(|| hyper::upgrade::on(&mut response));

    match (inbound_upgrade, outbound_upgrade) {
        (Some(inbound), Some(outbound)) => {
            tokio::spawn(bridge_upgraded(inbound, outbound));
        }
        (_, Some(_)) => {
            tracing::warn!("Upstream switched protocols on a non-upgrade request.");
        }
        _ => {}
    }

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        let stripped = strip_hop_by_hop(response.headers());
        *response.headers_mut() = stripped;
    }

    Ok(response.map(BodyExt::boxed))
}

/// Attaches the outgoing identity: either the impersonation header set plus
/// the proxy's own credential, or the client's bearer token alone.
fn apply_credential(
    headers: &mut HeaderMap,
    credential: &OutboundCredential,
    service_account_token: Option<&str>,
) -> Result<(), ForwardError> {
    let bearer = |token: &str| {
        HeaderValue::from_str(&format!("Bearer {token}"))
            // The token value must not leak through the error.
            .map_err(|_| ForwardError::InvalidHeader("authorization".to_string()))
    };

    match credential {
        OutboundCredential::Impersonate(config) => {
            let token =
                service_account_token.ok_or(ForwardError::CredentialMismatch)?;
            headers.insert(AUTHORIZATION, bearer(token)?);

            headers.insert(
                IMPERSONATE_USER_HEADER,
                HeaderValue::from_str(&config.user)
                    .map_err(|_| ForwardError::InvalidHeader("impersonate-user".to_string()))?,
            );
            for group in &config.groups {
                headers.append(
                    IMPERSONATE_GROUP_HEADER,
                    HeaderValue::from_str(group).map_err(|_| {
                        ForwardError::InvalidHeader("impersonate-group".to_string())
                    })?,
                );
            }
            for (key, values) in &config.extra {
                let name = format!("impersonate-extra-{}", escape_extra_key(key));
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| ForwardError::InvalidHeader(name.clone()))?;
                for value in values {
                    headers.append(
                        name.clone(),
                        HeaderValue::from_str(value).map_err(|_| {
                            ForwardError::InvalidHeader(name.to_string())
                        })?,
                    );
                }
            }
        }
        OutboundCredential::BearerPassthrough(token) => {
            headers.insert(AUTHORIZATION, bearer(token)?);
        }
    }

    Ok(())
}

/// Copies headers minus the hop-by-hop set, including any header named by
/// `Connection`, per the usual reverse-proxy rules.
fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    const HOP_BY_HOP: [HeaderName; 8] = [
        CONNECTION,
        PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION,
        TE,
        TRAILER,
        TRANSFER_ENCODING,
        UPGRADE,
        HeaderName::from_static("keep-alive"),
    ];

    let connection_named = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .collect::<HashSet<_>>();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if HOP_BY_HOP.contains(name)
            || name.as_str() == "proxy-connection"
            || connection_named.contains(name.as_str())
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    out
}

async fn bridge_upgraded(inbound: OnUpgrade, outbound: OnUpgrade) {
    match tokio::try_join!(inbound, outbound) {
        Ok((inbound, outbound)) => {
            let mut inbound = TokioIo::new(inbound);
            let mut outbound = TokioIo::new(outbound);
            if let Err(error) = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
                tracing::debug!(%error, "Upgraded connection ended with an error.");
            }
        }
        Err(error) => {
            tracing::debug!(%error, "HTTP upgrade failed.");
        }
    }
}

/// Emits the finish marker when the request completes, including abrupt
/// client disconnects that drop the forwarding future mid-flight.
struct FinishGuard {
    method: Method,
    path: String,
    upgrade: bool,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        tracing::debug!(
            method = %self.method,
            path = %self.path,
            is_upgrade_request = self.upgrade,
            "impersonation proxy finished servicing request",
        );
    }
}
