use hyper::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use thiserror::Error;

use crate::{
    authorize::{Attributes, Authorizer, AuthzError},
    identity::{UserIdentity, ANONYMOUS_USER, AUTHENTICATED_GROUP, UNAUTHENTICATED_GROUP},
    rewrite::unescape_extra_key,
};

pub(crate) const IMPERSONATE_USER_HEADER: HeaderName =
    HeaderName::from_static("impersonate-user");
pub(crate) const IMPERSONATE_GROUP_HEADER: HeaderName =
    HeaderName::from_static("impersonate-group");
pub(crate) const IMPERSONATE_EXTRA_PREFIX: &str = "impersonate-extra-";

/// Response headers set on every response so browsers do the right thing,
/// even for error responses rendered before the proxy runs.
const SECURITY_HEADERS: [(HeaderName, HeaderValue); 9] = [
    (
        HeaderName::from_static("content-security-policy"),
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    ),
    (
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    ),
    (
        HeaderName::from_static("x-xss-protection"),
        HeaderValue::from_static("1; mode=block"),
    ),
    (
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    ),
    (
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    ),
    (
        HeaderName::from_static("x-dns-prefetch-control"),
        HeaderValue::from_static("off"),
    ),
    (
        HeaderName::from_static("cache-control"),
        HeaderValue::from_static("no-cache,no-store,max-age=0,must-revalidate"),
    ),
    (
        HeaderName::from_static("pragma"),
        HeaderValue::from_static("no-cache"),
    ),
    (
        HeaderName::from_static("expires"),
        HeaderValue::from_static("0"),
    ),
];

pub(crate) fn apply_security_headers(headers: &mut HeaderMap) {
    for (name, value) in SECURITY_HEADERS {
        headers.insert(name, value);
    }
}

/// Extracts the bearer token from `Authorization` without validating it.
///
/// Runs before the authentication filter deletes the header; the value is
/// carried forward privately so the token passthrough path can re-use it.
/// Callers must never log the returned token.
pub(crate) fn capture_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;

    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

/// Returns the canonical name of any header whose name begins with
/// `Impersonate`, known or not.
pub(crate) fn find_impersonation_header(headers: &HeaderMap) -> Option<String> {
    headers
        .keys()
        .find(|name| name.as_str().starts_with("impersonate"))
        .map(|name| canonical_name(name.as_str()))
}

fn canonical_name(lowercase: &str) -> String {
    let mut out = String::with_capacity(lowercase.len());
    let mut upper_next = true;
    for c in lowercase.chars() {
        if upper_next {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        upper_next = c == '-';
    }
    out
}

/// Removes the known impersonation headers, returning a fresh map.
///
/// Returns [`None`] when there is nothing to remove, so callers can skip
/// cloning on the common path. Unknown future `Impersonate-*` headers are
/// left alone on purpose; the proxy entry check catches them later.
pub(crate) fn scrub_impersonation_headers(headers: &HeaderMap) -> Option<HeaderMap> {
    let known_impersonation = |name: &HeaderName| {
        *name == IMPERSONATE_USER_HEADER
            || *name == IMPERSONATE_GROUP_HEADER
            || name.as_str().starts_with(IMPERSONATE_EXTRA_PREFIX)
    };

    if !headers.keys().any(known_impersonation) {
        return None;
    }

    let mut scrubbed = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !known_impersonation(name) {
            scrubbed.append(name.clone(), value.clone());
        }
    }

    Some(scrubbed)
}

#[derive(Debug, Error)]
pub(crate) enum ImpersonationError {
    #[error("{0}")]
    Forbidden(String),

    #[error("invalid impersonation request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Authz(#[from] AuthzError),
}

/// Outcome of processing inbound impersonation headers.
pub(crate) struct Impersonated {
    /// The identity the rest of the request runs as.
    pub user: UserIdentity,
    /// The inbound headers with the processed impersonation headers removed.
    pub headers: HeaderMap,
}

/// Applies the upstream impersonation protocol to the inbound request.
///
/// Each requested attribute is authorized for the requesting user with the
/// `impersonate` verb before the effective user is swapped. Returns
/// [`None`] when the request does not ask for impersonation.
pub(crate) async fn process_impersonation(
    headers: &HeaderMap,
    requester: &UserIdentity,
    authorizer: &dyn Authorizer,
) -> Result<Option<Impersonated>, ImpersonationError> {
    let target_user = headers
        .get(IMPERSONATE_USER_HEADER)
        .map(|value| {
            value
                .to_str()
                .map(str::to_string)
                .map_err(|_| ImpersonationError::BadRequest("user is not valid UTF-8".into()))
        })
        .transpose()?;

    let mut groups = Vec::new();
    for value in headers.get_all(IMPERSONATE_GROUP_HEADER) {
        let group = value
            .to_str()
            .map_err(|_| ImpersonationError::BadRequest("group is not valid UTF-8".into()))?;
        groups.push(group.to_string());
    }

    let mut extras = std::collections::BTreeMap::new();
    for (name, value) in headers {
        let Some(raw_key) = name.as_str().strip_prefix(IMPERSONATE_EXTRA_PREFIX) else {
            continue;
        };
        let key = unescape_extra_key(raw_key);
        let value = value
            .to_str()
            .map_err(|_| ImpersonationError::BadRequest("extra value is not valid UTF-8".into()))?;
        extras
            .entry(key)
            .or_insert_with(Vec::new)
            .push(value.to_string());
    }

    let Some(target_user) = target_user else {
        if groups.is_empty() && extras.is_empty() {
            return Ok(None);
        }
        return Err(ImpersonationError::BadRequest(
            "requested groups or user-extras without impersonating a user".into(),
        ));
    };

    authorize_attribute(
        authorizer,
        Attributes::for_impersonation(requester.clone(), "", "users", "", &target_user),
    )
    .await?;

    for group in &groups {
        authorize_attribute(
            authorizer,
            Attributes::for_impersonation(requester.clone(), "", "groups", "", group),
        )
        .await?;
    }

    for (key, values) in &extras {
        for value in values {
            authorize_attribute(
                authorizer,
                Attributes::for_impersonation(
                    requester.clone(),
                    "authentication.k8s.io",
                    "userextras",
                    key,
                    value,
                ),
            )
            .await?;
        }
    }

    let user = UserIdentity {
        name: target_user.clone(),
        uid: String::new(),
        groups,
        extras,
    };
    let user = if target_user == ANONYMOUS_USER {
        user.with_group(UNAUTHENTICATED_GROUP)
    } else {
        user.with_group(AUTHENTICATED_GROUP)
    };

    let headers = scrub_impersonation_headers(headers).unwrap_or_else(|| headers.clone());

    Ok(Some(Impersonated { user, headers }))
}

async fn authorize_attribute(
    authorizer: &dyn Authorizer,
    attributes: Attributes,
) -> Result<(), ImpersonationError> {
    match authorizer.authorize(&attributes).await? {
        crate::authorize::Decision::Allow { .. } => Ok(()),
        crate::authorize::Decision::Deny { reason } => {
            let target = if attributes.subresource.is_empty() {
                format!("{} {:?}", attributes.resource, attributes.name)
            } else {
                format!(
                    "{}/{} {:?}",
                    attributes.resource, attributes.subresource, attributes.name
                )
            };
            let detail = if reason.is_empty() {
                String::new()
            } else {
                format!(": {reason}")
            };
            Err(ImpersonationError::Forbidden(format!(
                "{} is not allowed to impersonate {target}{detail}",
                attributes.user.name,
            )))
        }
    }
}
