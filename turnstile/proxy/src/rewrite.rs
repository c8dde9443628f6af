use std::{collections::BTreeMap, sync::LazyLock};

use regex::Regex;
use thiserror::Error;

use crate::{
    audit::AuditEvent,
    authenticate::{AuthError, TokenAuthenticator},
    identity::{
        UserIdentity, AUTHENTICATED_GROUP, ORIGINAL_USER_INFO_EXTRA_KEY, RESERVED_EXTRAS_SUFFIX,
    },
};

/// Conservative shape for extras keys.
///
/// The upstream impersonation protocol lowercases and URL-decodes extra
/// header keys, so anything outside this set could be silently mangled in
/// transit. Such keys are rejected instead.
static EXTRA_KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9/\-._]+$").expect("pattern is valid"));

#[derive(Debug, Error)]
pub(crate) enum RewriteError {
    #[error("disallowed extra key seen: {0}")]
    DisallowedExtraKey(String),

    #[error("disallowed extra key with reserved suffix seen: {0}")]
    ReservedExtraKey(String),

    #[error("unable to impersonate uid")]
    UidImpersonation,

    #[error("no token on request")]
    NoToken,

    #[error("token failed to authenticate")]
    TokenRejected,

    #[error("token authenticated as a different user")]
    TokenUserMismatch,

    #[error("failed to encode original user info: {0}")]
    EncodeUser(#[from] serde_json::Error),

    #[error(transparent)]
    TokenReview(#[from] AuthError),
}

/// Identity attached to the outgoing request on the full impersonation path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ImpersonationConfig {
    pub user: String,
    pub groups: Vec<String>,
    pub extra: BTreeMap<String, Vec<String>>,
}

/// How the outgoing request authenticates to the upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum OutboundCredential {
    /// Impersonation headers plus the proxy's own service account
    /// credential, sent over the credentialed transport.
    Impersonate(ImpersonationConfig),
    /// The client's own bearer token, sent over the anonymous transport.
    BearerPassthrough(String),
}

/// Decides how to re-issue the request for the authenticated user.
///
/// Full impersonation covers every user the impersonation protocol can
/// represent. A user with a UID falls through to token passthrough, where
/// the token is first re-verified so that a stale token presented alongside
/// a client certificate cannot smuggle a different identity upstream.
pub(crate) async fn plan_outbound(
    user: &UserIdentity,
    audit: &AuditEvent,
    token: Option<&str>,
    authenticator: &dyn TokenAuthenticator,
) -> Result<OutboundCredential, RewriteError> {
    if can_impersonate_fully(user) {
        let extra = build_extra(&user.extras, audit)?;
        return Ok(OutboundCredential::Impersonate(ImpersonationConfig {
            user: user.name.clone(),
            groups: user.groups.clone(),
            extra,
        }));
    }

    token_passthrough(audit, token, authenticator).await
}

/// The impersonation protocol carries name, groups and extras but not UID,
/// so only UID-less users can be represented faithfully.
pub(crate) fn can_impersonate_fully(user: &UserIdentity) -> bool {
    // Once the upstream supports UID impersonation, detect that capability
    // here and return true for those servers as well.
    user.uid.is_empty()
}

async fn token_passthrough(
    audit: &AuditEvent,
    token: Option<&str>,
    authenticator: &dyn TokenAuthenticator,
) -> Result<OutboundCredential, RewriteError> {
    // The final user has a UID here. If the audit event also records a
    // nested impersonation, that impersonation targets a UID, which the
    // upstream cannot express.
    if audit.impersonated_user.is_some() {
        return Err(RewriteError::UidImpersonation);
    }

    let token = token
        .filter(|token| !token.is_empty())
        .ok_or(RewriteError::NoToken)?;

    // Certificates take precedence over tokens during authentication, so
    // the stashed token is not necessarily the credential the user
    // authenticated with. Re-verify it and require the same identity before
    // passing it along. The authentication filter appends the authenticated
    // group, so the review result gets it too; both sides of the comparison
    // must have the same shape.
    let token_user = authenticator
        .authenticate(token)
        .await?
        .ok_or(RewriteError::TokenRejected)?
        .with_group(AUTHENTICATED_GROUP);

    if token_user != audit.user {
        tracing::trace!(
            original_username = %audit.user.name,
            original_uid = %audit.user.uid,
            token_username = %token_user.name,
            token_uid = %token_user.uid,
            "failed to pass through token due to user mismatch",
        );
        return Err(RewriteError::TokenUserMismatch);
    }

    Ok(OutboundCredential::BearerPassthrough(token.to_string()))
}

/// Validates the user's extras and, for nested impersonation, annotates them
/// with the pre-impersonation caller so downstream audit trails keep the
/// full chain.
fn build_extra(
    extras: &BTreeMap<String, Vec<String>>,
    audit: &AuditEvent,
) -> Result<BTreeMap<String, Vec<String>>, RewriteError> {
    for key in extras.keys() {
        validate_extra_key(key)?;
    }

    if audit.impersonated_user.is_none() {
        return Ok(extras.clone());
    }

    let mut out = extras.clone();
    let original_user = serde_json::to_string(&audit.user.to_user_info())?;
    out.insert(ORIGINAL_USER_INFO_EXTRA_KEY.to_string(), vec![original_user]);

    Ok(out)
}

pub(crate) fn validate_extra_key(key: &str) -> Result<(), RewriteError> {
    if !EXTRA_KEY_PATTERN.is_match(key) {
        return Err(RewriteError::DisallowedExtraKey(key.to_string()));
    }
    if key.ends_with(RESERVED_EXTRAS_SUFFIX) {
        return Err(RewriteError::ReservedExtraKey(key.to_string()));
    }

    Ok(())
}

/// Percent-encodes an extras key for use in an `Impersonate-Extra-` header
/// name. Within the allowed key shape only `/` needs escaping, but encode
/// defensively like a generic header escaper would.
pub(crate) fn escape_extra_key(key: &str) -> String {
    let mut escaped = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' => escaped.push(byte as char),
            _ => escaped.push_str(&format!("%{byte:02X}")),
        }
    }
    escaped
}

/// Reverses [`escape_extra_key`] for keys received in inbound impersonation
/// headers. Malformed escapes are kept verbatim; key validation rejects
/// them later.
pub(crate) fn unescape_extra_key(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let decoded = (bytes[i] == b'%')
            .then(|| {
                let hex = bytes.get(i + 1..i + 3)?;
                let hex = std::str::from_utf8(hex).ok()?;
                u8::from_str_radix(hex, 16).ok()
            })
            .flatten();

        match decoded {
            Some(byte) => {
                out.push(byte);
                i += 3;
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).to_ascii_lowercase()
}
