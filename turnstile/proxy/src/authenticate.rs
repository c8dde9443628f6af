use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec};
use kube::{api::PostParams, Api};
use rustls::pki_types::CertificateDer;
use thiserror::Error;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::identity::UserIdentity;

#[derive(Debug, Error)]
pub(crate) enum AuthError {
    #[error("token review request failed: {0}")]
    TokenReview(#[from] kube::Error),

    #[error("failed to parse the client certificate: {0}")]
    CertParse(String),

    #[error("client certificate has no common name")]
    NoCommonName,
}

/// Resolves a bearer token into a user identity, or [`None`] when the token
/// does not authenticate.
///
/// The review call must inherit cancellation from the inbound request and
/// nothing else; callers guarantee this by awaiting the returned future
/// inside the request task, where dropping the request drops the call.
#[async_trait]
pub(crate) trait TokenAuthenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Option<UserIdentity>, AuthError>;
}

/// [`TokenAuthenticator`] backed by the upstream's TokenReview API.
///
/// Audiences are left unset on purpose: the review then validates the token
/// against the upstream API server's own audience, which is exactly the
/// question the proxy needs answered before passing a token through.
pub(crate) struct TokenReviewAuthenticator {
    api: Api<TokenReview>,
}

impl TokenReviewAuthenticator {
    pub(crate) fn new(client: kube::Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl TokenAuthenticator for TokenReviewAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Option<UserIdentity>, AuthError> {
        let review = TokenReview {
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: None,
            },
            ..Default::default()
        };

        let created = self.api.create(&PostParams::default(), &review).await?;

        let Some(status) = created.status else {
            return Ok(None);
        };
        if status.authenticated != Some(true) {
            return Ok(None);
        }

        Ok(status.user.map(UserIdentity::from_user_info))
    }
}

/// Extracts the Kubernetes identity encoded in a verified client
/// certificate: CN is the user name and each O entry is a group.
///
/// The certificate was already validated against the union CA bundle during
/// the TLS handshake; this only reads the subject.
pub(crate) fn user_from_client_cert(der: &CertificateDer<'_>) -> Result<UserIdentity, AuthError> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|error| AuthError::CertParse(error.to_string()))?;

    let subject = cert.subject();
    let name = subject
        .iter_common_name()
        .next()
        .and_then(|attribute| attribute.as_str().ok())
        .ok_or(AuthError::NoCommonName)?
        .to_string();
    let groups = subject
        .iter_organization()
        .filter_map(|attribute| attribute.as_str().ok())
        .map(str::to_string)
        .collect();

    Ok(UserIdentity {
        name,
        groups,
        ..Default::default()
    })
}
