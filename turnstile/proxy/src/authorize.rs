use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    NonResourceAttributes, ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
};
use kube::{api::PostParams, Api};
use thiserror::Error;

use crate::{identity::UserIdentity, request::RequestInfo};

#[derive(Debug, Error)]
pub(crate) enum AuthzError {
    #[error("subject access review request failed: {0}")]
    SubjectAccessReview(#[from] kube::Error),
}

/// Attributes of one authorization question: can `user` perform `verb` on
/// the described target?
#[derive(Clone, Debug)]
pub(crate) struct Attributes {
    pub user: UserIdentity,
    pub verb: String,
    pub api_group: String,
    pub resource: String,
    pub subresource: String,
    pub namespace: String,
    pub name: String,
    pub path: String,
    pub is_resource_request: bool,
}

impl Attributes {
    pub(crate) fn for_request(user: UserIdentity, info: &RequestInfo) -> Self {
        Self {
            user,
            verb: info.verb.clone(),
            api_group: info.api_group.clone(),
            resource: info.resource.clone(),
            subresource: info.subresource.clone(),
            namespace: info.namespace.clone(),
            name: info.name.clone(),
            path: info.path.clone(),
            is_resource_request: info.is_resource_request,
        }
    }

    /// Attributes asking whether `user` may impersonate the named target
    /// (a `users`, `groups` or `userextras/<key>` resource).
    pub(crate) fn for_impersonation(
        user: UserIdentity,
        api_group: &str,
        resource: &str,
        subresource: &str,
        name: &str,
    ) -> Self {
        Self {
            user,
            verb: "impersonate".to_string(),
            api_group: api_group.to_string(),
            resource: resource.to_string(),
            subresource: subresource.to_string(),
            namespace: String::new(),
            name: name.to_string(),
            path: String::new(),
            is_resource_request: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Decision {
    Allow { reason: String },
    Deny { reason: String },
}

#[async_trait]
pub(crate) trait Authorizer: Send + Sync {
    async fn authorize(&self, attributes: &Attributes) -> Result<Decision, AuthzError>;
}

/// Delegating authorizer backed by the upstream's SubjectAccessReview API.
pub(crate) struct SubjectAccessReviewAuthorizer {
    api: Api<SubjectAccessReview>,
}

impl SubjectAccessReviewAuthorizer {
    pub(crate) fn new(client: kube::Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl Authorizer for SubjectAccessReviewAuthorizer {
    async fn authorize(&self, attributes: &Attributes) -> Result<Decision, AuthzError> {
        let user = &attributes.user;
        let spec = SubjectAccessReviewSpec {
            user: Some(user.name.clone()),
            uid: (!user.uid.is_empty()).then(|| user.uid.clone()),
            groups: (!user.groups.is_empty()).then(|| user.groups.clone()),
            extra: (!user.extras.is_empty()).then(|| user.extras.clone()),
            resource_attributes: attributes.is_resource_request.then(|| ResourceAttributes {
                group: Some(attributes.api_group.clone()),
                resource: Some(attributes.resource.clone()),
                subresource: Some(attributes.subresource.clone()),
                namespace: Some(attributes.namespace.clone()),
                name: Some(attributes.name.clone()),
                verb: Some(attributes.verb.clone()),
                ..Default::default()
            }),
            non_resource_attributes: (!attributes.is_resource_request).then(|| {
                NonResourceAttributes {
                    path: Some(attributes.path.clone()),
                    verb: Some(attributes.verb.clone()),
                }
            }),
        };

        let review = SubjectAccessReview {
            spec,
            ..Default::default()
        };
        let created = self.api.create(&PostParams::default(), &review).await?;

        let status = created.status.unwrap_or_default();
        let reason = status.reason.unwrap_or_default();

        if status.allowed {
            Ok(Decision::Allow { reason })
        } else {
            Ok(Decision::Deny { reason })
        }
    }
}

/// Verbs that are safe to defer to the upstream API server, which will
/// re-authorize them against the impersonated identity.
const DEFERRED_VERBS: [&str; 9] = [
    "create",
    "update",
    "delete",
    "deletecollection",
    "get",
    "list",
    "watch",
    "patch",
    "proxy",
];

/// The authorizer installed in place of the default one.
///
/// Standard request verbs are deferred to the upstream, which re-authorizes
/// them against the impersonated identity. Everything else (including the
/// `impersonate` verb that makes nested impersonation work) is resolved here
/// against the requesting user, because the upstream would otherwise
/// evaluate those checks against the proxy's own service account.
pub(crate) struct NestedImpersonationAuthorizer {
    delegate: Arc<dyn Authorizer>,
}

impl NestedImpersonationAuthorizer {
    pub(crate) fn new(delegate: Arc<dyn Authorizer>) -> Self {
        Self { delegate }
    }
}

#[async_trait]
impl Authorizer for NestedImpersonationAuthorizer {
    async fn authorize(&self, attributes: &Attributes) -> Result<Decision, AuthzError> {
        match attributes.verb.as_str() {
            // Request parsing has had bugs that left the verb empty.
            "" => Ok(Decision::Deny {
                reason: "invalid verb".to_string(),
            }),
            verb if DEFERRED_VERBS.contains(&verb) => Ok(Decision::Allow {
                reason: "deferring standard verb authorization to the upstream API server"
                    .to_string(),
            }),
            _ => self.delegate.authorize(attributes).await,
        }
    }
}
