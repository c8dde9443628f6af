use std::collections::BTreeMap;

use k8s_openapi::api::authentication::v1::UserInfo;

/// Well-known identity of requests that carry no credential.
pub(crate) const ANONYMOUS_USER: &str = "system:anonymous";
/// Group carried by all unauthenticated requests.
pub(crate) const UNAUTHENTICATED_GROUP: &str = "system:unauthenticated";
/// Group carried by all authenticated requests.
pub(crate) const AUTHENTICATED_GROUP: &str = "system:authenticated";

/// Extras keys ending in this suffix are reserved for annotations written by
/// this proxy; inbound requests may not use them.
pub(crate) const RESERVED_EXTRAS_SUFFIX: &str = ".impersonation-proxy.turnstile.dev";

/// Extras key under which the pre-impersonation caller is preserved when the
/// inbound request was itself a nested impersonation.
pub(crate) const ORIGINAL_USER_INFO_EXTRA_KEY: &str =
    "original-user-info.impersonation-proxy.turnstile.dev";

/// The user an inbound request resolved to.
///
/// Populated by the authentication filter and read-only afterwards. An empty
/// `uid` means the upstream impersonation protocol can represent this user
/// faithfully.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct UserIdentity {
    pub name: String,
    pub uid: String,
    pub groups: Vec<String>,
    pub extras: BTreeMap<String, Vec<String>>,
}

impl UserIdentity {
    pub(crate) fn anonymous() -> Self {
        Self {
            name: ANONYMOUS_USER.to_string(),
            groups: vec![UNAUTHENTICATED_GROUP.to_string()],
            ..Default::default()
        }
    }

    /// Appends `group` unless already present.
    pub(crate) fn with_group(mut self, group: &str) -> Self {
        if !self.groups.iter().any(|existing| existing == group) {
            self.groups.push(group.to_string());
        }
        self
    }

    /// Converts to the upstream wire shape, used both for audit annotations
    /// and for comparing token review results.
    pub(crate) fn to_user_info(&self) -> UserInfo {
        UserInfo {
            username: Some(self.name.clone()),
            uid: (!self.uid.is_empty()).then(|| self.uid.clone()),
            groups: (!self.groups.is_empty()).then(|| self.groups.clone()),
            extra: (!self.extras.is_empty()).then(|| self.extras.clone()),
        }
    }

    pub(crate) fn from_user_info(info: UserInfo) -> Self {
        Self {
            name: info.username.unwrap_or_default(),
            uid: info.uid.unwrap_or_default(),
            groups: info.groups.unwrap_or_default(),
            extras: info.extra.unwrap_or_default(),
        }
    }
}
