use crate::identity::UserIdentity;

/// How much of a request is recorded. Only metadata is captured here, the
/// proxy never buffers request or response bodies for auditing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AuditLevel {
    Metadata,
}

/// Audit record for a single proxied request.
///
/// `user` is always the identity that authenticated to the proxy. When the
/// request performs a nested impersonation, `impersonated_user` is the
/// target identity and the upstream additionally receives `user` through the
/// original-user-info extras annotation.
#[derive(Clone, Debug)]
pub(crate) struct AuditEvent {
    pub level: AuditLevel,
    pub user: UserIdentity,
    pub impersonated_user: Option<UserIdentity>,
    pub verb: String,
    pub request_uri: String,
}

impl AuditEvent {
    pub(crate) fn new(user: UserIdentity, verb: String, request_uri: String) -> Self {
        Self {
            level: AuditLevel::Metadata,
            user,
            impersonated_user: None,
            verb,
            request_uri,
        }
    }
}

/// Pluggable destination for audit events. One event is processed per
/// request, before the request is forwarded upstream.
pub(crate) trait AuditSink: Send + Sync {
    fn process(&self, event: &AuditEvent);
}

/// Default sink, writes events to the log stream.
pub(crate) struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn process(&self, event: &AuditEvent) {
        tracing::info!(
            target: "audit",
            user = %event.user.name,
            impersonated_user = event.impersonated_user.as_ref().map(|user| user.name.as_str()),
            verb = %event.verb,
            uri = %event.request_uri,
            level = ?event.level,
            "request audit",
        );
    }
}
