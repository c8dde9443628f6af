use hyper::{
    header::{HeaderMap, CONNECTION},
    http::{Method, Uri},
};

/// Parsed shape of a Kubernetes API request path.
///
/// Only the fields the proxy needs are extracted: enough for authorization
/// attributes, the long-running check and error negotiation. Anything that
/// does not parse as a resource request is treated as a non-resource path
/// with the lowercased method as its verb.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct RequestInfo {
    pub is_resource_request: bool,
    pub path: String,
    pub verb: String,
    pub api_group: String,
    pub api_version: String,
    pub namespace: String,
    pub resource: String,
    pub subresource: String,
    pub name: String,
}

impl RequestInfo {
    pub(crate) fn parse(method: &Method, uri: &Uri) -> Self {
        let path = uri.path().to_string();
        let non_resource = || Self {
            is_resource_request: false,
            path: path.clone(),
            verb: method.as_str().to_ascii_lowercase(),
            ..Default::default()
        };

        let segments = uri
            .path()
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>();

        let (api_group, api_version, mut rest) = match segments.as_slice() {
            ["api", version, rest @ ..] => (String::new(), version.to_string(), rest),
            ["apis", group, version, rest @ ..] => {
                (group.to_string(), version.to_string(), rest)
            }
            _ => return non_resource(),
        };

        if rest.is_empty() {
            return non_resource();
        }

        // "namespaces/<ns>/<resource>/..." scopes the remainder, while a bare
        // "namespaces/<ns>" is itself a request for the namespace object.
        let mut namespace = String::new();
        if rest[0] == "namespaces" && rest.len() > 2 {
            namespace = rest[1].to_string();
            rest = &rest[2..];
        }

        let resource = rest.first().copied().unwrap_or_default().to_string();
        let name = rest.get(1).copied().unwrap_or_default().to_string();
        let subresource = rest.get(2).copied().unwrap_or_default().to_string();

        let watch = watch_requested(uri);
        let verb = if *method == Method::GET || *method == Method::HEAD {
            if watch {
                "watch"
            } else if name.is_empty() {
                "list"
            } else {
                "get"
            }
        } else if *method == Method::POST {
            "create"
        } else if *method == Method::PUT {
            "update"
        } else if *method == Method::PATCH {
            "patch"
        } else if *method == Method::DELETE {
            if name.is_empty() {
                "deletecollection"
            } else {
                "delete"
            }
        } else {
            return non_resource();
        }
        .to_string();

        Self {
            is_resource_request: true,
            path,
            verb,
            api_group,
            api_version,
            namespace,
            resource,
            subresource,
            name,
        }
    }

    /// Long-running requests bypass the request timeout, matching the
    /// upstream API server's own long-running check for proxied verbs.
    pub(crate) fn is_long_running(&self) -> bool {
        matches!(self.verb.as_str(), "watch" | "proxy")
            || matches!(
                self.subresource.as_str(),
                "attach" | "exec" | "proxy" | "log" | "portforward"
            )
    }
}

fn watch_requested(uri: &Uri) -> bool {
    uri.query()
        .map(|query| {
            query.split('&').any(|pair| {
                matches!(
                    pair.split_once('=').map_or((pair, ""), |(k, v)| (k, v)),
                    ("watch", "true" | "1")
                )
            })
        })
        .unwrap_or(false)
}

/// Whether the request starts an HTTP/1.1 protocol upgrade (websockets or
/// SPDY streaming). Upgrades never ride HTTP/2.
pub(crate) fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.get_all(CONNECTION).iter().any(|value| {
        value
            .to_str()
            .map(|value| {
                value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
            })
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod test {
    use hyper::header::HeaderValue;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::core_list(Method::GET, "/api/v1/pods", "", "v1", "", "pods", "", "", "list")]
    #[case::core_get(
        Method::GET,
        "/api/v1/namespaces/default/pods/foo",
        "",
        "v1",
        "default",
        "pods",
        "foo",
        "",
        "get"
    )]
    #[case::watch(
        Method::GET,
        "/api/v1/pods?watch=true",
        "",
        "v1",
        "",
        "pods",
        "",
        "",
        "watch"
    )]
    #[case::watch_numeric(
        Method::GET,
        "/api/v1/pods?watch=1&resourceVersion=5",
        "",
        "v1",
        "",
        "pods",
        "",
        "",
        "watch"
    )]
    #[case::group_create(
        Method::POST,
        "/apis/apps/v1/namespaces/kube-system/deployments",
        "apps",
        "v1",
        "kube-system",
        "deployments",
        "",
        "",
        "create"
    )]
    #[case::subresource(
        Method::POST,
        "/api/v1/namespaces/default/pods/foo/exec",
        "",
        "v1",
        "default",
        "pods",
        "foo",
        "exec",
        "create"
    )]
    #[case::namespace_object(
        Method::GET,
        "/api/v1/namespaces/default",
        "",
        "v1",
        "",
        "namespaces",
        "default",
        "",
        "get"
    )]
    #[case::delete(
        Method::DELETE,
        "/api/v1/namespaces/default/pods/foo",
        "",
        "v1",
        "default",
        "pods",
        "foo",
        "",
        "delete"
    )]
    #[case::deletecollection(
        Method::DELETE,
        "/api/v1/namespaces/default/pods",
        "",
        "v1",
        "default",
        "pods",
        "",
        "",
        "deletecollection"
    )]
    #[allow(clippy::too_many_arguments)]
    fn resource_request_parsing(
        #[case] method: Method,
        #[case] uri: &str,
        #[case] group: &str,
        #[case] version: &str,
        #[case] namespace: &str,
        #[case] resource: &str,
        #[case] name: &str,
        #[case] subresource: &str,
        #[case] verb: &str,
    ) {
        let info = RequestInfo::parse(&method, &uri.parse().unwrap());

        assert!(info.is_resource_request);
        assert_eq!(info.api_group, group);
        assert_eq!(info.api_version, version);
        assert_eq!(info.namespace, namespace);
        assert_eq!(info.resource, resource);
        assert_eq!(info.name, name);
        assert_eq!(info.subresource, subresource);
        assert_eq!(info.verb, verb);
    }

    #[rstest]
    #[case::healthz(Method::GET, "/healthz", "get")]
    #[case::version(Method::GET, "/version", "get")]
    #[case::root(Method::POST, "/", "post")]
    #[case::bare_api(Method::GET, "/api", "get")]
    fn non_resource_request_parsing(
        #[case] method: Method,
        #[case] uri: &str,
        #[case] verb: &str,
    ) {
        let info = RequestInfo::parse(&method, &uri.parse().unwrap());

        assert!(!info.is_resource_request);
        assert_eq!(info.verb, verb);
    }

    #[rstest]
    #[case::watch_verb(Method::GET, "/api/v1/pods?watch=true", true)]
    #[case::plain_list(Method::GET, "/api/v1/pods", false)]
    #[case::exec(Method::POST, "/api/v1/namespaces/d/pods/p/exec", true)]
    #[case::log(Method::GET, "/api/v1/namespaces/d/pods/p/log", true)]
    #[case::portforward(Method::POST, "/api/v1/namespaces/d/pods/p/portforward", true)]
    #[case::status(Method::GET, "/api/v1/namespaces/d/pods/p/status", false)]
    fn long_running(#[case] method: Method, #[case] uri: &str, #[case] expected: bool) {
        let info = RequestInfo::parse(&method, &uri.parse().unwrap());
        assert_eq!(info.is_long_running(), expected);
    }

    #[test]
    fn upgrade_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_upgrade_request(&headers));

        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        assert!(!is_upgrade_request(&headers));

        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        assert!(is_upgrade_request(&headers));

        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, upgrade"));
        assert!(is_upgrade_request(&headers));
    }
}
