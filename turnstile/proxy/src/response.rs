use bytes::Bytes;
use http_body_util::{combinators, BodyExt, Full};
use hyper::{
    header::CONTENT_TYPE,
    http::{Response, StatusCode, Version},
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;

use crate::request::RequestInfo;

/// Response body type used throughout the proxy: either a streamed upstream
/// body or a rendered error, boxed into one shape.
pub(crate) type BoxBody = combinators::BoxBody<Bytes, hyper::Error>;
pub(crate) type BoxResponse = Response<BoxBody>;

pub(crate) fn full_body(bytes: Bytes) -> BoxBody {
    Full::new(bytes).map_err(|_| unreachable!()).boxed()
}

/// Renders a Kubernetes `Status` error response.
///
/// The apiVersion is negotiated from the group/version parsed out of the
/// request path, so clients deserialize the failure with the codec they
/// used for the request.
pub(crate) fn status_response(
    info: &RequestInfo,
    version: Version,
    code: StatusCode,
    reason: &str,
    message: String,
) -> BoxResponse {
    let status = Status {
        code: Some(i32::from(code.as_u16())),
        message: Some(message),
        reason: Some(reason.to_string()),
        status: Some("Failure".to_string()),
        ..Default::default()
    };

    let mut body = serde_json::to_value(&status).unwrap_or_default();
    if let serde_json::Value::Object(map) = &mut body {
        if info.is_resource_request && !info.api_group.is_empty() {
            map.insert(
                "apiVersion".to_string(),
                format!("{}/{}", info.api_group, info.api_version).into(),
            );
        }
    }

    let bytes = serde_json::to_vec(&body).unwrap_or_default();

    Response::builder()
        .status(code)
        .version(version)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(bytes.into()))
        .unwrap()
}

pub(crate) fn internal_error(info: &RequestInfo, version: Version, message: &str) -> BoxResponse {
    status_response(
        info,
        version,
        StatusCode::INTERNAL_SERVER_ERROR,
        "InternalError",
        format!("Internal error occurred: {message}"),
    )
}

pub(crate) fn unauthorized(info: &RequestInfo, version: Version) -> BoxResponse {
    status_response(
        info,
        version,
        StatusCode::UNAUTHORIZED,
        "Unauthorized",
        "Unauthorized".to_string(),
    )
}

pub(crate) fn forbidden(info: &RequestInfo, version: Version, message: String) -> BoxResponse {
    status_response(info, version, StatusCode::FORBIDDEN, "Forbidden", message)
}

pub(crate) fn bad_request(info: &RequestInfo, version: Version, message: String) -> BoxResponse {
    status_response(info, version, StatusCode::BAD_REQUEST, "BadRequest", message)
}

pub(crate) fn timeout(info: &RequestInfo, version: Version) -> BoxResponse {
    status_response(
        info,
        version,
        StatusCode::GATEWAY_TIMEOUT,
        "Timeout",
        "request did not complete within the allowed duration".to_string(),
    )
}

pub(crate) fn bad_gateway(info: &RequestInfo, version: Version, message: String) -> BoxResponse {
    status_response(
        info,
        version,
        StatusCode::BAD_GATEWAY,
        "ServiceUnavailable",
        message,
    )
}

#[cfg(test)]
mod test {
    use hyper::http::Method;

    use super::*;

    async fn body_json(response: BoxResponse) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn core_group_renders_v1_status() {
        let info = RequestInfo::parse(&Method::GET, &"/api/v1/pods".parse().unwrap());
        let response = internal_error(&info, Version::HTTP_11, "invalid impersonation");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["kind"], "Status");
        assert_eq!(body["apiVersion"], "v1");
        assert_eq!(body["reason"], "InternalError");
        assert_eq!(
            body["message"],
            "Internal error occurred: invalid impersonation"
        );
        assert_eq!(body["code"], 500);
    }

    #[tokio::test]
    async fn named_group_negotiates_api_version() {
        let info = RequestInfo::parse(&Method::GET, &"/apis/apps/v1/deployments".parse().unwrap());
        let response = forbidden(&info, Version::HTTP_2, "nope".to_string());

        let body = body_json(response).await;
        assert_eq!(body["apiVersion"], "apps/v1");
        assert_eq!(body["reason"], "Forbidden");
    }
}
