//! Shared HTTP response helpers for policy and error responses

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::{Response, StatusCode};

/// Create an HTTP 403 response for blocked requests
pub fn blocked_response(method: &str, target: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = format!(
        "Blocked by proxy\n\nMethod: {}\nTarget: {}\n",
        method, target
    );

    Response::builder()
        .status(StatusCode::FORBIDDEN)
        .header("Content-Type", "text/plain")
        .header("X-Blocked-By", "thyroros")
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .unwrap()
}

/// Create an HTTP 502 Bad Gateway error response
pub fn error_response(message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = format!("Proxy error: {}\n", message);

    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header("Content-Type", "text/plain")
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .unwrap()
}

/// Create the 200 response for the liveness endpoint
pub fn health_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain")
        .body(Full::new(Bytes::from("OK")).map_err(|e| match e {}).boxed())
        .unwrap()
}

/// Create the empty 200 response that confirms an established CONNECT tunnel
pub fn connect_established_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .body(Empty::<Bytes>::new().map_err(|e| match e {}).boxed())
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_report;

    #[test]
    fn test_blocked_response() {
        let t = test_report!("Blocked response returns 403");
        let resp = blocked_response("GET", "example.com/blocked");
        t.assert_eq("Status", &resp.status(), &StatusCode::FORBIDDEN);
        t.assert_eq(
            "X-Blocked-By",
            &resp.headers().get("X-Blocked-By").unwrap().to_str().unwrap(),
            &"thyroros",
        );
    }

    #[test]
    fn test_error_response() {
        let t = test_report!("Error response returns 502");
        let resp = error_response("connection refused");
        t.assert_eq("Status", &resp.status(), &StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_health_response() {
        let t = test_report!("Health response returns 200");
        let resp = health_response();
        t.assert_eq("Status", &resp.status(), &StatusCode::OK);
    }

    #[test]
    fn test_connect_established_response() {
        let t = test_report!("CONNECT success response is an empty 200");
        let resp = connect_established_response();
        t.assert_eq("Status", &resp.status(), &StatusCode::OK);
    }
}
