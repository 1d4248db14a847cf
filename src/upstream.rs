//! HTTP client for the origin fallback proxy
//!
//! When no bundled asset satisfies a request, the router forwards it to the
//! virtual host's real remote origin through this client. The request targets
//! the origin URL directly, so the outbound `Host` header is the origin's own
//! hostname (origin-changing proxy). Bodies stream in both directions.

use crate::error::{json_error_response, BoxError, BoxedBody, GatewayErrorCode};
use futures::TryStreamExt;
use http_body_util::{BodyExt, BodyStream, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::http::request::Parts;
use hyper::{Method, Response, StatusCode};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Connect timeout for origin connections
const ORIGIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers that must not be forwarded in either direction.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Client for forwarding requests to remote origins.
pub struct OriginClient {
    client: reqwest::Client,
}

impl Default for OriginClient {
    fn default() -> Self {
        Self::new()
    }
}

impl OriginClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(ORIGIN_CONNECT_TIMEOUT)
            // Redirects stream back to the caller untouched
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client with static configuration");

        Self { client }
    }

    /// Forward a request to `origin`, preserving method, path, query, headers
    /// and body, and stream the origin's response back verbatim.
    ///
    /// Origin failures are recovered locally as 502/504 responses; they never
    /// propagate beyond the single request.
    pub async fn forward(&self, parts: Parts, body: Incoming, origin: &str) -> Response<BoxedBody> {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", origin, path_and_query);

        let method = match reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                return json_error_response(GatewayErrorCode::InternalError, "Unsupported method");
            }
        };

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in parts.headers.iter() {
            let name_str = name.as_str();
            // Host is rewritten to the origin's hostname by targeting its URL
            if is_hop_by_hop(name_str) || name_str == "host" || name_str == "content-length" {
                continue;
            }
            if let (Ok(n), Ok(v)) = (
                reqwest::header::HeaderName::from_bytes(name_str.as_bytes()),
                reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(n, v);
            }
        }

        let mut builder = self.client.request(method, &url).headers(headers);

        // GET/HEAD carry no body; everything else streams through
        if parts.method != Method::GET && parts.method != Method::HEAD {
            let body_stream = BodyStream::new(body)
                .try_filter_map(|frame| async move { Ok(frame.into_data().ok()) });
            builder = builder.body(reqwest::Body::wrap_stream(body_stream));
        }

        debug!(%url, "Forwarding request to origin");

        let origin_response = match builder.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                warn!(%url, error = %e, "Origin request timed out");
                return json_error_response(
                    GatewayErrorCode::OriginTimeout,
                    "Origin did not respond in time",
                );
            }
            Err(e) => {
                error!(%url, error = %e, "Failed to reach origin");
                return json_error_response(
                    GatewayErrorCode::OriginUnreachable,
                    "Failed to reach origin",
                );
            }
        };

        let status = StatusCode::from_u16(origin_response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);

        let mut response = Response::builder().status(status);
        for (name, value) in origin_response.headers().iter() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            response = response.header(name.as_str(), value.as_bytes());
        }

        let body_stream = origin_response
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(|e| Box::new(e) as BoxError);

        match response.body(StreamBody::new(body_stream).boxed()) {
            Ok(response) => response,
            Err(e) => {
                error!(%url, error = %e, "Failed to rebuild origin response");
                json_error_response(GatewayErrorCode::InternalError, "Invalid origin response")
            }
        }
    }
}
