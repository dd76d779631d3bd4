use std::collections::HashSet;

use http::{header, HeaderMap, HeaderValue, Response, StatusCode};

use crate::service::{empty_body, ResponseBody};

/// Origins allowed to call through the bridge. An empty configuration means
/// every origin, which is what development setups want.
#[derive(Debug, Clone)]
pub enum OriginAllowList {
    AllowAll,
    Exact(HashSet<String>),
}

impl OriginAllowList {
    pub fn new(origins: Vec<String>) -> Self {
        let origins: HashSet<String> = origins
            .into_iter()
            .filter(|origin| !origin.is_empty())
            .collect();
        if origins.is_empty() {
            Self::AllowAll
        } else {
            Self::Exact(origins)
        }
    }

    pub fn is_allowed(&self, origin: &str) -> bool {
        match self {
            Self::AllowAll => true,
            Self::Exact(origins) => origins.contains(origin),
        }
    }

    /// Header-level check: a non-UTF-8 origin can never match an exact list.
    pub fn allows(&self, origin: &HeaderValue) -> bool {
        match self {
            Self::AllowAll => true,
            Self::Exact(_) => origin
                .to_str()
                .map(|origin| self.is_allowed(origin))
                .unwrap_or(false),
        }
    }
}

/// Answer a CORS preflight. A rejected origin gets a bare 403 with no CORS
/// headers at all.
pub fn preflight(
    allow_list: &OriginAllowList,
    headers: &HeaderMap,
) -> Result<Response<ResponseBody>, http::Error> {
    let origin = headers.get(header::ORIGIN);
    let requested_method = headers.get(header::ACCESS_CONTROL_REQUEST_METHOD);
    let (Some(origin), Some(_)) = (origin, requested_method) else {
        return forbidden();
    };
    if !allow_list.allows(origin) {
        return forbidden();
    }

    let request_headers = headers
        .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
        .cloned()
        .unwrap_or_else(|| {
            HeaderValue::from_static("content-type,x-grpc-web,x-user-agent,grpc-timeout")
        });
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin)
        .header(header::ACCESS_CONTROL_ALLOW_METHODS, "POST")
        .header(header::ACCESS_CONTROL_ALLOW_HEADERS, request_headers)
        .header(header::ACCESS_CONTROL_MAX_AGE, "600")
        .body(empty_body())
}

/// CORS headers for an actual (non-preflight) response.
pub fn decorate(headers: &mut HeaderMap, origin: &HeaderValue) {
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("grpc-status,grpc-message,grpc-status-details-bin"),
    );
}

fn forbidden() -> Result<Response<ResponseBody>, http::Error> {
    Response::builder()
        .status(StatusCode::FORBIDDEN)
        .body(empty_body())
}
