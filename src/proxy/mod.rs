//! HTTP proxy primitive (spec section 4.2): header policy, path policy and
//! the no-retry / single-retry forwarding entry points used by the
//! reverse-proxy routes, the tenant proxy and the Fly-Replay fallback.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, warn};

use crate::body::{self, ResponseBody};
use crate::error::NavigatorError;
use crate::util;

/// Headers that are scoped to a single hop and must never be forwarded
/// (spec 4.2 header policy).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

lazy_static! {
    static ref CLIENT: Client<HttpConnector, ResponseBody> =
        Client::builder(TokioExecutor::new()).build(HttpConnector::new());
}

#[derive(Debug, Clone)]
pub enum RoutePattern {
    Prefix(String),
    Regex(Regex),
}

#[derive(Debug, Clone)]
pub struct ProxyRoute {
    pub pattern: RoutePattern,
    pub target: String,
    pub strip_path: bool,
    pub websocket: bool,
    pub headers: HashMap<String, String>,
}

impl ProxyRoute {
    /// Returns the rewritten path (and, for regex routes with capture
    /// groups substituted into `target`, the full replacement URL) if this
    /// route matches `path`.
    pub fn matches<'a>(&'a self, path: &str) -> Option<RouteMatch<'a>> {
        match &self.pattern {
            RoutePattern::Prefix(prefix) => {
                if path.starts_with(prefix.as_str()) {
                    Some(RouteMatch { route: self, captures: Vec::new() })
                } else {
                    None
                }
            }
            RoutePattern::Regex(re) => re.captures(path).map(|caps| {
                let captures = (1..caps.len())
                    .map(|i| caps.get(i).map(|m| m.as_str().to_string()).unwrap_or_default())
                    .collect();
                RouteMatch { route: self, captures }
            }),
        }
    }
}

pub struct RouteMatch<'a> {
    pub route: &'a ProxyRoute,
    pub captures: Vec<String>,
}

/// Resolve the outbound target URL for a route match against an inbound
/// path (spec 4.2 path policy). Regex-capture substitution into the
/// target wins over `strip_path` per the design notes (section 9): the two
/// are never meant to be combined on one route.
pub fn resolve_target_url(route_match: &RouteMatch<'_>, inbound_path: &str) -> String {
    let route = route_match.route;

    if route.target.contains('$') && !route_match.captures.is_empty() {
        let mut resolved = route.target.clone();
        for (i, capture) in route_match.captures.iter().enumerate() {
            resolved = resolved.replace(&format!("${}", i + 1), capture);
        }
        return resolved;
    }

    let stripped_path = if route.strip_path {
        match &route.pattern {
            RoutePattern::Prefix(prefix) => inbound_path.strip_prefix(prefix.as_str()).unwrap_or(inbound_path),
            RoutePattern::Regex(_) => {
                if let Some(first) = route_match.captures.first() {
                    return join_url(&route.target, &format!("/{first}"));
                }
                inbound_path
            }
        }
    } else {
        inbound_path
    };

    join_url(&route.target, stripped_path)
}

fn join_url(target: &str, path: &str) -> String {
    let target = target.trim_end_matches('/');
    if path.is_empty() || path == "/" {
        return target.to_string();
    }
    format!("{}/{}", target, path.trim_start_matches('/'))
}

/// Strip hop-by-hop headers and inject per-route headers (spec 4.2).
pub fn apply_header_policy(
    headers: &mut HeaderMap,
    route_headers: &HashMap<String, String>,
    remote_addr: &str,
    scheme: &str,
    host: &str,
) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }

    if !headers.contains_key("x-forwarded-host") {
        if let Ok(value) = HeaderValue::from_str(host) {
            headers.insert(HeaderName::from_static("x-forwarded-host"), value);
        }
    }

    for (name, template) in route_headers {
        let expanded = util::expand_header_template(template, remote_addr, scheme, host);
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&expanded),
        ) {
            headers.insert(name, value);
        } else {
            warn!(header = %name, "skipping malformed header injection");
        }
    }
}

/// Safe, idempotent methods a failed connection attempt may be retried for.
fn is_retryable_method(method: &Method) -> bool {
    matches!(method, &Method::GET | &Method::HEAD | &Method::OPTIONS | &Method::DELETE)
}

/// Forward with no retry: used for tenant traffic, whose backend is
/// already known ready via the readiness probe (spec 4.3, design notes).
pub async fn forward_no_retry(
    mut req: Request<ResponseBody>,
    target_url: &str,
) -> Result<Response<ResponseBody>, NavigatorError> {
    let uri: Uri = target_url
        .parse()
        .map_err(|e| NavigatorError::InvalidTarget(format!("{target_url}: {e}")))?;
    *req.uri_mut() = uri;

    match CLIENT.request(req).await {
        Ok(resp) => Ok(resp.map(|b| b.map_err(|e| Box::new(e) as body::BoxError).boxed())),
        Err(e) => {
            debug!(error = %e, target = %target_url, "proxy dial failed");
            Err(NavigatorError::UpstreamUnavailable(e.to_string()))
        }
    }
}

/// Forward with a single retry on connection-establishment failure, bounded
/// by `timeout` (spec 4.2: "single retry loop over a bounded duration",
/// used by the Fly-Replay fallback path).
pub async fn forward_with_retry(
    req_builder: impl Fn() -> Request<ResponseBody>,
    target_url: &str,
    timeout: Duration,
) -> Result<Response<ResponseBody>, NavigatorError> {
    let method = req_builder().method().clone();
    let attempt = tokio::time::timeout(timeout, forward_no_retry(req_builder(), target_url)).await;

    match attempt {
        Ok(Ok(resp)) => Ok(resp),
        Ok(Err(_)) if is_retryable_method(&method) => {
            debug!(target = %target_url, "retrying idempotent request after connect failure");
            tokio::time::timeout(timeout, forward_no_retry(req_builder(), target_url))
                .await
                .map_err(|_| NavigatorError::UpstreamUnavailable("retry timed out".to_string()))?
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(NavigatorError::UpstreamUnavailable("request timed out".to_string())),
    }
}

pub fn error_response(err: &NavigatorError) -> Response<ResponseBody> {
    Response::builder()
        .status(err.status_code())
        .header("content-type", "text/plain; charset=utf-8")
        .body(body::text(err.body_text()))
        .unwrap_or_else(|_| {
            let mut resp = Response::new(body::empty());
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix_route(target: &str, strip: bool) -> ProxyRoute {
        ProxyRoute {
            pattern: RoutePattern::Prefix("/api/".to_string()),
            target: target.to_string(),
            strip_path: strip,
            websocket: false,
            headers: HashMap::new(),
        }
    }

    #[test]
    fn prefix_route_without_strip_joins_paths() {
        let route = prefix_route("http://backend:8080", false);
        let m = route.matches("/api/widgets").unwrap();
        assert_eq!(resolve_target_url(&m, "/api/widgets"), "http://backend:8080/api/widgets");
    }

    #[test]
    fn prefix_route_with_strip_removes_prefix() {
        let route = prefix_route("http://backend:8080", true);
        let m = route.matches("/api/widgets").unwrap();
        assert_eq!(resolve_target_url(&m, "/api/widgets"), "http://backend:8080/widgets");
    }

    #[test]
    fn regex_route_substitutes_capture_into_target() {
        let route = ProxyRoute {
            pattern: RoutePattern::Regex(Regex::new(r"^/svc/(\w+)/(\w+)$").unwrap()),
            target: "http://$1.internal/$2".to_string(),
            strip_path: false,
            websocket: false,
            headers: HashMap::new(),
        };
        let m = route.matches("/svc/orders/list").unwrap();
        assert_eq!(resolve_target_url(&m, "/svc/orders/list"), "http://orders.internal/list");
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("x-custom", HeaderValue::from_static("keep-me"));
        apply_header_policy(&mut headers, &HashMap::new(), "1.2.3.4", "https", "example.com");
        assert!(!headers.contains_key("connection"));
        assert!(headers.contains_key("x-custom"));
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "example.com");
    }

    #[test]
    fn header_template_is_expanded_on_injection() {
        let mut headers = HeaderMap::new();
        let mut route_headers = HashMap::new();
        route_headers.insert("x-client".to_string(), "$remote_addr/$scheme".to_string());
        apply_header_policy(&mut headers, &route_headers, "9.9.9.9", "https", "example.com");
        assert_eq!(headers.get("x-client").unwrap(), "9.9.9.9/https");
    }

    #[test]
    fn only_idempotent_methods_are_retryable() {
        assert!(is_retryable_method(&Method::GET));
        assert!(is_retryable_method(&Method::DELETE));
        assert!(!is_retryable_method(&Method::POST));
        assert!(!is_retryable_method(&Method::PATCH));
    }
}
