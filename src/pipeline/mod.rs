//! RequestPipeline (spec section 4.1): the ordered, fixed predicate chain
//! that turns one inbound request into exactly one terminal action and one
//! access-log record.

pub mod auth;
pub mod bot;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::access_log::{self, AccessLogFields, AccessLogSink, ResponseMetadata};
use crate::body::{self, ResponseBody};
use crate::config::Config;
use crate::error::NavigatorError;
use crate::fly_replay::{self, CompiledRewriteRule, RewriteOutcome};
use crate::idle::IdleTracker;
use crate::proxy::{self, ProxyRoute, RoutePattern};
use crate::static_files;
use crate::sticky::{self, StickyOutcome};
use crate::tenant::{TenantAppManager, TenantDescriptor};
use crate::util::{self, PlatformIdentity};
use crate::websocket;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Config plus everything compiled from it (routes, rewrite rules, tenant
/// descriptors). Swapped atomically on reload; in-flight requests keep
/// whatever snapshot they loaded at the start (spec section 5, design
/// notes open question on the reload barrier).
pub struct RuntimeSnapshot {
    pub config: Config,
    pub proxy_routes: Vec<ProxyRoute>,
    pub rewrites: Vec<CompiledRewriteRule>,
    pub tenant_descriptors: Vec<TenantDescriptor>,
}

impl RuntimeSnapshot {
    pub fn build(config: Config) -> anyhow::Result<Self> {
        let proxy_routes = config
            .proxy_routes
            .iter()
            .map(|r| -> anyhow::Result<ProxyRoute> {
                let pattern = if r.is_regex {
                    RoutePattern::Regex(regex::Regex::new(&r.pattern)?)
                } else {
                    RoutePattern::Prefix(r.pattern.clone())
                };
                Ok(ProxyRoute {
                    pattern,
                    target: r.target.clone(),
                    strip_path: r.strip_path,
                    websocket: r.websocket,
                    headers: r.headers.clone(),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let rewrites = config
            .rewrites
            .iter()
            .map(|r| CompiledRewriteRule::compile(r).map_err(anyhow::Error::from))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let tenant_descriptors = TenantDescriptor::from_config(&config);

        Ok(Self { config, proxy_routes, rewrites, tenant_descriptors })
    }
}

pub struct PipelineState {
    pub snapshot: ArcSwap<RuntimeSnapshot>,
    pub tenants: Arc<TenantAppManager>,
    pub idle: Arc<IdleTracker>,
    pub identity: PlatformIdentity,
    pub credential_store: Arc<dyn auth::CredentialStore>,
    pub access_log: Arc<dyn AccessLogSink>,
    pub local_port: u16,
}

/// The single entry point: one request in, one response out, one access
/// log record emitted as a side effect (spec 4.1 public contract).
pub async fn dispatch(state: &PipelineState, req: Request<Incoming>, peer: SocketAddr) -> Response<ResponseBody> {
    let start = Instant::now();
    let snapshot = state.snapshot.load_full();
    let idle_guard = state.idle.track();

    let (mut parts, incoming) = req.into_parts();
    let request_id = ensure_request_id(&mut parts.headers);

    let mut fields = AccessLogFields {
        client_ip: util::client_ip(&parts.headers, peer),
        remote_user: None,
        method: parts.method.to_string(),
        uri: util::uri_path_and_query(&parts.uri),
        protocol: format!("{:?}", parts.version),
        request_id: request_id.clone(),
        referer: header_str(&parts.headers, hyper::header::REFERER),
        user_agent: header_str(&parts.headers, hyper::header::USER_AGENT),
        fly_request_id: header_str(&parts.headers, "fly-request-id"),
        extra: Default::default(),
    };
    let x_remote_user = header_str(&parts.headers, "x-remote-user");

    let body = incoming.map_err(|e| Box::new(e) as body::BoxError).boxed();
    let req = Request::from_parts(parts, body);

    let (mut response, metadata, idle_guard, remote_user) =
        run_pipeline(state, &snapshot, req, &request_id, peer, idle_guard).await;

    if let Some(guard) = idle_guard {
        guard.release();
    }

    fields.remote_user = remote_user.or(x_remote_user);

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .entry(HeaderName::from_static(REQUEST_ID_HEADER))
            .or_insert(value);
    }

    let status = response.status().as_u16();
    let body_bytes = response
        .headers()
        .get(hyper::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    match status {
        500..=599 => error!(request_id = %request_id, status, "request terminated with server error"),
        400..=499 => warn!(request_id = %request_id, status, "request terminated with client error"),
        _ => info!(request_id = %request_id, status, "request complete"),
    }

    let elapsed = start.elapsed();
    crate::metrics::record_request(metadata.response_type, status, elapsed.as_secs_f64());
    access_log::record(state.access_log.as_ref(), fields, status, body_bytes, elapsed, metadata);
    response
}

/// Response, metadata, idle guard (so a websocket hijack path can release
/// it early per spec 4.5's idle-tracker interaction), and the
/// authenticated remote user, if any, for the access-log field (spec 6).
type PipelineResult = (Response<ResponseBody>, ResponseMetadata, Option<crate::idle::IdleGuard>, Option<String>);

async fn run_pipeline(
    state: &PipelineState,
    snapshot: &Arc<RuntimeSnapshot>,
    req: Request<ResponseBody>,
    request_id: &str,
    peer: SocketAddr,
    idle_guard: crate::idle::IdleGuard,
) -> PipelineResult {
    let config = &snapshot.config;
    let path = req.uri().path().to_string();

    // Step 3: health probe.
    if path == "/up" {
        let resp = Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/html")
            .body(body::text("OK"))
            .expect("static health response is well-formed");
        return (resp, ResponseMetadata::new("static"), Some(idle_guard), None);
    }

    // Step 4: sticky session.
    match sticky::decide(&config.sticky_sessions, &state.identity, &path, req.headers()) {
        StickyOutcome::Terminal(resp, kind) => (resp, ResponseMetadata::new(kind), Some(idle_guard), None),
        StickyOutcome::Pass { set_cookie } => {
            finish_after_sticky(state, snapshot, req, request_id, peer, idle_guard, set_cookie).await
        }
        StickyOutcome::Inert => finish_after_sticky(state, snapshot, req, request_id, peer, idle_guard, None).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn finish_after_sticky(
    state: &PipelineState,
    snapshot: &Arc<RuntimeSnapshot>,
    mut req: Request<ResponseBody>,
    request_id: &str,
    peer: SocketAddr,
    idle_guard: crate::idle::IdleGuard,
    sticky_cookie: Option<String>,
) -> PipelineResult {
    let config = &snapshot.config;
    let path = req.uri().path().to_string();
    let content_length = req
        .headers()
        .get(hyper::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let method = req.method().clone();

    // Step 5: rewrite / fly-replay.
    let rewrite_outcome = fly_replay::evaluate(
        &snapshot.rewrites,
        &method,
        path.clone(),
        req.headers(),
        content_length,
        state.identity.app_name.as_deref().unwrap_or(""),
    );

    let path = match rewrite_outcome {
        RewriteOutcome::Terminal(mut resp, kind) => {
            attach_cookie(&mut resp, sticky_cookie);
            let meta = ResponseMetadata::new(kind);
            return (resp, meta, Some(idle_guard), None);
        }
        RewriteOutcome::ProxyFallback { target, path } => {
            let path_and_query = util::uri_path_and_query(req.uri());
            let target_url = fly_replay::synthesize_internal_target(
                &target,
                state.identity.app_name.as_deref().unwrap_or(""),
                state.local_port,
                &path_and_query,
            );
            let empty_headers = std::collections::HashMap::new();
            apply_egress_headers(&mut req, &empty_headers, peer);
            let builder = || clone_request(&req);
            let result = proxy::forward_with_retry(builder, &target_url, std::time::Duration::from_secs(3)).await;
            let mut resp = respond_for_proxy_result(result);
            attach_cookie(&mut resp, sticky_cookie);
            let mut meta = ResponseMetadata::new("proxy");
            meta.destination = Some(target_url);
            return (resp, meta, Some(idle_guard), None);
        }
        RewriteOutcome::Pass { path } => path,
    };

    // Step 6: reverse-proxy routes.
    if let Some(route_match) = snapshot.proxy_routes.iter().find_map(|r| r.matches(&path)) {
        let target_url = proxy::resolve_target_url(&route_match, &path);
        let route = route_match.route;

        if route.websocket && websocket::is_upgrade_request(req.headers()) {
            let (resp, meta) = handle_websocket(req, &target_url, route, peer).await;
            let mut resp = resp;
            attach_cookie(&mut resp, sticky_cookie);
            idle_guard.release();
            return (resp, meta, None, None);
        }

        apply_egress_headers(&mut req, &route.headers, peer);
        let result = proxy::forward_no_retry(req, &target_url).await;
        let mut resp = respond_for_proxy_result(result);
        attach_cookie(&mut resp, sticky_cookie);
        let mut meta = ResponseMetadata::new("proxy");
        meta.destination = Some(target_url);
        return (resp, meta, Some(idle_guard), None);
    }

    // Step 7: authentication.
    let auth_outcome = auth::check(&config.auth, &path, req.headers(), state.credential_store.as_ref());
    let remote_user = match auth_outcome {
        auth::AuthOutcome::Challenge(mut resp) => {
            attach_cookie(&mut resp, sticky_cookie);
            return (resp, ResponseMetadata::new("auth-failure"), Some(idle_guard), None);
        }
        auth::AuthOutcome::Pass { remote_user } => remote_user,
    };

    // Bot detection, global policy (spec 4.1: "sub-predicate of 7-10").
    let ua = bot::user_agent(req.headers());
    let global_bot = bot::classify(
        config.bot_detection.enabled,
        config.bot_detection.policy,
        &config.bot_detection.user_agents,
        ua,
    );
    if global_bot == bot::BotDecision::Reject {
        let mut resp = forbidden_response();
        attach_cookie(&mut resp, sticky_cookie);
        return (resp, ResponseMetadata::new("error"), Some(idle_guard), remote_user);
    }

    let stripped_path = static_files::strip_root(&config.r#static.root_path, &path);

    // Step 8: static file serve.
    if let Some(mut resp) = static_files::serve_static(&config.r#static, stripped_path).await {
        attach_cookie(&mut resp, sticky_cookie);
        let mut meta = ResponseMetadata::new("static");
        meta.file_path = Some(stripped_path.to_string());
        return (resp, meta, Some(idle_guard), remote_user);
    }

    // Step 9: try-files.
    if let Some(mut resp) = static_files::try_files(&config.r#static, stripped_path).await {
        attach_cookie(&mut resp, sticky_cookie);
        let mut meta = ResponseMetadata::new("static");
        meta.file_path = Some(stripped_path.to_string());
        return (resp, meta, Some(idle_guard), remote_user);
    }

    // Step 10: tenant proxy.
    if let Some(tenant) = TenantDescriptor::longest_prefix_match(&snapshot.tenant_descriptors, &path) {
        let tenant_bot_policy = tenant_bot_override(tenant, config);
        let tenant_decision = match tenant_bot_policy {
            Some(policy) => bot::classify(true, policy, &config.bot_detection.user_agents, ua),
            None => global_bot,
        };
        if matches!(tenant_decision, bot::BotDecision::Reject | bot::BotDecision::StaticOnly) {
            let mut resp = forbidden_response();
            attach_cookie(&mut resp, sticky_cookie);
            return (resp, ResponseMetadata::new("error"), Some(idle_guard), remote_user);
        }

        match state.tenants.acquire(&tenant.name).await {
            Ok(handle) => {
                let target_url = handle.target_url();
                if websocket::is_upgrade_request(req.headers()) {
                    let route = ProxyRoute {
                        pattern: RoutePattern::Prefix(tenant.path_prefix.clone()),
                        target: target_url.clone(),
                        strip_path: false,
                        websocket: true,
                        headers: Default::default(),
                    };
                    let (resp, mut meta) = handle_websocket(req, &target_url, &route, peer).await;
                    let mut resp = resp;
                    attach_cookie(&mut resp, sticky_cookie);
                    meta.tenant = Some(tenant.name.clone());
                    idle_guard.release();
                    handle.release();
                    return (resp, meta, None, remote_user);
                }

                let empty_headers = std::collections::HashMap::new();
                apply_egress_headers(&mut req, &empty_headers, peer);
                let result = proxy::forward_no_retry(req, &target_url).await;
                handle.release();
                let mut resp = respond_for_proxy_result(result);
                attach_cookie(&mut resp, sticky_cookie);
                let mut meta = ResponseMetadata::new("proxy");
                meta.tenant = Some(tenant.name.clone());
                meta.destination = Some(target_url);
                return (resp, meta, Some(idle_guard), remote_user);
            }
            Err(e) => {
                let mut resp = proxy::error_response(&e);
                attach_cookie(&mut resp, sticky_cookie);
                let mut meta = ResponseMetadata::new(e.response_type());
                meta.tenant = Some(tenant.name.clone());
                meta.error_message = Some(e.to_string());
                return (resp, meta, Some(idle_guard), remote_user);
            }
        }
    }

    // Fallback: configured static fallback file, else 404.
    if let Some(fallback) = &config.r#static.fallback_file {
        if let Ok(bytes) = tokio::fs::read(fallback).await {
            let mut resp = Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/html; charset=utf-8")
                .body(body::full(bytes))
                .expect("fallback response is well-formed");
            attach_cookie(&mut resp, sticky_cookie);
            return (resp, ResponseMetadata::new("static"), Some(idle_guard), remote_user);
        }
    }

    let mut resp = not_found_response();
    attach_cookie(&mut resp, sticky_cookie);
    (resp, ResponseMetadata::new("error"), Some(idle_guard), remote_user)
}

fn tenant_bot_override(tenant: &TenantDescriptor, _config: &Config) -> Option<crate::config::BotPolicy> {
    tenant.bot_detection
}

async fn handle_websocket(
    mut req: Request<ResponseBody>,
    target_url: &str,
    route: &ProxyRoute,
    peer: SocketAddr,
) -> (Response<ResponseBody>, ResponseMetadata) {
    let remote_addr = peer.ip().to_string();
    let scheme = util::request_scheme(req.headers());
    let host = util::request_host(req.headers());
    let ws_url = websocket::to_ws_url(target_url);
    let handshake_headers =
        websocket::build_handshake_headers(req.headers(), &route.headers, &remote_addr, &scheme, &host);

    match websocket::dial_backend(&ws_url, handshake_headers).await {
        Ok(dial) => {
            let client_key = header_str(req.headers(), "sec-websocket-key");
            let mut response_builder = Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .header(hyper::header::CONNECTION, "upgrade")
                .header(hyper::header::UPGRADE, "websocket");
            if let Some(key) = &client_key {
                response_builder = response_builder.header("sec-websocket-accept", websocket::derive_accept_key(key));
            }
            if let Some(proto) = &dial.subprotocol {
                response_builder = response_builder.header("sec-websocket-protocol", proto);
            }
            let on_upgrade = hyper::upgrade::on(&mut req);
            tokio::spawn(async move {
                match on_upgrade.await {
                    Ok(upgraded) => {
                        let io = hyper_util::rt::TokioIo::new(upgraded);
                        let client_ws = tokio_tungstenite::WebSocketStream::from_raw_socket(
                            io,
                            tokio_tungstenite::tungstenite::protocol::Role::Server,
                            None,
                        )
                        .await;
                        websocket::bridge(client_ws, dial.stream).await;
                    }
                    Err(e) => warn!(error = %e, "websocket upgrade failed after 101 response"),
                }
            });
            let resp = response_builder
                .body(body::empty())
                .expect("switching-protocols response is well-formed");
            (resp, ResponseMetadata::new("proxy"))
        }
        Err(e) => {
            let resp = proxy::error_response(&e);
            let mut meta = ResponseMetadata::new("error");
            meta.error_message = Some(e.to_string());
            (resp, meta)
        }
    }
}

fn apply_egress_headers(
    req: &mut Request<ResponseBody>,
    route_headers: &std::collections::HashMap<String, String>,
    peer: SocketAddr,
) {
    let remote_addr = peer.ip().to_string();
    let scheme = util::request_scheme(req.headers());
    let host = util::request_host(req.headers());
    proxy::apply_header_policy(req.headers_mut(), route_headers, &remote_addr, &scheme, &host);
}

/// The hyper legacy client consumes the request body; a retry needs a
/// fresh `Request` built from the same parts with an empty body (the
/// bodies eligible for retry are, per spec 4.2, the bodyless methods).
fn clone_request(req: &Request<ResponseBody>) -> Request<ResponseBody> {
    let mut builder = Request::builder().method(req.method().clone()).uri(req.uri().clone()).version(req.version());
    for (name, value) in req.headers() {
        builder = builder.header(name, value);
    }
    builder.body(body::empty()).expect("cloned proxy request is well-formed")
}

fn respond_for_proxy_result(result: Result<Response<ResponseBody>, NavigatorError>) -> Response<ResponseBody> {
    match result {
        Ok(resp) => resp,
        Err(e) => proxy::error_response(&e),
    }
}

fn attach_cookie(resp: &mut Response<ResponseBody>, cookie: Option<String>) {
    if let Some(cookie) = cookie {
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            resp.headers_mut().append(hyper::header::SET_COOKIE, value);
        }
    }
}

fn forbidden_response() -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::FORBIDDEN)
        .body(body::text("Forbidden"))
        .expect("static forbidden response is well-formed")
}

fn not_found_response() -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(body::text("Not Found"))
        .expect("static not-found response is well-formed")
}

fn header_str(headers: &HeaderMap, name: impl hyper::header::AsHeaderName) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(|s| s.to_string())
}

/// Assigns a fresh opaque id if the inbound request carried none (spec 4.1
/// step 1), and writes it back onto the request so downstream proxying
/// forwards it.
fn ensure_request_id(headers: &mut HeaderMap) -> String {
    if let Some(existing) = headers.get(REQUEST_ID_HEADER).and_then(|v| v.to_str().ok()) {
        if !existing.is_empty() {
            return existing.to_string();
        }
    }
    let id = Uuid::new_v4().to_string();
    if let Ok(value) = HeaderValue::from_str(&id) {
        headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_request_id_preserves_inbound_id() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("abc-123"));
        assert_eq!(ensure_request_id(&mut headers), "abc-123");
    }

    #[test]
    fn ensure_request_id_generates_when_absent() {
        let mut headers = HeaderMap::new();
        let id = ensure_request_id(&mut headers);
        assert!(!id.is_empty());
        assert_eq!(headers.get(REQUEST_ID_HEADER).unwrap().to_str().unwrap(), id);
    }
}
