//! Rewrite / Fly-Replay engine (spec section 4.4): evaluates rewrite rules
//! in order, decides whether a request qualifies for an edge replay, emits
//! the replay JSON, enforces the loop-break token, and otherwise
//! synthesizes an internal-DNS target for the reverse-proxy fallback.

use hyper::{HeaderMap, Method, Response, StatusCode};
use regex::Regex;
use serde_json::json;
use tracing::debug;

use crate::body::{self, ResponseBody};
use crate::config::{RewriteAction, RewriteRuleConfig};

/// The header that marks "this request already went through one replay"
/// (spec 4.4 loop break, glossary "Loop-break token").
pub const RETRY_HEADER: &str = "x-navigator-retry";

#[derive(Debug, Clone)]
pub enum FlyTarget {
    Machine { id: String, app: String },
    App(String),
    Region(String),
}

impl FlyTarget {
    /// Parses `"app=NAME"`, `"machine=ID:APP"`, or a bare region name
    /// (spec 3, "Rewrite rule": "a target specifier").
    pub fn parse(spec: &str) -> Self {
        if let Some(rest) = spec.strip_prefix("machine=") {
            if let Some((id, app)) = rest.split_once(':') {
                return FlyTarget::Machine { id: id.to_string(), app: app.to_string() };
            }
        }
        if let Some(app) = spec.strip_prefix("app=") {
            return FlyTarget::App(app.to_string());
        }
        FlyTarget::Region(spec.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct CompiledRewriteRule {
    pub pattern: Regex,
    pub replacement: String,
    pub action: RewriteAction,
    pub methods: Option<Vec<Method>>,
    pub fly_replay_target: Option<FlyTarget>,
    pub fly_replay_status: u16,
    pub redirect_status: u16,
}

impl CompiledRewriteRule {
    pub fn compile(config: &RewriteRuleConfig) -> Result<Self, regex::Error> {
        let methods = config.methods.as_ref().map(|list| {
            list.iter()
                .filter_map(|m| m.parse::<Method>().ok())
                .collect()
        });
        Ok(Self {
            pattern: Regex::new(&config.pattern)?,
            replacement: config.replacement.clone(),
            action: config.action,
            methods,
            fly_replay_target: config.fly_replay_target.as_deref().map(FlyTarget::parse),
            fly_replay_status: config.fly_replay_status,
            redirect_status: config.redirect_status,
        })
    }

    fn method_allowed(&self, method: &Method) -> bool {
        match &self.methods {
            Some(list) => list.iter().any(|m| m == method),
            None => true,
        }
    }
}

pub enum RewriteOutcome {
    /// No rule produced a terminal response; `path` carries any `last`-rule
    /// mutations applied along the way.
    Pass { path: String },
    /// Terminal response plus its access-log `response_type` tag.
    Terminal(Response<ResponseBody>, &'static str),
    /// A `fly-replay` rule matched but the request doesn't qualify for
    /// edge replay; the pipeline must synthesize an internal target and
    /// proxy with the single-retry entry point (spec 4.4 fallback).
    ProxyFallback { target: FlyTarget, path: String },
}

/// Evaluate the ordered rule list against one request (spec 4.4, 4.1 step 5).
pub fn evaluate(
    rules: &[CompiledRewriteRule],
    method: &Method,
    mut path: String,
    headers: &HeaderMap,
    content_length: Option<u64>,
    local_app: &str,
) -> RewriteOutcome {
    for rule in rules {
        if !rule.method_allowed(method) {
            continue;
        }
        let Some(captures) = rule.pattern.captures(&path) else {
            continue;
        };

        match rule.action {
            RewriteAction::Last => {
                let mut expanded = String::new();
                captures.expand(&rule.replacement, &mut expanded);
                path = expanded;
                continue;
            }
            RewriteAction::Redirect => {
                let mut expanded = String::new();
                captures.expand(&rule.replacement, &mut expanded);
                return RewriteOutcome::Terminal(redirect_response(rule.redirect_status, &expanded), "redirect");
            }
            RewriteAction::FlyReplay => {
                if headers.get(RETRY_HEADER).and_then(|v| v.to_str().ok()) == Some("true") {
                    return RewriteOutcome::Terminal(maintenance_response(), "maintenance");
                }
                if qualifies_for_replay(content_length, method) {
                    let target = rule
                        .fly_replay_target
                        .as_ref()
                        .expect("config validation guarantees fly_replay rules carry a target");
                    return RewriteOutcome::Terminal(emit_replay(target, rule.fly_replay_status, local_app), "fly-replay");
                }
                // Doesn't qualify: hand the pipeline the target so it can
                // synthesize an internal URL and proxy with single-retry
                // (spec 4.4 "Fallback to reverse proxy").
                let target = rule
                    .fly_replay_target
                    .clone()
                    .expect("config validation guarantees fly_replay rules carry a target");
                return RewriteOutcome::ProxyFallback { target, path };
            }
        }
    }
    RewriteOutcome::Pass { path }
}

/// Spec 4.4 size gate.
pub fn qualifies_for_replay(content_length: Option<u64>, method: &Method) -> bool {
    let no_body_method = matches!(method, &Method::GET | &Method::HEAD | &Method::OPTIONS | &Method::DELETE);
    match content_length {
        Some(len) => len < 1_048_576,
        None => no_body_method,
    }
}

fn redirect_response(status: u16, location: &str) -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::FOUND))
        .header("location", location)
        .body(body::empty())
        .expect("static redirect response is well-formed")
}

/// Spec 4.4 replay emission: three JSON shapes keyed by target kind.
pub fn emit_replay(target: &FlyTarget, status: u16, local_app: &str) -> Response<ResponseBody> {
    let retry_transform = json!({"set_headers": [{"name": "X-Navigator-Retry", "value": "true"}]});

    let payload = match target {
        FlyTarget::Machine { id, app } => {
            if app == local_app {
                json!({"app": app, "prefer_instance": id, "transform": retry_transform})
            } else {
                json!({"app": app, "prefer_instance": id})
            }
        }
        FlyTarget::App(app) => {
            if app == local_app {
                json!({"app": app, "transform": retry_transform})
            } else {
                json!({"app": app})
            }
        }
        FlyTarget::Region(region) => {
            json!({"region": format!("{region},any"), "transform": retry_transform})
        }
    };

    debug!(?target, status, "emitting fly-replay");
    let target_kind = match target {
        FlyTarget::Machine { .. } => "machine",
        FlyTarget::App(_) => "app",
        FlyTarget::Region(_) => "region",
    };
    crate::metrics::record_fly_replay(target_kind);
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::TEMPORARY_REDIRECT))
        .header("content-type", "application/vnd.fly.replay+json")
        .body(body::text(payload.to_string()))
        .expect("static replay response is well-formed")
}

/// Spec 7: maintenance surface for loop-break and sticky-miss cases.
pub fn maintenance_response() -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .header("cache-control", "no-cache, no-store, must-revalidate")
        .header("content-type", "text/html; charset=utf-8")
        .body(body::text("<html><body>Service temporarily unavailable</body></html>"))
        .expect("static maintenance response is well-formed")
}

/// Spec 4.4 fallback: synthesize an internal DNS target for the three
/// target kinds.
pub fn synthesize_internal_target(target: &FlyTarget, local_app: &str, port: u16, path_and_query: &str) -> String {
    match target {
        FlyTarget::Machine { id, app } => format!("http://{id}.vm.{app}.internal:{port}{path_and_query}"),
        FlyTarget::App(app) => format!("http://{app}.internal:{port}{path_and_query}"),
        FlyTarget::Region(region) => format!("http://{region}.{local_app}.internal:{port}{path_and_query}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, action: RewriteAction, target: Option<&str>) -> CompiledRewriteRule {
        CompiledRewriteRule {
            pattern: Regex::new(pattern).unwrap(),
            replacement: String::new(),
            action,
            methods: None,
            fly_replay_target: target.map(FlyTarget::parse),
            fly_replay_status: 307,
            redirect_status: 302,
        }
    }

    #[test]
    fn size_gate_allows_small_known_length() {
        assert!(qualifies_for_replay(Some(100), &Method::POST));
    }

    #[test]
    fn size_gate_rejects_large_known_length() {
        assert!(!qualifies_for_replay(Some(2_000_000), &Method::GET));
    }

    #[test]
    fn size_gate_allows_unknown_length_for_bodyless_methods() {
        assert!(qualifies_for_replay(None, &Method::GET));
        assert!(qualifies_for_replay(None, &Method::DELETE));
    }

    #[test]
    fn size_gate_rejects_unknown_length_for_post() {
        assert!(!qualifies_for_replay(None, &Method::POST));
    }

    #[test]
    fn fly_replay_matches_and_emits_region_payload() {
        let rules = vec![rule("^/api/", RewriteAction::FlyReplay, Some("us-west"))];
        let headers = HeaderMap::new();
        let outcome = evaluate(&rules, &Method::GET, "/api/x".to_string(), &headers, None, "localapp");
        match outcome {
            RewriteOutcome::Terminal(resp, kind) => {
                assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
                assert_eq!(
                    resp.headers().get("content-type").unwrap(),
                    "application/vnd.fly.replay+json"
                );
                assert_eq!(kind, "fly-replay");
            }
            _ => panic!("expected terminal replay"),
        }
    }

    #[test]
    fn loop_break_returns_maintenance_instead_of_second_replay() {
        let rules = vec![rule("^/api/", RewriteAction::FlyReplay, Some("us-west"))];
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_HEADER, "true".parse().unwrap());
        let outcome = evaluate(&rules, &Method::GET, "/api/x".to_string(), &headers, None, "localapp");
        match outcome {
            RewriteOutcome::Terminal(resp, kind) => {
                assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(kind, "maintenance");
            }
            _ => panic!("expected maintenance response"),
        }
    }

    #[test]
    fn large_body_falls_through_to_proxy_fallback() {
        let rules = vec![rule("^/api/", RewriteAction::FlyReplay, Some("us-west"))];
        let headers = HeaderMap::new();
        let outcome = evaluate(&rules, &Method::POST, "/api/x".to_string(), &headers, Some(2_000_000), "localapp");
        assert!(matches!(outcome, RewriteOutcome::ProxyFallback { .. }));
    }

    #[test]
    fn last_rule_mutates_path_and_continues() {
        let mut last_rule = rule("^/old/(.*)$", RewriteAction::Last, None);
        last_rule.replacement = "/new/$1".to_string();
        let rules = vec![last_rule];
        let headers = HeaderMap::new();
        let outcome = evaluate(&rules, &Method::GET, "/old/thing".to_string(), &headers, None, "localapp");
        match outcome {
            RewriteOutcome::Pass { path } => assert_eq!(path, "/new/thing"),
            _ => panic!("last action must not be terminal"),
        }
    }

    #[test]
    fn method_not_in_allow_list_is_skipped() {
        let mut r = rule("^/api/", RewriteAction::FlyReplay, Some("us-west"));
        r.methods = Some(vec![Method::GET, Method::HEAD]);
        let rules = vec![r];
        let headers = HeaderMap::new();
        let outcome = evaluate(&rules, &Method::POST, "/api/x".to_string(), &headers, Some(10), "localapp");
        assert!(matches!(outcome, RewriteOutcome::Pass { .. }));
    }

    #[test]
    fn internal_target_forms_match_spec() {
        let machine = FlyTarget::Machine { id: "abc".into(), app: "myapp".into() };
        assert_eq!(
            synthesize_internal_target(&machine, "local", 3000, "/x"),
            "http://abc.vm.myapp.internal:3000/x"
        );
        let app = FlyTarget::App("myapp".into());
        assert_eq!(synthesize_internal_target(&app, "local", 3000, "/x"), "http://myapp.internal:3000/x");
        let region = FlyTarget::Region("us-west".into());
        assert_eq!(
            synthesize_internal_target(&region, "local", 3000, "/x"),
            "http://us-west.local.internal:3000/x"
        );
    }
}
