//! Sticky-session engine (spec section 4.6): machine-identity cookie
//! read/set and the stay-here / replay-to-owner / maintenance decision.

use hyper::{HeaderMap, Response};
use tracing::debug;

use crate::body::ResponseBody;
use crate::config::{SameSitePolicy, StickyConfig};
use crate::fly_replay::{self, FlyTarget};
use crate::util::{self, PlatformIdentity};

pub enum StickyOutcome {
    /// Engine is disabled, out of scope for this path, or environment is
    /// incomplete: pass through untouched.
    Inert,
    /// Pass to the next predicate; `set_cookie` carries a `Set-Cookie`
    /// header value to attach to whatever response is eventually written.
    Pass { set_cookie: Option<String> },
    /// Terminal response plus its access-log `response_type` tag.
    Terminal(Response<ResponseBody>, &'static str),
}

/// Spec 4.6 gate + decision table.
pub fn decide(
    config: &StickyConfig,
    identity: &PlatformIdentity,
    path: &str,
    headers: &HeaderMap,
) -> StickyOutcome {
    if !config.enabled || !util::matches_any_glob(path, &config.paths) {
        return StickyOutcome::Inert;
    }
    let (Some(machine_id), Some(app_name)) = (&identity.machine_id, &identity.app_name) else {
        return StickyOutcome::Inert;
    };

    let cookie_value = read_cookie(headers, &config.cookie_name);
    let has_retry_token = headers
        .get(fly_replay::RETRY_HEADER)
        .and_then(|v| v.to_str().ok())
        == Some("true");

    match cookie_value {
        None => {
            debug!(%machine_id, "sticky cookie absent, claiming request");
            StickyOutcome::Pass { set_cookie: Some(build_set_cookie(config, machine_id)) }
        }
        Some(ref value) if value == machine_id => {
            StickyOutcome::Pass { set_cookie: Some(build_set_cookie(config, machine_id)) }
        }
        Some(owner) if !has_retry_token => {
            debug!(%owner, local = %machine_id, "sticky cookie belongs to another machine, replaying");
            let target = FlyTarget::Machine { id: owner, app: app_name.clone() };
            StickyOutcome::Terminal(fly_replay::emit_replay(&target, 307, app_name), "fly-replay")
        }
        Some(_) => {
            debug!("sticky replay target unreachable, serving maintenance and resetting cookie");
            let mut resp = fly_replay::maintenance_response();
            if let Ok(value) = hyper::header::HeaderValue::from_str(&build_set_cookie(config, machine_id)) {
                resp.headers_mut().append(hyper::header::SET_COOKIE, value);
            }
            StickyOutcome::Terminal(resp, "maintenance")
        }
    }
}

fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(hyper::header::COOKIE).and_then(|v| v.to_str().ok()).and_then(|raw| {
        raw.split(';').find_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            if k == name {
                Some(v.to_string())
            } else {
                None
            }
        })
    })
}

fn build_set_cookie(config: &StickyConfig, machine_id: &str) -> String {
    let mut cookie = format!(
        "{}={}; Path={}; Max-Age={}",
        config.cookie_name, machine_id, config.cookie_path, config.max_age_seconds
    );
    if config.secure {
        cookie.push_str("; Secure");
    }
    if config.http_only {
        cookie.push_str("; HttpOnly");
    }
    cookie.push_str(match config.same_site {
        SameSitePolicy::Lax => "; SameSite=Lax",
        SameSitePolicy::Strict => "; SameSite=Strict",
        SameSitePolicy::None => "; SameSite=None",
    });
    cookie
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn config() -> StickyConfig {
        StickyConfig {
            enabled: true,
            cookie_name: "fly-machine-id".into(),
            cookie_path: "/".into(),
            max_age_seconds: 3600,
            secure: false,
            http_only: true,
            same_site: SameSitePolicy::Lax,
            paths: Vec::new(),
        }
    }

    fn identity() -> PlatformIdentity {
        PlatformIdentity { machine_id: Some("local123".into()), app_name: Some("myapp".into()) }
    }

    #[test]
    fn inert_when_disabled() {
        let mut cfg = config();
        cfg.enabled = false;
        let outcome = decide(&cfg, &identity(), "/", &HeaderMap::new());
        assert!(matches!(outcome, StickyOutcome::Inert));
    }

    #[test]
    fn inert_without_platform_identity() {
        let identity = PlatformIdentity::default();
        let outcome = decide(&config(), &identity, "/", &HeaderMap::new());
        assert!(matches!(outcome, StickyOutcome::Inert));
    }

    #[test]
    fn absent_cookie_claims_request() {
        let outcome = decide(&config(), &identity(), "/", &HeaderMap::new());
        match outcome {
            StickyOutcome::Pass { set_cookie } => assert!(set_cookie.unwrap().contains("local123")),
            _ => panic!("expected Pass"),
        }
    }

    #[test]
    fn matching_cookie_refreshes_and_passes() {
        let mut headers = HeaderMap::new();
        headers.insert(hyper::header::COOKIE, HeaderValue::from_static("fly-machine-id=local123"));
        let outcome = decide(&config(), &identity(), "/", &headers);
        assert!(matches!(outcome, StickyOutcome::Pass { .. }));
    }

    #[test]
    fn differing_cookie_without_retry_replays() {
        let mut headers = HeaderMap::new();
        headers.insert(hyper::header::COOKIE, HeaderValue::from_static("fly-machine-id=other456"));
        let outcome = decide(&config(), &identity(), "/", &headers);
        match outcome {
            StickyOutcome::Terminal(resp, kind) => {
                assert_eq!(
                    resp.headers().get("content-type").unwrap(),
                    "application/vnd.fly.replay+json"
                );
                assert_eq!(kind, "fly-replay");
            }
            _ => panic!("expected replay"),
        }
    }

    #[test]
    fn differing_cookie_with_retry_serves_maintenance() {
        let mut headers = HeaderMap::new();
        headers.insert(hyper::header::COOKIE, HeaderValue::from_static("fly-machine-id=other456"));
        headers.insert("x-navigator-retry", HeaderValue::from_static("true"));
        let outcome = decide(&config(), &identity(), "/", &headers);
        match outcome {
            StickyOutcome::Terminal(resp, kind) => {
                assert_eq!(resp.status(), hyper::StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(kind, "maintenance");
                let set_cookie = resp.headers().get(hyper::header::SET_COOKIE).unwrap().to_str().unwrap();
                assert!(set_cookie.contains("local123"));
            }
            _ => panic!("expected maintenance"),
        }
    }
}
