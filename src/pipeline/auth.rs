//! Basic-auth predicate (spec 4.1 step 7). Credential *storage* (htpasswd
//! parsing) is an external collaborator per spec section 1; this module
//! only defines the narrow contract Navigator calls into and the
//! challenge/verification mechanics around it.

use base64::Engine;
use hyper::{HeaderMap, Response, StatusCode};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::body::{self, ResponseBody};
use crate::config::AuthConfig;

/// Contract for the external htpasswd-backed credential store (spec
/// section 1 non-goal: parsing the file itself is out of scope).
pub trait CredentialStore: Send + Sync {
    /// Returns `true` iff `username`/`password` verify against the store.
    /// Implementations must use constant-time comparison for hashes.
    fn verify(&self, username: &str, password: &str) -> bool;
}

/// A `CredentialStore` with no configured users: every request fails
/// auth. Used when `[auth].htpasswd_file` is unset but `enabled = true`.
pub struct EmptyCredentialStore;

impl CredentialStore for EmptyCredentialStore {
    fn verify(&self, _username: &str, _password: &str) -> bool {
        false
    }
}

pub enum AuthOutcome {
    /// Not excluded and auth is enabled, but the request supplied no or
    /// invalid credentials: terminal 401 with a challenge.
    Challenge(Response<ResponseBody>),
    /// Excluded path, auth disabled, or credentials verified: proceed,
    /// carrying the username for the access-log `remote_user` field.
    Pass { remote_user: Option<String> },
}

pub fn check(config: &AuthConfig, path: &str, headers: &HeaderMap, store: &dyn CredentialStore) -> AuthOutcome {
    if !config.enabled || is_excluded(path, &config.exclude_paths) {
        return AuthOutcome::Pass { remote_user: None };
    }

    match parse_basic_auth(headers) {
        Some((user, pass)) if store.verify(&user, &pass) => AuthOutcome::Pass { remote_user: Some(user) },
        _ => {
            debug!(%path, "authentication required");
            AuthOutcome::Challenge(challenge_response(&config.realm))
        }
    }
}

/// Unlike `util::matches_any_glob` (used for the sticky-session gate, where
/// an empty list means "every path"), an empty exclude list here means
/// "nothing is excluded" — otherwise auth would be bypassed by default.
fn is_excluded(path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| match glob::Pattern::new(p) {
        Ok(pat) => pat.matches(path),
        Err(_) => p == path,
    })
}

fn parse_basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let raw = headers.get(hyper::header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = raw.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn challenge_response(realm: &str) -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header("www-authenticate", format!("Basic realm=\"{realm}\""))
        .header("content-type", "text/plain; charset=utf-8")
        .body(body::text("Authentication required"))
        .expect("static challenge response is well-formed")
}

/// Constant-time string comparison, for `CredentialStore` implementations
/// comparing against a precomputed hash elsewhere in the stack.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    struct FixedStore;
    impl CredentialStore for FixedStore {
        fn verify(&self, username: &str, password: &str) -> bool {
            username == "alice" && password == "secret"
        }
    }

    #[test]
    fn disabled_auth_always_passes() {
        let config = AuthConfig { enabled: false, ..AuthConfig::default() };
        let outcome = check(&config, "/anything", &HeaderMap::new(), &FixedStore);
        assert!(matches!(outcome, AuthOutcome::Pass { remote_user: None }));
    }

    #[test]
    fn excluded_path_passes_without_credentials() {
        let config = AuthConfig { enabled: true, exclude_paths: vec!["/public/*".into()], ..AuthConfig::default() };
        let outcome = check(&config, "/public/a.js", &HeaderMap::new(), &FixedStore);
        assert!(matches!(outcome, AuthOutcome::Pass { remote_user: None }));
    }

    #[test]
    fn missing_credentials_challenge() {
        let config = AuthConfig { enabled: true, ..AuthConfig::default() };
        let outcome = check(&config, "/private", &HeaderMap::new(), &FixedStore);
        match outcome {
            AuthOutcome::Challenge(resp) => {
                assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
                assert!(resp.headers().contains_key("www-authenticate"));
            }
            _ => panic!("expected challenge"),
        }
    }

    #[test]
    fn valid_credentials_pass_with_remote_user() {
        let config = AuthConfig { enabled: true, ..AuthConfig::default() };
        let mut headers = HeaderMap::new();
        let encoded = base64::engine::general_purpose::STANDARD.encode("alice:secret");
        headers.insert(hyper::header::AUTHORIZATION, HeaderValue::from_str(&format!("Basic {encoded}")).unwrap());
        let outcome = check(&config, "/private", &headers, &FixedStore);
        match outcome {
            AuthOutcome::Pass { remote_user } => assert_eq!(remote_user, Some("alice".to_string())),
            _ => panic!("expected pass"),
        }
    }

    #[test]
    fn wrong_password_challenges() {
        let config = AuthConfig { enabled: true, ..AuthConfig::default() };
        let mut headers = HeaderMap::new();
        let encoded = base64::engine::general_purpose::STANDARD.encode("alice:wrong");
        headers.insert(hyper::header::AUTHORIZATION, HeaderValue::from_str(&format!("Basic {encoded}")).unwrap());
        let outcome = check(&config, "/private", &headers, &FixedStore);
        assert!(matches!(outcome, AuthOutcome::Challenge(_)));
    }
}
