//! Small shared helpers: client-identity extraction, header templating and
//! the injectable platform-identity accessor (spec section 9: "Global state
//! ... read from environment at request time ... expose through a small
//! injectable accessor so tests can override").

use hyper::{HeaderMap, Uri};
use std::net::SocketAddr;

/// Local machine identity, read once from the environment (`FLY_MACHINE_ID`,
/// `FLY_APP_NAME`). Tests construct this directly instead of touching the
/// process environment.
#[derive(Debug, Clone, Default)]
pub struct PlatformIdentity {
    pub machine_id: Option<String>,
    pub app_name: Option<String>,
}

impl PlatformIdentity {
    pub fn from_env() -> Self {
        Self {
            machine_id: std::env::var("FLY_MACHINE_ID").ok(),
            app_name: std::env::var("FLY_APP_NAME").ok(),
        }
    }

    /// Both pieces of identity are required for sticky sessions / fly-replay
    /// to be anything but inert (spec section 4.6: "Requires environment").
    pub fn is_complete(&self) -> bool {
        self.machine_id.is_some() && self.app_name.is_some()
    }
}

/// Resolve the client IP for `$remote_addr` / access-log purposes:
/// `X-Forwarded-For` -> `X-Real-IP` -> peer address, first token, port
/// stripped (spec section 4.2 header policy).
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(v) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = v.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return strip_port(trimmed);
            }
        }
    }
    if let Some(v) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = v.trim();
        if !trimmed.is_empty() {
            return strip_port(trimmed);
        }
    }
    strip_port(&peer.ip().to_string())
}

fn strip_port(addr: &str) -> String {
    // IPv6 literals carry colons themselves; only strip a trailing ":port"
    // when the address is bracketed or has no other colons (i.e. IPv4).
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
    }
    if addr.matches(':').count() == 1 {
        if let Some((host, _port)) = addr.rsplit_once(':') {
            return host.to_string();
        }
    }
    addr.to_string()
}

/// Resolve `$scheme` for header templating: `X-Forwarded-Proto`, else `http`
/// (Navigator never terminates TLS itself; spec section 1: "TLS termination
/// ... assumed done upstream").
pub fn request_scheme(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "http".to_string())
}

/// Resolve `$host` for header templating: the inbound `Host` header.
pub fn request_host(headers: &HeaderMap) -> String {
    headers
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_default()
}

/// Substitute `$remote_addr`, `$scheme`, `$host` placeholders in a
/// header-injection template value (spec section 4.2).
pub fn expand_header_template(template: &str, remote_addr: &str, scheme: &str, host: &str) -> String {
    template
        .replace("$remote_addr", remote_addr)
        .replace("$scheme", scheme)
        .replace("$host", host)
}

/// Path + `?` + raw query, for access logging (spec section 6).
pub fn uri_path_and_query(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string())
}

/// Match a request path against a list of glob patterns (used by sticky
/// sessions' path scoping and auth's exclusion list). An empty list means
/// "matches everything" per spec section 4.6's gate.
pub fn matches_any_glob(path: &str, patterns: &[String]) -> bool {
    if patterns.is_empty() {
        return true;
    }
    patterns.iter().any(|p| match glob::Pattern::new(p) {
        Ok(pat) => pat.matches(path),
        Err(_) => p == path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4, 5.6.7.8"));
        let peer: SocketAddr = "9.9.9.9:1234".parse().unwrap();
        assert_eq!(client_ip(&headers, peer), "1.2.3.4");
    }

    #[test]
    fn client_ip_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("1.2.3.4"));
        let peer: SocketAddr = "9.9.9.9:1234".parse().unwrap();
        assert_eq!(client_ip(&headers, peer), "1.2.3.4");
    }

    #[test]
    fn client_ip_falls_back_to_peer_and_strips_port() {
        let headers = HeaderMap::new();
        let peer: SocketAddr = "9.9.9.9:1234".parse().unwrap();
        assert_eq!(client_ip(&headers, peer), "9.9.9.9");
    }

    #[test]
    fn template_expansion_substitutes_all_placeholders() {
        let out = expand_header_template("addr=$remote_addr scheme=$scheme host=$host", "1.2.3.4", "https", "example.com");
        assert_eq!(out, "addr=1.2.3.4 scheme=https host=example.com");
    }

    #[test]
    fn glob_matching_empty_list_matches_everything() {
        assert!(matches_any_glob("/anything", &[]));
    }

    #[test]
    fn glob_matching_respects_patterns() {
        let patterns = vec!["/api/*".to_string()];
        assert!(matches_any_glob("/api/foo", &patterns));
        assert!(!matches_any_glob("/other", &patterns));
    }
}
