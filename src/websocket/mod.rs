//! WebSocket proxy primitive (spec section 4.5): detect the upgrade, dial
//! the backend as a client, filter handshake headers, and bridge frames
//! bidirectionally until either side closes.

use std::collections::HashMap;

use futures::{SinkExt, StreamExt};
use hyper::header::{HeaderName, HeaderValue, CONNECTION, UPGRADE};
use hyper::upgrade::Upgraded;
use hyper::HeaderMap;
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::NavigatorError;
use crate::util;

/// The four headers specific to one upgrade negotiation, never forwarded
/// between the two independent WebSocket connections a proxy bridges.
const HANDSHAKE_HEADERS: &[&str] = &[
    "sec-websocket-key",
    "sec-websocket-accept",
    "sec-websocket-version",
    "sec-websocket-extensions",
];

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

/// Spec 4.5 detection rule: `Connection` (case-insensitive, any token)
/// contains `upgrade` AND `Upgrade` equals `websocket`.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_has_upgrade = headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    let upgrade_is_websocket = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    connection_has_upgrade && upgrade_is_websocket
}

/// Derives `Sec-WebSocket-Accept` from the client's `Sec-WebSocket-Key`
/// (spec 4.5: the proxy answers the client's handshake itself, since a
/// fresh key is sent to the backend rather than the client's own).
pub fn derive_accept_key(client_key: &str) -> String {
    tokio_tungstenite::tungstenite::handshake::derive_accept_key(client_key.as_bytes())
}

/// `http://` -> `ws://`, `https://` -> `wss://`.
pub fn to_ws_url(target_url: &str) -> String {
    if let Some(rest) = target_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = target_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        target_url.to_string()
    }
}

/// Copy inbound headers minus hop-by-hop minus the four handshake headers,
/// forwarding `Sec-WebSocket-Protocol`, and apply per-route templating
/// (spec 4.5 dial).
pub fn build_handshake_headers(
    inbound: &HeaderMap,
    route_headers: &HashMap<String, String>,
    remote_addr: &str,
    scheme: &str,
    host: &str,
) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in inbound.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str()) || HANDSHAKE_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    for (name, template) in route_headers {
        let expanded = util::expand_header_template(template, remote_addr, scheme, host);
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&expanded),
        ) {
            out.insert(name, value);
        }
    }
    out
}

pub struct BackendDial {
    pub stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    pub subprotocol: Option<String>,
}

/// Dial the backend as a WebSocket client (spec 4.5 dial).
pub async fn dial_backend(ws_url: &str, headers: HeaderMap) -> Result<BackendDial, NavigatorError> {
    let uri: hyper::Uri = ws_url
        .parse()
        .map_err(|e| NavigatorError::InvalidTarget(format!("{ws_url}: {e}")))?;

    let mut builder = hyper::Request::builder().method("GET").uri(uri);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    let request = builder
        .body(())
        .map_err(|e| NavigatorError::InvalidTarget(e.to_string()))?;

    let (stream, response) = connect_async(request)
        .await
        .map_err(|e| NavigatorError::UpstreamUnavailable(e.to_string()))?;

    let subprotocol = response
        .headers()
        .get(hyper::header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    Ok(BackendDial { stream, subprotocol })
}

/// Bridge two already-established WebSocket connections until either side
/// errors or closes (spec 4.5 bridging). Normal closures are logged at
/// debug, anything else at info/error.
pub async fn bridge(
    client: WebSocketStream<TokioIo<Upgraded>>,
    backend: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
) {
    crate::metrics::record_websocket_opened();
    let (mut client_sink, mut client_stream) = client.split();
    let (mut backend_sink, mut backend_stream) = backend.split();

    let client_to_backend = async {
        while let Some(msg) = client_stream.next().await {
            match msg {
                Ok(msg) => {
                    let is_close = matches!(msg, Message::Close(_));
                    if backend_sink.send(msg).await.is_err() {
                        break;
                    }
                    if is_close {
                        break;
                    }
                }
                Err(e) => {
                    log_close(&e);
                    break;
                }
            }
        }
        let _ = backend_sink.close().await;
    };

    let backend_to_client = async {
        while let Some(msg) = backend_stream.next().await {
            match msg {
                Ok(msg) => {
                    let is_close = matches!(msg, Message::Close(_));
                    if client_sink.send(msg).await.is_err() {
                        break;
                    }
                    if is_close {
                        break;
                    }
                }
                Err(e) => {
                    log_close(&e);
                    break;
                }
            }
        }
        let _ = client_sink.close().await;
    };

    tokio::select! {
        _ = client_to_backend => debug!("websocket bridge: client side closed"),
        _ = backend_to_client => debug!("websocket bridge: backend side closed"),
    }
    crate::metrics::record_websocket_closed();
    info!("websocket bridge finished");
}

fn log_close(err: &tokio_tungstenite::tungstenite::Error) {
    use tokio_tungstenite::tungstenite::Error;
    match err {
        Error::ConnectionClosed | Error::AlreadyClosed => debug!("websocket closed normally"),
        other => warn!(error = %other, "websocket bridge error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn detects_upgrade_requests() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(is_upgrade_request(&headers));
    }

    #[test]
    fn rejects_plain_requests() {
        let headers = HeaderMap::new();
        assert!(!is_upgrade_request(&headers));
    }

    #[test]
    fn accept_key_matches_rfc6455_example() {
        assert_eq!(derive_accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn scheme_swap_for_ws() {
        assert_eq!(to_ws_url("http://backend:8080/ws"), "ws://backend:8080/ws");
        assert_eq!(to_ws_url("https://backend:8080/ws"), "wss://backend:8080/ws");
    }

    #[test]
    fn handshake_headers_are_stripped_but_protocol_is_kept() {
        let mut headers = HeaderMap::new();
        headers.insert("sec-websocket-key", HeaderValue::from_static("abc"));
        headers.insert("sec-websocket-protocol", HeaderValue::from_static("v1"));
        headers.insert("connection", HeaderValue::from_static("upgrade"));
        let out = build_handshake_headers(&headers, &HashMap::new(), "1.2.3.4", "http", "example.com");
        assert!(!out.contains_key("sec-websocket-key"));
        assert!(!out.contains_key("connection"));
        assert_eq!(out.get("sec-websocket-protocol").unwrap(), "v1");
    }
}
