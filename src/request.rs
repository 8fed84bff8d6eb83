//! HTTP Upgrade request/response construction and parsing for the
//! handshake collaborator. Parsing goes through `httparse` rather than
//! hand-rolled line splitting, and the client side parses the server's 101
//! response instead of trusting it blindly.

use crate::error::HandshakeError;
use url::Url;

pub(crate) const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub(crate) struct ParsedRequest {
    pub path: String,
    pub headers: Vec<(String, String)>,
}

pub(crate) struct ParsedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

impl ParsedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }
}

impl ParsedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }
}

/// Parses an HTTP request out of `buf`. Returns the parsed request and how
/// many bytes of `buf` the head occupied, so the caller can hand any
/// trailing bytes (a pipelined frame) to the connection's read pump instead
/// of discarding them.
pub(crate) fn parse_request(buf: &[u8]) -> Result<Option<(ParsedRequest, usize)>, HandshakeError> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut header_storage);
    match req.parse(buf)? {
        httparse::Status::Complete(consumed) => {
            let path = req.path.unwrap_or("/").to_string();
            let headers = req
                .headers
                .iter()
                .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                .collect();
            Ok(Some((ParsedRequest { path, headers }, consumed)))
        }
        httparse::Status::Partial => Ok(None),
    }
}

/// Parses an HTTP response out of `buf`, same partial/complete contract as
/// [`parse_request`].
pub(crate) fn parse_response(buf: &[u8]) -> Result<Option<(ParsedResponse, usize)>, HandshakeError> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut res = httparse::Response::new(&mut header_storage);
    match res.parse(buf)? {
        httparse::Status::Complete(consumed) => {
            let status = res.code.unwrap_or(0);
            let headers = res
                .headers
                .iter()
                .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                .collect();
            Ok(Some((ParsedResponse { status, headers }, consumed)))
        }
        httparse::Status::Partial => Ok(None),
    }
}

/// Builds the client's opening request line + headers for `ws_url`.
/// Returns `(request_text, host_with_port)` — the latter is what the caller
/// dials over TCP.
pub(crate) fn construct_http_request(
    ws_url: &str,
    key: &str,
    subprotocols: &[String],
) -> Result<(String, String), HandshakeError> {
    let parsed_url = Url::parse(ws_url)?;

    let default_port: u16 = match parsed_url.scheme() {
        "ws" => 80,
        "wss" => 443,
        _ => return Err(HandshakeError::InvalidSchemeURL),
    };

    let host = parsed_url.host_str().ok_or(HandshakeError::URLNoHost)?;
    let port = parsed_url.port().unwrap_or(default_port);
    let host_with_port = format!("{host}:{port}");

    let request_host_field = match parsed_url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let request_path = match parsed_url.query() {
        Some(query) => format!("{}?{}", parsed_url.path(), query),
        None => parsed_url.path().to_string(),
    };

    let mut request = format!(
        "GET {request_path} HTTP/1.1\r\n\
         Host: {request_host_field}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n"
    );

    if !subprotocols.is_empty() {
        request.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", subprotocols.join(", ")));
    }

    request.push_str("\r\n");

    Ok((request, host_with_port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructs_plain_request_for_ws_scheme() {
        let (request, host) = construct_http_request("ws://example.com/chat", "abc123==", &[]).unwrap();
        assert!(request.starts_with("GET /chat HTTP/1.1\r\n"));
        assert!(request.contains("Sec-WebSocket-Key: abc123==\r\n"));
        assert_eq!(host, "example.com:80");
    }

    #[test]
    fn respects_explicit_port() {
        let (_, host) = construct_http_request("ws://example.com:9000/", "key", &[]).unwrap();
        assert_eq!(host, "example.com:9000");
    }

    #[test]
    fn rejects_non_ws_scheme() {
        assert!(construct_http_request("http://example.com/", "key", &[]).is_err());
    }

    #[test]
    fn parses_complete_request() {
        let raw = b"GET /chat HTTP/1.1\r\nHost: x\r\nSec-WebSocket-Key: abc\r\n\r\n";
        let (parsed, consumed) = parse_request(raw).unwrap().unwrap();
        assert_eq!(parsed.path, "/chat");
        assert_eq!(parsed.header("host"), Some("x"));
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn partial_request_returns_none() {
        let raw = b"GET /chat HTTP/1.1\r\nHost: x\r\n";
        assert!(parse_request(raw).unwrap().is_none());
    }
}
