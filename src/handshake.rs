//! The handshake collaborator: turns a raw duplex byte stream into a live
//! [`Connection`] by performing the HTTP/1.1 Upgrade dance from RFC 6455
//! §4, negotiating subprotocols and origin policy along the way and
//! handing any bytes read past the HTTP head to the read pump instead of
//! dropping them.

use crate::config::{AcceptOptions, DialOptions, DialResponse, OriginPolicy};
use crate::connection::{Connection, Role};
use crate::error::{Error, HandshakeError};
use crate::io_util::Prefixed;
use crate::read::spawn_read_pump;
use crate::request::{construct_http_request, parse_request, parse_response};
use base64::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

const MAX_HEAD_SIZE: usize = 16 * 1024;
const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(10);

fn accept_value(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(crate::request::WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

fn generate_client_key() -> String {
    let mut rng = StdRng::from_rng(rand::thread_rng()).expect("OS RNG must be available");
    let mut nonce = [0u8; 16];
    rng.fill(&mut nonce);
    BASE64_STANDARD.encode(nonce)
}

/// Reads off `source` until a full HTTP head (terminated by `\r\n\r\n`) has
/// arrived, enforcing both a size cap and a deadline so a connection that
/// never completes its handshake can't pin a task forever.
async fn read_head<T: AsyncRead + Unpin>(source: &mut T) -> Result<Vec<u8>, HandshakeError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let result = timeout(HEAD_READ_TIMEOUT, async {
        loop {
            if buf.len() >= MAX_HEAD_SIZE {
                return Err(HandshakeError::IncompleteHTTPRequest);
            }
            let n = source.read(&mut chunk).await.map_err(|_| HandshakeError::IncompleteHTTPRequest)?;
            if n == 0 {
                return Err(HandshakeError::IncompleteHTTPRequest);
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                return Ok(());
            }
        }
    })
    .await;

    match result {
        Ok(Ok(())) => Ok(buf),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(HandshakeError::IncompleteHTTPRequest),
    }
}

fn negotiate_subprotocol(requested: Option<&str>, offered: &[String]) -> Option<String> {
    let requested = requested?;
    requested
        .split(',')
        .map(|s| s.trim())
        .find(|candidate| offered.iter().any(|p| p == candidate))
        .map(ToOwned::to_owned)
}

/// Accepts an incoming connection on `stream`, performing the server side
/// of the handshake and returning a live [`Connection`] plus the
/// subprotocol the client asked for and we granted, if any.
pub async fn accept<T>(stream: T, options: AcceptOptions) -> Result<(Connection, Option<String>), Error>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let head = read_head(&mut read_half).await?;
    let (request, consumed) = parse_request(&head)?.ok_or(HandshakeError::IncompleteHTTPRequest)?;
    let leftover = head[consumed..].to_vec();

    let connection_hdr = request.header("connection").ok_or(HandshakeError::NoConnectionHeaderPresent)?;
    if !connection_hdr.to_ascii_lowercase().contains("upgrade") {
        return Err(HandshakeError::NoConnectionHeaderPresent.into());
    }
    let upgrade_hdr = request.header("upgrade").ok_or(HandshakeError::NoUpgradeHeaderPresent)?;
    if !upgrade_hdr.eq_ignore_ascii_case("websocket") {
        return Err(HandshakeError::NoUpgradeHeaderPresent.into());
    }
    match request.header("sec-websocket-version") {
        Some("13") => {}
        _ => return Err(HandshakeError::VersionMismatch.into()),
    }
    let client_key = request.header("sec-websocket-key").ok_or(HandshakeError::NoSecWebsocketKey)?.to_string();

    if let OriginPolicy::AllowList(allowed) = &options.origin_policy {
        let origin = request.header("origin").unwrap_or("");
        if !allowed.iter().any(|o| o == origin) {
            return Err(HandshakeError::OriginNotAllowed.into());
        }
    }

    let subprotocol = negotiate_subprotocol(request.header("sec-websocket-protocol"), &options.subprotocols);

    let accept = accept_value(&client_key);
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {accept}\r\n"
    );
    if let Some(proto) = &subprotocol {
        response.push_str(&format!("Sec-WebSocket-Protocol: {proto}\r\n"));
    }
    response.push_str("\r\n");

    write_half.write_all(response.as_bytes()).await.map_err(Error::from)?;
    write_half.flush().await.map_err(Error::from)?;

    let source: Box<dyn AsyncRead + Send + Unpin> = Box::new(Prefixed::new(leftover, read_half));
    let sink: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);

    let (connection, tx) = Connection::new(sink, Role::Server, &options.config, subprotocol.clone());
    let shared = connection.shared();
    spawn_read_pump(source, shared, tx);

    Ok((connection, subprotocol))
}

/// Dials `ws_url`, performing the client side of the handshake over a fresh
/// TCP connection. TLS (`wss://`) is out of scope here — see the crate's
/// non-goals; `ws://` only.
pub async fn dial(ws_url: &str, options: DialOptions) -> Result<(Connection, DialResponse), Error> {
    if ws_url.starts_with("wss://") {
        return Err(HandshakeError::InvalidSchemeURL.into());
    }

    let key = generate_client_key();
    let (request, host_with_port) = construct_http_request(ws_url, &key, &options.subprotocols)?;

    let stream = TcpStream::connect(&host_with_port).await?;
    dial_over(stream, &request, &key, options).await
}

/// The stream-generic half of [`dial`]: everything past "the request text
/// and key are already built", so tests can drive both sides of a
/// handshake over an in-memory duplex pair instead of a real socket.
async fn dial_over<T>(stream: T, request: &str, key: &str, options: DialOptions) -> Result<(Connection, DialResponse), Error>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    write_half.write_all(request.as_bytes()).await?;
    write_half.flush().await?;

    let head = read_head(&mut read_half).await?;
    let (response, consumed) = parse_response(&head)?.ok_or(HandshakeError::IncompleteHTTPRequest)?;
    let leftover = head[consumed..].to_vec();

    if response.status != 101 {
        return Err(HandshakeError::NoUpgrade.into());
    }
    match response.header("upgrade") {
        Some(v) if v.eq_ignore_ascii_case("websocket") => {}
        _ => return Err(HandshakeError::NoUpgrade.into()),
    }
    let server_accept = response.header("sec-websocket-accept").ok_or(HandshakeError::NoAccept)?;
    if server_accept != accept_value(key) {
        return Err(HandshakeError::InvalidAcceptKey.into());
    }

    let granted_subprotocol = response.header("sec-websocket-protocol").map(ToOwned::to_owned);
    if let Some(proto) = &granted_subprotocol {
        if !options.subprotocols.iter().any(|p| p == proto) {
            return Err(HandshakeError::SubprotocolMismatch.into());
        }
    }

    let source: Box<dyn AsyncRead + Send + Unpin> = Box::new(Prefixed::new(leftover, read_half));
    let sink: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);

    let (connection, tx) = Connection::new(sink, Role::Client, &options.config, granted_subprotocol.clone());
    let shared = connection.shared();
    spawn_read_pump(source, shared, tx);

    Ok((connection, DialResponse { subprotocol: granted_subprotocol }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    #[test]
    fn accept_value_matches_known_vector() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(accept_value("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn negotiates_first_mutually_supported_subprotocol() {
        let offered = vec!["chat".to_string(), "superchat".to_string()];
        assert_eq!(negotiate_subprotocol(Some("foo, chat, superchat"), &offered), Some("chat".to_string()));
    }

    #[test]
    fn no_overlap_yields_none() {
        let offered = vec!["chat".to_string()];
        assert_eq!(negotiate_subprotocol(Some("foo, bar"), &offered), None);
    }

    async fn handshake_pair(
        accept_options: AcceptOptions,
        dial_options: DialOptions,
    ) -> (Connection, Connection, DialResponse) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let key = generate_client_key();
        let (request, _) = construct_http_request("ws://localhost/chat", &key, &dial_options.subprotocols).unwrap();

        let server_fut = accept(server_io, accept_options);
        let client_fut = dial_over(client_io, &request, &key, dial_options);

        let (server_result, client_result) = tokio::join!(server_fut, client_fut);
        let (server_conn, _server_subprotocol) = server_result.unwrap();
        let (client_conn, dial_response) = client_result.unwrap();
        (server_conn, client_conn, dial_response)
    }

    #[tokio::test]
    async fn full_handshake_then_text_echo() {
        let (server, client, _) = handshake_pair(AcceptOptions::default(), DialOptions::default()).await;

        let mut client_writer = client.writer().await.unwrap();
        client_writer.send(MessageType::Text, b"ping", None).await.unwrap();

        let mut server_reader = server.reader().await;
        let (kind, stream) = server_reader.next_message(None).await.unwrap().unwrap();
        assert_eq!(kind, MessageType::Text);
        let body = stream.read_to_end(None).await.unwrap();
        assert_eq!(body, b"ping");

        let mut server_writer = server.writer().await.unwrap();
        server_writer.send(MessageType::Text, b"pong", None).await.unwrap();

        let mut client_reader = client.reader().await;
        let (_, stream) = client_reader.next_message(None).await.unwrap().unwrap();
        assert_eq!(stream.read_to_end(None).await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn fragmented_binary_message_reassembles() {
        let (server, client, _) = handshake_pair(AcceptOptions::default(), DialOptions::default()).await;

        let mut client_writer = client.writer().await.unwrap();
        let mut sink = client_writer.write_message(MessageType::Binary);
        sink.write_chunk(&[1, 2, 3], None).await.unwrap();
        sink.write_chunk(&[4, 5, 6], None).await.unwrap();
        sink.finish(None).await.unwrap();

        let mut server_reader = server.reader().await;
        let (kind, stream) = server_reader.next_message(None).await.unwrap().unwrap();
        assert_eq!(kind, MessageType::Binary);
        assert_eq!(stream.read_to_end(None).await.unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn ping_resolves_once_pong_arrives() {
        // Ping/Pong are handled inline by each side's read pump — no
        // `MessageReader` needs to be held for the pong to come back.
        let (_server, client, _) = handshake_pair(AcceptOptions::default(), DialOptions::default()).await;
        client.ping(b"hello".to_vec(), Some(std::time::Duration::from_secs(2))).await.unwrap();
    }

    #[tokio::test]
    async fn close_handshake_completes_both_sides() {
        let (_server, client, _) = handshake_pair(AcceptOptions::default(), DialOptions::default()).await;
        client
            .close(crate::close::CloseCode::Normal, "bye", Some(std::time::Duration::from_secs(2)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ping_resolves_while_peer_streams_a_large_message() {
        let (server, client, _) = handshake_pair(AcceptOptions::default(), DialOptions::default()).await;

        let mut server_writer = server.writer().await.unwrap();
        let mut sink = server_writer.write_message(MessageType::Binary);
        let chunk_a = vec![0xAAu8; 4096];
        let chunk_b = vec![0xBBu8; 4096];
        sink.write_chunk(&chunk_a, None).await.unwrap();

        client.ping(b"abcd".to_vec(), Some(std::time::Duration::from_secs(2))).await.unwrap();

        sink.write_chunk(&chunk_b, None).await.unwrap();
        sink.finish(None).await.unwrap();

        let mut client_reader = client.reader().await;
        let (kind, stream) = client_reader.next_message(None).await.unwrap().unwrap();
        assert_eq!(kind, MessageType::Binary);
        let mut expected = chunk_a;
        expected.extend_from_slice(&chunk_b);
        assert_eq!(stream.read_to_end(None).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn subprotocol_is_negotiated() {
        let accept_options = AcceptOptions { subprotocols: vec!["chat".to_string()], ..Default::default() };
        let dial_options = DialOptions { subprotocols: vec!["chat".to_string()], ..Default::default() };
        let (server, client, dial_response) = handshake_pair(accept_options, dial_options).await;

        assert_eq!(server.subprotocol(), Some("chat"));
        assert_eq!(dial_response.subprotocol.as_deref(), Some("chat"));
    }

    #[tokio::test]
    async fn read_deadline_expiring_does_not_disturb_the_pump() {
        let (server, client, _) = handshake_pair(AcceptOptions::default(), DialOptions::default()).await;

        let mut server_reader = server.reader().await;
        let err = server_reader
            .next_message(Some(std::time::Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));

        let mut client_writer = client.writer().await.unwrap();
        client_writer.send(MessageType::Text, b"still alive", None).await.unwrap();

        let (kind, stream) = server_reader.next_message(None).await.unwrap().unwrap();
        assert_eq!(kind, MessageType::Text);
        assert_eq!(stream.read_to_end(None).await.unwrap(), b"still alive");
    }

    #[tokio::test]
    async fn connection_read_write_convenience_methods() {
        let (server, client, _) = handshake_pair(AcceptOptions::default(), DialOptions::default()).await;

        client.write(MessageType::Text, b"hi", None).await.unwrap();
        let (kind, body) = server.read(None).await.unwrap().unwrap();
        assert_eq!(kind, MessageType::Text);
        assert_eq!(body, b"hi");
    }
}
