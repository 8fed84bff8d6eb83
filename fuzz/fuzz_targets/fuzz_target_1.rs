#![no_main]

use base64::prelude::*;
use libfuzzer_sys::fuzz_target;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use wsendpoint::{accept, AcceptOptions};

fuzz_target!(|data: &[u8]| {
    let runtime = Runtime::new().unwrap();
    let data_vec = Vec::from(data);

    runtime.block_on(async move {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let handshake = build_fuzzed_handshake(&data_vec);
                let _ = socket.write_all(&handshake).await;
            }
        });

        if let Ok(client_stream) = TcpStream::connect(addr).await {
            let result = accept(client_stream, AcceptOptions::default()).await;
            if let Err(err) = result {
                let _ = format!("{err:?}");
            }
        }
    });
});

/// Builds a WebSocket handshake request whose `Sec-WebSocket-Key` and
/// trailing header are driven by fuzz data, so the parser sees arbitrary
/// base64 payloads and header noise.
fn build_fuzzed_handshake(data: &[u8]) -> Vec<u8> {
    let mut handshake = b"GET / HTTP/1.1\r\n\
                          Host: 127.0.0.1\r\n\
                          Upgrade: websocket\r\n\
                          Connection: Upgrade\r\n"
        .to_vec();

    let key = generate_fuzzed_key(data);
    handshake.extend_from_slice(format!("Sec-WebSocket-Key: {key}\r\n").as_bytes());
    handshake.extend_from_slice(b"Sec-WebSocket-Version: 13\r\n");

    if data.len() % 2 == 0 {
        handshake.extend_from_slice(b"Connection: Fuzzed-Value\r\n");
    }

    handshake.extend_from_slice(b"\r\n");
    handshake
}

fn generate_fuzzed_key(data: &[u8]) -> String {
    BASE64_STANDARD.encode(data)
}
