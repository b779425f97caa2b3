//! End-to-end scenarios: a raw-socket "browser" talking to a real client
//! proxy, which crosses a real link to a real offshore server, which reaches
//! in-process origins.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

/// Boot a full proxy pair and return the browser-facing address.
async fn start_proxy_pair() -> SocketAddr {
    let server_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server_listener.local_addr().unwrap();
    tokio::spawn(convoy_server::serve(server_listener));

    let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client_addr = client_listener.local_addr().unwrap();
    tokio::spawn(convoy_client::serve(
        client_listener,
        server_addr.to_string(),
    ));

    client_addr
}

/// Origin that reads one request (headers plus `Content-Length` body),
/// hands back the raw bytes it saw, and answers with `response`.
async fn spawn_origin(response: String) -> (SocketAddr, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let seen = read_http_message(&mut stream).await;
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();
        let _ = seen_tx.send(seen);
    });
    (addr, seen_rx)
}

/// Origin that echoes the request body back with its exact length.
async fn spawn_echo_body_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let seen = read_http_message(&mut stream).await;
        let header_end = seen.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let body = &seen[header_end..];
        let head = format!(
            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.write_all(body).await.unwrap();
        stream.flush().await.unwrap();
    });
    addr
}

/// TCP echo service for CONNECT tunnels.
async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if stream.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
    });
    addr
}

/// Read one HTTP message (header block plus `Content-Length` body) as raw
/// bytes.
async fn read_http_message(stream: &mut TcpStream) -> Vec<u8> {
    let mut seen = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "eof before header end");
        seen.extend_from_slice(&buf[..n]);
        if let Some(pos) = seen.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&seen[..header_end]).to_lowercase();
    let body_len = head
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while seen.len() < header_end + body_len {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "eof mid body");
        seen.extend_from_slice(&buf[..n]);
    }
    seen
}

/// Read a response: returns the header block and exactly `Content-Length`
/// body bytes.
async fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let seen = read_http_message(stream).await;
    let header_end = seen.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
    let head = String::from_utf8_lossy(&seen[..header_end]).to_string();
    (head, seen[header_end..].to_vec())
}

/// Read a close-delimited response (no `Content-Length`): everything up to
/// EOF.
async fn read_response_until_close(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut seen = Vec::new();
    stream.read_to_end(&mut seen).await.unwrap();
    let header_end = seen.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
    let head = String::from_utf8_lossy(&seen[..header_end]).to_string();
    (head, seen[header_end..].to_vec())
}

#[tokio::test]
async fn test_plain_get() {
    let proxy = start_proxy_pair().await;
    let (origin, seen_rx) =
        spawn_origin("HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nworld".to_string()).await;

    let mut browser = TcpStream::connect(proxy).await.unwrap();
    let request = format!("GET http://{origin}/hello HTTP/1.1\r\nHost: {origin}\r\n\r\n");
    browser.write_all(request.as_bytes()).await.unwrap();

    let (head, body) = read_response(&mut browser).await;
    assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");
    assert_eq!(body, b"world");

    let seen = String::from_utf8_lossy(&seen_rx.await.unwrap()).to_lowercase();
    assert!(seen.starts_with("get /hello http/1.1"), "origin saw: {seen}");
}

#[tokio::test]
async fn test_post_with_content_length() {
    let proxy = start_proxy_pair().await;
    let (origin, seen_rx) =
        spawn_origin("HTTP/1.1 201 Created\r\ncontent-length: 0\r\n\r\n".to_string()).await;

    let mut browser = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "POST http://{origin}/create HTTP/1.1\r\nHost: {origin}\r\nContent-Length: 5\r\n\r\nhello"
    );
    browser.write_all(request.as_bytes()).await.unwrap();

    let (head, body) = read_response(&mut browser).await;
    assert!(head.starts_with("HTTP/1.1 201"), "got: {head}");
    assert!(body.is_empty());

    let seen = String::from_utf8_lossy(&seen_rx.await.unwrap()).to_lowercase();
    assert!(seen.contains("content-length: 5"));
    assert!(seen.ends_with("hello"));
}

/// POST `size` patterned bytes through the whole pair to a body-echoing
/// origin and check they come back identical.
async fn roundtrip_body(proxy: SocketAddr, size: usize) {
    let origin = spawn_echo_body_origin().await;
    let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();

    let mut browser = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "POST http://{origin}/echo HTTP/1.1\r\nHost: {origin}\r\nContent-Length: {size}\r\n\r\n"
    );
    browser.write_all(request.as_bytes()).await.unwrap();
    browser.write_all(&payload).await.unwrap();

    let (head, body) = read_response(&mut browser).await;
    assert!(head.starts_with("HTTP/1.1 200"), "size {size}: got {head}");
    assert_eq!(body, payload, "size {size}: body mismatch");
}

#[tokio::test]
async fn test_body_fidelity_at_frame_chunk_boundaries() {
    let proxy = start_proxy_pair().await;
    // Around the 32 KiB frame chunk size, plus the empty and one-byte cases.
    for size in [0, 1, 32 * 1024 - 1, 32 * 1024, 32 * 1024 + 1] {
        roundtrip_body(proxy, size).await;
    }
}

#[tokio::test]
async fn test_body_fidelity_at_buffering_boundary() {
    let proxy = start_proxy_pair().await;
    // 10 MiB is where the offshore side stops buffering request bodies; the
    // +1 case exercises the streaming upload path end-to-end.
    for size in [10 * 1024 * 1024 - 1, 10 * 1024 * 1024, 10 * 1024 * 1024 + 1] {
        roundtrip_body(proxy, size).await;
    }
}

#[tokio::test]
async fn test_unreachable_origin_502_then_success_on_same_link() {
    let proxy = start_proxy_pair().await;

    let mut browser = TcpStream::connect(proxy).await.unwrap();
    // Port 1 on loopback refuses immediately.
    browser
        .write_all(b"GET http://127.0.0.1:1/nope HTTP/1.1\r\nHost: 127.0.0.1:1\r\n\r\n")
        .await
        .unwrap();
    // The synthetic 502 carries no Content-Length, so its body is delimited
    // by closing the browser connection.
    let (head, body) = read_response_until_close(&mut browser).await;
    assert!(head.starts_with("HTTP/1.1 502"), "got: {head}");
    assert!(head.to_lowercase().contains("content-type: text/plain"));
    assert!(String::from_utf8_lossy(&body).starts_with("Bad Gateway:"));

    // The next browser connection rides the same link: it must succeed.
    let (origin, _seen) =
        spawn_origin("HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok".to_string()).await;
    let mut browser = TcpStream::connect(proxy).await.unwrap();
    let request = format!("GET http://{origin}/after HTTP/1.1\r\nHost: {origin}\r\n\r\n");
    browser.write_all(request.as_bytes()).await.unwrap();
    let (head, body) = read_response(&mut browser).await;
    assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");
    assert_eq!(body, b"ok");
}

#[tokio::test]
async fn test_hop_by_hop_headers_do_not_cross() {
    let proxy = start_proxy_pair().await;
    let (origin, seen_rx) = spawn_origin(
        "HTTP/1.1 200 OK\r\nx-foo: bar\r\nconnection: close\r\ncontent-length: 2\r\n\r\nhi"
            .to_string(),
    )
    .await;

    let mut browser = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "GET http://{origin}/h HTTP/1.1\r\nHost: {origin}\r\nConnection: keep-alive\r\nProxy-Connection: keep-alive\r\nX-Trace: abc\r\n\r\n"
    );
    browser.write_all(request.as_bytes()).await.unwrap();

    let (head, body) = read_response(&mut browser).await;
    assert_eq!(body, b"hi");
    let head_lower = head.to_lowercase();
    assert!(head_lower.contains("x-foo: bar"), "got: {head}");
    assert!(!head_lower.contains("connection:"), "got: {head}");

    let seen = String::from_utf8_lossy(&seen_rx.await.unwrap()).to_lowercase();
    assert!(seen.contains("x-trace: abc"), "origin saw: {seen}");
    assert!(!seen.contains("proxy-connection:"), "origin saw: {seen}");
    assert!(!seen.contains("\r\nconnection:"), "origin saw: {seen}");
}

#[tokio::test]
async fn test_connect_tunnel_echo() {
    let proxy = start_proxy_pair().await;
    let echo = spawn_tcp_echo().await;

    let mut browser = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n");
    browser.write_all(request.as_bytes()).await.unwrap();

    let (head, _) = read_response(&mut browser).await;
    assert_eq!(head, "HTTP/1.1 200 Connection Established\r\n\r\n");

    let mut payload = vec![0u8; 1024];
    payload.iter_mut().for_each(|b| *b = rand::random());
    browser.write_all(&payload).await.unwrap();

    let mut echoed = vec![0u8; payload.len()];
    browser.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, payload);

    // Half-close: the tunnel tears down without hanging.
    browser.shutdown().await.unwrap();
    let mut rest = Vec::new();
    browser.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_sequential_browsers_share_one_link() {
    let proxy = start_proxy_pair().await;

    for i in 0..3 {
        let body = format!("r{i}");
        let (origin, _seen) = spawn_origin(format!(
            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n{body}",
            body.len()
        ))
        .await;
        let mut browser = TcpStream::connect(proxy).await.unwrap();
        let request = format!("GET http://{origin}/{i} HTTP/1.1\r\nHost: {origin}\r\n\r\n");
        browser.write_all(request.as_bytes()).await.unwrap();
        let (head, got) = read_response(&mut browser).await;
        assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");
        assert_eq!(got, body.as_bytes());
    }
}
