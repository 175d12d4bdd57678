use nocturne::{ParsedBody, Request, Response, Router, Server, ServerConfig, ServerHandle};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

fn test_router() -> Router {
    let mut router = Router::new();
    router.get("/hello", |_req: &Request, res: &mut Response| {
        res.set_status(200, "OK");
        res.set_header("Content-Type", "text/plain");
        res.set_body("Hello");
    });
    router.post("/echo", |req: &Request, res: &mut Response| {
        assert_eq!(req.parsed_body, ParsedBody::Json);
        res.set_status(200, "OK");
        res.set_header("Content-Type", "application/json");
        res.set_body(req.body.clone());
    });
    router.get("/panic", |_req: &Request, _res: &mut Response| {
        panic!("deliberate handler failure");
    });
    router
}

fn start_server(mutate: impl FnOnce(&mut ServerConfig)) -> ServerHandle {
    let mut config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        workers: 2,
        ..ServerConfig::default()
    };
    mutate(&mut config);
    Server::new(config).start(test_router()).unwrap()
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read one full response off the stream. `pending` carries bytes that
/// arrived beyond the previous response (keep-alive).
fn read_response(
    stream: &mut TcpStream,
    pending: &mut Vec<u8>,
) -> (String, HashMap<String, String>, Vec<u8>) {
    let mut tmp = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = find(pending, b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut tmp).unwrap();
        assert!(n > 0, "connection closed before response headers finished");
        pending.extend_from_slice(&tmp[..n]);
    };

    let head = String::from_utf8_lossy(&pending[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap().to_string();
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .expect("response must carry Content-Length")
        .parse()
        .unwrap();

    pending.drain(..header_end + 4);
    while pending.len() < content_length {
        let n = stream.read(&mut tmp).unwrap();
        assert!(n > 0, "connection closed before response body finished");
        pending.extend_from_slice(&tmp[..n]);
    }
    let body: Vec<u8> = pending.drain(..content_length).collect();

    (status_line, headers, body)
}

fn expect_eof(stream: &mut TcpStream) {
    let mut tmp = [0u8; 64];
    loop {
        match stream.read(&mut tmp) {
            Ok(0) => return,
            Ok(_) => continue,
            Err(e) => panic!("expected EOF, got error: {}", e),
        }
    }
}

#[test]
fn basic_get_closes_connection() {
    let server = start_server(|_| {});
    let mut stream = connect(server.port());

    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    let mut pending = Vec::new();
    let (status, headers, body) = read_response(&mut stream, &mut pending);
    assert_eq!(status, "HTTP/1.1 200 OK");
    assert_eq!(headers.get("content-length").unwrap(), "5");
    assert_eq!(headers.get("connection").unwrap(), "close");
    assert!(headers.get("server").unwrap().starts_with("nocturne/"));
    assert_eq!(body, b"Hello");

    // Keep-alive is off by default, so the server closes the socket.
    expect_eof(&mut stream);
    server.stop();
}

#[test]
fn keep_alive_serves_two_requests_on_one_connection() {
    let server = start_server(|c| c.keep_alive = true);
    let mut stream = connect(server.port());

    // Both requests land in one segment; the second must be served from the
    // parser's buffered leftover.
    stream
        .write_all(
            b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\nGET /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .unwrap();

    let mut pending = Vec::new();
    let (status1, headers1, body1) = read_response(&mut stream, &mut pending);
    assert_eq!(status1, "HTTP/1.1 200 OK");
    assert_eq!(headers1.get("connection").unwrap(), "keep-alive");
    assert_eq!(body1, b"Hello");

    let (status2, headers2, body2) = read_response(&mut stream, &mut pending);
    assert_eq!(status2, "HTTP/1.1 200 OK");
    assert_eq!(headers2.get("connection").unwrap(), "close");
    assert_eq!(body2, b"Hello");

    expect_eof(&mut stream);
    server.stop();
}

#[test]
fn byte_drip_get_produces_one_response() {
    let server = start_server(|_| {});
    let mut stream = connect(server.port());

    for byte in b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n" {
        stream.write_all(std::slice::from_ref(byte)).unwrap();
        thread::sleep(Duration::from_millis(1));
    }

    let mut pending = Vec::new();
    let (status, _headers, body) = read_response(&mut stream, &mut pending);
    assert_eq!(status, "HTTP/1.1 200 OK");
    assert_eq!(body, b"Hello");
    server.stop();
}

#[test]
fn overlong_path_gets_400() {
    let server = start_server(|_| {});
    let mut stream = connect(server.port());

    let mut raw = b"GET /".to_vec();
    raw.extend(std::iter::repeat(b'a').take(9_000));
    raw.extend_from_slice(b" HTTP/1.1\r\n\r\n");
    stream.write_all(&raw).unwrap();

    let mut pending = Vec::new();
    let (status, _headers, _body) = read_response(&mut stream, &mut pending);
    assert_eq!(status, "HTTP/1.1 400 Bad Request");
    expect_eof(&mut stream);
    server.stop();
}

#[test]
fn directory_traversal_path_gets_400() {
    let server = start_server(|_| {});
    let mut stream = connect(server.port());

    stream
        .write_all(b"GET /../etc/passwd HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    let mut pending = Vec::new();
    let (status, _headers, _body) = read_response(&mut stream, &mut pending);
    assert_eq!(status, "HTTP/1.1 400 Bad Request");
    expect_eof(&mut stream);
    server.stop();
}

#[test]
fn post_json_reaches_handler_classified() {
    let server = start_server(|_| {});
    let mut stream = connect(server.port());

    let body = br#"{"k":"v","n":1}"#;
    let raw = format!(
        "POST /echo HTTP/1.1\r\nHost: x\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    stream.write_all(raw.as_bytes()).unwrap();
    stream.write_all(body).unwrap();

    let mut pending = Vec::new();
    let (status, headers, got) = read_response(&mut stream, &mut pending);
    assert_eq!(status, "HTTP/1.1 200 OK");
    assert_eq!(headers.get("content-type").unwrap(), "application/json");
    assert_eq!(got, body);
    server.stop();
}

#[test]
fn unknown_route_gets_404_page() {
    let server = start_server(|_| {});
    let mut stream = connect(server.port());

    stream
        .write_all(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    let mut pending = Vec::new();
    let (status, headers, body) = read_response(&mut stream, &mut pending);
    assert_eq!(status, "HTTP/1.1 404 Not Found");
    assert_eq!(headers.get("content-type").unwrap(), "text/html");
    let page = String::from_utf8_lossy(&body);
    assert!(page.contains("404"));
    assert!(page.contains("GET /missing"));
    server.stop();
}

#[test]
fn handler_panic_yields_500_and_close() {
    let server = start_server(|c| c.keep_alive = true);
    let mut stream = connect(server.port());

    stream
        .write_all(b"GET /panic HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    let mut pending = Vec::new();
    let (status, headers, body) = read_response(&mut stream, &mut pending);
    assert_eq!(status, "HTTP/1.1 500 Internal Server Error");
    assert_eq!(headers.get("connection").unwrap(), "close");
    assert_eq!(body, b"Internal Server Error");
    expect_eof(&mut stream);
    server.stop();
}

#[test]
fn connection_cap_rejects_overflow() {
    let server = start_server(|c| c.max_connections = 2);
    let port = server.port();

    let _first = connect(port);
    let _second = connect(port);
    thread::sleep(Duration::from_millis(200));

    // The third connection is accepted by the kernel, then closed by the
    // server on admission failure.
    let mut third = connect(port);
    expect_eof(&mut third);

    // The earlier connections still work.
    let mut first = _first;
    first
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let mut pending = Vec::new();
    let (status, _headers, body) = read_response(&mut first, &mut pending);
    assert_eq!(status, "HTTP/1.1 200 OK");
    assert_eq!(body, b"Hello");

    server.stop();
}

#[test]
fn unsupported_method_gets_400() {
    let server = start_server(|_| {});
    let mut stream = connect(server.port());

    stream
        .write_all(b"BREW /coffee HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    let mut pending = Vec::new();
    let (status, _headers, _body) = read_response(&mut stream, &mut pending);
    assert_eq!(status, "HTTP/1.1 400 Bad Request");
    expect_eof(&mut stream);
    server.stop();
}
