//! End-to-end tests over real sockets.
//!
//! The client side is plain `std::net::TcpStream` plus the response-mode
//! message parser, so assertions run against actual wire bytes.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use portside::{ConfigBuilder, Error, Request, Response, Server};
use portside_h1::{MessageParser, ParseEvent, ParseStep, ParserLimits};

// ── Client-side helpers ──────────────────────────────────────────

struct WireResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    raw: Vec<u8>,
}

impl WireResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn connect(server: &Server) -> TcpStream {
    let stream = TcpStream::connect(server.http_addr().unwrap()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
}

/// Read exactly one response off the stream.
fn read_response(stream: &mut TcpStream) -> WireResponse {
    let mut parser = MessageParser::response(ParserLimits::default());
    let mut raw = Vec::new();
    let mut status = 0u16;
    let mut headers = Vec::new();
    let mut body = Vec::new();
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        while !pending.is_empty() {
            match parser.next_event(&pending).unwrap() {
                ParseStep::Event { consumed, event } => {
                    match event {
                        ParseEvent::NewResponse(head) => {
                            status = head.status;
                            headers = head.headers.clone();
                        }
                        ParseEvent::BodyChunk { data, .. } => body.extend_from_slice(data),
                        ParseEvent::EndOfBody => {
                            pending.drain(..consumed);
                            return WireResponse {
                                status,
                                headers,
                                body,
                                raw,
                            };
                        }
                        ParseEvent::Trailers(_) | ParseEvent::NewRequest(_) | ParseEvent::Eof => {}
                    }
                    pending.drain(..consumed);
                }
                ParseStep::NeedMore { consumed } => {
                    pending.drain(..consumed);
                    break;
                }
            }
        }
        let n = stream.read(&mut buf).expect("read response");
        if n == 0 {
            match parser.on_eof().unwrap() {
                ParseEvent::EndOfBody | ParseEvent::Eof => {
                    return WireResponse {
                        status,
                        headers,
                        body,
                        raw,
                    };
                }
                _ => panic!("unexpected EOF event"),
            }
        }
        raw.extend_from_slice(&buf[..n]);
        pending.extend_from_slice(&buf[..n]);
    }
}

fn request(server: &Server, raw: &str) -> WireResponse {
    let mut stream = connect(server);
    stream.write_all(raw.as_bytes()).unwrap();
    read_response(&mut stream)
}

fn hello_server() -> Server {
    let config = ConfigBuilder::new().http_port(0).build().unwrap();
    Server::builder(config)
        .handler(|req: &mut Request, resp: &mut Response| {
            if req.path() != "/blah" {
                return Ok(false);
            }
            resp.write("Hello 0")?;
            Ok(true)
        })
        .start()
        .unwrap()
}

// ── Literal wire scenarios ───────────────────────────────────────

#[test]
fn fixed_length_hello() {
    let server = hello_server();
    let resp = request(&server, "GET /blah HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 200);
    assert!(resp.raw.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert_eq!(resp.header("content-length"), Some("7"));
    assert_eq!(resp.body, b"Hello 0");
    assert!(resp.header("date").is_some());
    server.stop(Duration::from_secs(2));
}

#[test]
fn header_only_handler_yields_204() {
    let config = ConfigBuilder::new().http_port(0).build().unwrap();
    let server = Server::builder(config)
        .handler(|_req: &mut Request, resp: &mut Response| {
            resp.header("hello", "world");
            Ok(true)
        })
        .start()
        .unwrap();

    let resp = request(&server, "GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 204);
    assert_eq!(resp.header("hello"), Some("world"));
    assert!(resp.header("content-length").is_none());
    assert!(resp.body.is_empty());
    server.stop(Duration::from_secs(2));
}

#[test]
fn not_modified_has_no_body() {
    let config = ConfigBuilder::new().http_port(0).build().unwrap();
    let server = Server::builder(config)
        .handler(|_req: &mut Request, resp: &mut Response| {
            resp.status(304);
            Ok(true)
        })
        .start()
        .unwrap();

    let resp = request(&server, "GET /?x=1 HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 304);
    assert!(resp.header("content-length").is_none());
    assert!(resp.body.is_empty());
    server.stop(Duration::from_secs(2));
}

#[test]
fn chunked_streaming_with_negotiated_trailer() {
    let config = ConfigBuilder::new().http_port(0).build().unwrap();
    let server = Server::builder(config)
        .handler(|_req: &mut Request, resp: &mut Response| {
            resp.set_trailer("server-timing", "total;dur=123.4");
            resp.header("trailer", "server-timing");
            resp.send_chunk("Hello")?;
            resp.send_chunk(" ")?;
            resp.send_chunk("world")?;
            Ok(true)
        })
        .start()
        .unwrap();

    let resp = request(
        &server,
        "GET / HTTP/1.1\r\nHost: x\r\nTE: trailers\r\n\r\n",
    );
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("transfer-encoding"), Some("chunked"));
    assert_eq!(resp.body, b"Hello world");
    let raw = String::from_utf8_lossy(&resp.raw);
    let trailer_pos = raw.find("server-timing: total;dur=123.4").expect("trailer");
    let last_chunk_pos = raw.rfind("0\r\n").expect("last chunk");
    assert!(trailer_pos > last_chunk_pos, "trailer after last chunk: {raw}");
    server.stop(Duration::from_secs(2));
}

#[test]
fn half_close_is_served_then_closed() {
    let server = hello_server();
    let mut stream = connect(&server);
    stream
        .write_all(b"GET /blah HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    // Client half-closes its write side while the response is in flight.
    stream.shutdown(std::net::Shutdown::Write).unwrap();

    let mut all = Vec::new();
    stream.read_to_end(&mut all).unwrap(); // server closes after responding
    let text = String::from_utf8_lossy(&all);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(text.ends_with("Hello 0"), "{text}");
    server.stop(Duration::from_secs(2));
}

#[test]
fn oversized_url_yields_414_and_closes() {
    let server = hello_server();
    let before = server.stats().invalid_http_requests;

    let long_path = format!("/{}", "a".repeat(8176));
    let mut stream = connect(&server);
    stream
        .write_all(format!("GET {long_path} HTTP/1.1\r\nHost: x\r\n\r\n").as_bytes())
        .unwrap();

    let mut all = Vec::new();
    stream.read_to_end(&mut all).unwrap(); // connection closed by server
    let text = String::from_utf8_lossy(&all);
    assert!(text.starts_with("HTTP/1.1 414 "), "{text}");
    assert_eq!(server.stats().invalid_http_requests, before + 1);
    server.stop(Duration::from_secs(2));
}

// ── Behavioural coverage ─────────────────────────────────────────

#[test]
fn unclaimed_request_gets_404_html_page() {
    let server = hello_server();
    let resp = request(&server, "GET /nope HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 404);
    assert_eq!(resp.header("content-type"), Some("text/html;charset=utf-8"));
    assert!(String::from_utf8_lossy(&resp.body).contains("<h1>404 Not Found</h1>"));
    server.stop(Duration::from_secs(2));
}

#[test]
fn head_gets_get_headers_and_empty_body() {
    let server = hello_server();
    let mut stream = connect(&server);
    stream
        .write_all(b"HEAD /blah HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let mut all = Vec::new();
    stream.read_to_end(&mut all).unwrap();
    let text = String::from_utf8_lossy(&all);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(text.contains("content-length: 7\r\n"), "{text}");
    assert!(text.ends_with("\r\n\r\n"), "HEAD body must be empty: {text}");
    server.stop(Duration::from_secs(2));
}

#[test]
fn request_body_round_trips_through_echo_handler() {
    let config = ConfigBuilder::new().http_port(0).build().unwrap();
    let server = Server::builder(config)
        .handler(|req: &mut Request, resp: &mut Response| {
            let body = req.read_body(1 << 20)?;
            resp.content_type("application/octet-stream");
            resp.write(body)?;
            Ok(true)
        })
        .start()
        .unwrap();

    let payload = "abcdefghij".repeat(1000);
    let raw = format!(
        "POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n{}",
        payload.len(),
        payload
    );
    let resp = request(&server, &raw);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, payload.as_bytes());
    server.stop(Duration::from_secs(2));
}

#[test]
fn chunked_request_body_with_trailers() {
    let config = ConfigBuilder::new().http_port(0).build().unwrap();
    let server = Server::builder(config)
        .handler(|req: &mut Request, resp: &mut Response| {
            let body = req.read_body(1 << 20)?;
            let trailer = req
                .body_mut()
                .trailers()
                .and_then(|t| t.get("x-sum"))
                .unwrap_or("none")
                .to_string();
            resp.header("echoed-trailer", trailer);
            resp.write(body)?;
            Ok(true)
        })
        .start()
        .unwrap();

    let raw = "POST /u HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
               3\r\nabc\r\n3\r\ndef\r\n0\r\nX-Sum: 42\r\n\r\n";
    let resp = request(&server, raw);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"abcdef");
    assert_eq!(resp.header("echoed-trailer"), Some("42"));
    server.stop(Duration::from_secs(2));
}

#[test]
fn keep_alive_serves_sequential_requests() {
    let server = hello_server();
    let mut stream = connect(&server);
    for _ in 0..3 {
        stream
            .write_all(b"GET /blah HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let resp = read_response(&mut stream);
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"Hello 0");
    }
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while server.stats().completed_requests < 3 {
        assert!(std::time::Instant::now() < deadline, "requests never counted");
        std::thread::sleep(Duration::from_millis(5));
    }
    server.stop(Duration::from_secs(2));
}

#[test]
fn async_handle_streams_and_completes_from_another_thread() {
    let config = ConfigBuilder::new().http_port(0).build().unwrap();
    let server = Server::builder(config)
        .handler(|req: &mut Request, _resp: &mut Response| {
            let handle = req.handle_async();
            std::thread::spawn(move || {
                handle.write_blocking("Hello").unwrap();
                handle.write_blocking(" world").unwrap();
                handle.complete();
                handle.complete(); // idempotent
            });
            Ok(true)
        })
        .start()
        .unwrap();

    let resp = request(&server, "GET /async HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("transfer-encoding"), Some("chunked"));
    assert_eq!(resp.body, b"Hello world");
    server.stop(Duration::from_secs(2));
}

#[test]
fn async_cancel_returns_503_with_retry_after() {
    let config = ConfigBuilder::new().http_port(0).build().unwrap();
    let server = Server::builder(config)
        .handler(|req: &mut Request, _resp: &mut Response| {
            let handle = req.handle_async();
            handle.cancel(Some(Duration::from_secs(7)));
            Ok(true)
        })
        .start()
        .unwrap();

    let mut stream = connect(&server);
    stream
        .write_all(b"GET /c HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let mut all = Vec::new();
    stream.read_to_end(&mut all).unwrap();
    let text = String::from_utf8_lossy(&all);
    assert!(text.starts_with("HTTP/1.1 503 "), "{text}");
    assert!(text.contains("retry-after: 7\r\n"), "{text}");
    server.stop(Duration::from_secs(2));
}

#[test]
fn route_handler_captures_params() {
    let config = ConfigBuilder::new().http_port(0).build().unwrap();
    let server = Server::builder(config)
        .route(Some(portside::Method::Get), "/widgets/{id: [0-9]+}", |_req, resp, params| {
            let id = params.get("id").unwrap_or("?").to_string();
            resp.write(format!("widget {id}"))?;
            Ok(())
        })
        .unwrap()
        .start()
        .unwrap();

    let resp = request(&server, "GET /widgets/42 HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"widget 42");

    let resp = request(&server, "GET /widgets/nope HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 404);
    server.stop(Duration::from_secs(2));
}

#[test]
fn completion_listener_observes_exactly_one_terminal() {
    let fired = Arc::new(AtomicBool::new(false));
    let fired_in_handler = Arc::clone(&fired);
    let config = ConfigBuilder::new().http_port(0).build().unwrap();
    let server = Server::builder(config)
        .handler(move |_req: &mut Request, resp: &mut Response| {
            let fired = Arc::clone(&fired_in_handler);
            resp.on_complete(Box::new(move |outcome| {
                assert_eq!(outcome.state, portside::ExchangeState::Complete);
                assert!(!fired.swap(true, Ordering::SeqCst), "listener fired twice");
            }));
            resp.write("ok")?;
            Ok(true)
        })
        .start()
        .unwrap();

    let resp = request(&server, "GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 200);
    // The listener runs on the driver after the response is flushed.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !fired.load(Ordering::SeqCst) {
        assert!(std::time::Instant::now() < deadline, "listener never fired");
        std::thread::sleep(Duration::from_millis(5));
    }
    server.stop(Duration::from_secs(2));
}

#[test]
fn graceful_stop_finishes_inflight_exchange() {
    let config = ConfigBuilder::new().http_port(0).build().unwrap();
    let server = Server::builder(config)
        .handler(|_req: &mut Request, resp: &mut Response| {
            std::thread::sleep(Duration::from_millis(300));
            resp.write("slow but done")?;
            Ok(true)
        })
        .start()
        .unwrap();

    let mut stream = connect(&server);
    stream
        .write_all(b"GET /slow HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    // Give the request time to reach the handler, then stop gracefully.
    std::thread::sleep(Duration::from_millis(100));

    let reader = std::thread::spawn(move || {
        let mut all = Vec::new();
        stream.read_to_end(&mut all).unwrap();
        all
    });

    server.stop(Duration::from_secs(5));
    let all = reader.join().unwrap();
    let text = String::from_utf8_lossy(&all);
    assert!(text.contains("slow but done"), "{text}");
}

#[test]
fn stats_track_connections_and_bytes() {
    let server = hello_server();
    let resp = request(&server, "GET /blah HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 200);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stats = server.stats();
        if stats.completed_requests == 1 {
            assert!(stats.bytes_read > 0);
            assert!(stats.bytes_sent > 0);
            assert_eq!(stats.invalid_http_requests, 0);
            break;
        }
        assert!(std::time::Instant::now() < deadline, "stats never settled");
        std::thread::sleep(Duration::from_millis(5));
    }
    server.stop(Duration::from_secs(2));
}

#[test]
fn handler_error_after_status_is_mapped() {
    let config = ConfigBuilder::new().http_port(0).build().unwrap();
    let server = Server::builder(config)
        .handler(|_req: &mut Request, _resp: &mut Response| -> Result<bool, Error> {
            Err(Error::with_status(418, "short and stout"))
        })
        .start()
        .unwrap();

    let resp = request(&server, "GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 418);
    assert!(String::from_utf8_lossy(&resp.body).contains("short and stout"));
    server.stop(Duration::from_secs(2));
}
