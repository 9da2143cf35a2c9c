//! Minimal server: a route with a capture, a streaming endpoint, and an
//! async endpoint completed from another thread.
//!
//! ```sh
//! cargo run --example hello
//! curl -i http://127.0.0.1:8080/hello/world
//! curl -i http://127.0.0.1:8080/stream
//! curl -i http://127.0.0.1:8080/later
//! ```

use std::time::Duration;

use portside::{ConfigBuilder, Method, Request, Response, Server};

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let config = ConfigBuilder::new()
        .http_port(8080)
        .idle_timeout(Duration::from_secs(60))
        .build()
        .expect("valid config");

    let server = Server::builder(config)
        .route(Some(Method::Get), "/hello/{name}", |_req, resp, params| {
            let name = params.get("name").unwrap_or("stranger");
            resp.content_type("text/plain");
            resp.write(format!("hello, {name}\n"))?;
            Ok(())
        })
        .expect("valid route")
        .handler(|req: &mut Request, resp: &mut Response| {
            if req.path() != "/stream" {
                return Ok(false);
            }
            resp.content_type("text/plain");
            for i in 0..5 {
                resp.send_chunk(format!("chunk {i}\n"))?;
            }
            Ok(true)
        })
        .handler(|req: &mut Request, _resp: &mut Response| {
            if req.path() != "/later" {
                return Ok(false);
            }
            let handle = req.handle_async();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(250));
                let _ = handle.write_blocking("worth the wait\n");
                handle.complete();
            });
            Ok(true)
        })
        .start()
        .expect("server starts");

    println!("listening on http://{}", server.http_addr().unwrap());

    // Serve until interrupted.
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
