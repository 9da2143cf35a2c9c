//! HTTP/2 connection driver.
//!
//! Pumps a sans-IO [`portside_h2::ServerConnection`]: socket bytes feed
//! the frame layer, frame-layer events become exchanges, and response
//! commands from any number of concurrent exchanges are mapped back onto
//! streams. Flow control composes end to end: body acknowledgements from
//! handlers turn into `release_capacity` (and thence WINDOW_UPDATE), and
//! chunk acknowledgements to handlers are withheld while a stream's
//! outbound queue is saturated, so a slow client stalls only its own
//! stream's producer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use portside_h2::hpack::HeaderField;
use portside_h2::{ErrorCode, ServerConnection, ServerEvent, Settings};

use portside_h1::{HeaderList, Method, Version, date, parser::decode_path};

use crate::config::BodyTooLargeAction;
use crate::conn::ConnCtx;
use crate::error::Error;
use crate::exchange::{
    BodyEvent, BodyReader, Exchange, ExchangeId, ExchangeShared, ExchangeState, ResponseCmd,
};
use crate::headers::HeaderMap;
use crate::request::{Protocol, Request};
use crate::response::{Response, error_page};

const READ_CHUNK: usize = 16 * 1024;

/// Delay chunk acknowledgements while a stream has this much data queued
/// behind the peer's flow-control window.
const OUTBOUND_WATERMARK: usize = 128 * 1024;

pub(crate) async fn drive(mut io: crate::tls::ServerStream, ctx: ConnCtx) {
    ctx.info.set_protocol(Protocol::Http2);
    if let Err(err) = run(&mut io, &ctx).await {
        debug!(conn = ctx.info.id, error = %err, "h2 connection ended with error");
    }
    let _ = io.shutdown().await;
}

/// Driver-side state for one stream's exchange.
struct StreamCtx {
    exchange: Exchange,
    body_tx: mpsc::UnboundedSender<BodyEvent>,
    shared: Arc<ExchangeShared>,
    is_head: bool,
    te_trailers: bool,
    response_done: bool,
    body_bytes: u64,
}

async fn run(io: &mut crate::tls::ServerStream, ctx: &ConnCtx) -> Result<(), Error> {
    let mut settings = Settings::server_default();
    settings.max_concurrent_streams = Some(ctx.config.h2_max_concurrent_streams);
    settings.max_header_list_size = Some(ctx.config.max_headers_size as u32);
    let mut conn = ServerConnection::new(settings);
    flush(io, ctx, &mut conn).await?;

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<(ExchangeId, ResponseCmd)>();
    let (release_tx, mut release_rx) = mpsc::unbounded_channel::<(ExchangeId, u32)>();
    let mut streams: HashMap<ExchangeId, StreamCtx> = HashMap::new();
    let mut pending_acks: Vec<(ExchangeId, oneshot::Sender<Result<(), Error>>)> = Vec::new();
    let mut draining = ctx.draining.clone();
    let mut goaway_sent = false;
    let mut last_activity = Instant::now();

    enum Act {
        Cmd(Option<(ExchangeId, ResponseCmd)>),
        Release(ExchangeId, u32),
        Read(Result<Result<usize, Error>, tokio::time::error::Elapsed>),
        Drain,
    }

    loop {
        if goaway_sent && conn.is_drained() && streams.is_empty() {
            return Ok(());
        }

        let awaiting_body = streams.values().any(|s| !s.exchange.request_is_complete());
        let read_deadline = if !streams.is_empty() && awaiting_body {
            ctx.config.request_read_timeout
        } else {
            ctx.config.idle_timeout
        };
        let mut tmp = [0u8; READ_CHUNK];

        let act = tokio::select! {
            biased;
            cmd = cmd_rx.recv() => Act::Cmd(cmd),
            Some((id, n)) = release_rx.recv() => Act::Release(id, n),
            _ = draining.changed(), if !goaway_sent => Act::Drain,
            r = tokio::time::timeout(read_deadline, io.read(&mut tmp)) => Act::Read(r),
        };

        match act {
            Act::Drain => {
                goaway_sent = true;
                conn.graceful_shutdown();
                flush(io, ctx, &mut conn).await?;
            }
            Act::Release(id, n) => {
                conn.release_capacity(id as u32, n);
                flush(io, ctx, &mut conn).await?;
            }
            Act::Cmd(None) => {
                // Unreachable: the driver keeps its own sender alive.
            }
            Act::Cmd(Some((id, cmd))) => {
                handle_cmd(ctx, &mut conn, &mut streams, &mut pending_acks, id, cmd);
                last_activity = Instant::now();
                flush(io, ctx, &mut conn).await?;
            }
            Act::Read(Err(_elapsed)) => {
                if streams.is_empty() {
                    // Idle connection: GOAWAY and leave.
                    conn.graceful_shutdown();
                    let _ = flush(io, ctx, &mut conn).await;
                    return Ok(());
                }
                if awaiting_body {
                    ctx.stats.on_timed_out();
                    timeout_waiting_streams(ctx, &mut conn, &mut streams);
                    let _ = flush(io, ctx, &mut conn).await;
                    return Ok(());
                }
                if last_activity.elapsed() >= ctx.config.idle_timeout {
                    ctx.stats.on_timed_out();
                    cancel_all(ctx, &mut streams, ExchangeState::TimedOut);
                    let _ = flush(io, ctx, &mut conn).await;
                    return Ok(());
                }
            }
            Act::Read(Ok(Ok(0))) => {
                cancel_all(ctx, &mut streams, ExchangeState::ClientDisconnected);
                return Ok(());
            }
            Act::Read(Ok(Ok(n))) => {
                ctx.stats.on_bytes_read(n as u64);
                last_activity = Instant::now();
                if let Err(err) = conn.recv(&tmp[..n]) {
                    warn!(conn = ctx.info.id, error = %err, "h2 protocol error");
                    let _ = flush(io, ctx, &mut conn).await;
                    cancel_all(ctx, &mut streams, ExchangeState::Errored);
                    return Ok(());
                }
                drain_events(ctx, &mut conn, &mut streams, &cmd_tx, &release_tx);
                flush(io, ctx, &mut conn).await?;
            }
            Act::Read(Ok(Err(err))) => {
                cancel_all(ctx, &mut streams, ExchangeState::ClientDisconnected);
                return Err(err);
            }
        }

        // Chunk acknowledgements held back for flow control: release the
        // ones whose stream drained below the watermark.
        if !pending_acks.is_empty() {
            let mut keep = Vec::with_capacity(pending_acks.len());
            for (id, ack) in pending_acks.drain(..) {
                if conn.outbound_buffered(id as u32) > OUTBOUND_WATERMARK {
                    keep.push((id, ack));
                } else {
                    let _ = ack.send(Ok(()));
                }
            }
            pending_acks = keep;
        }
    }
}

/// Turn frame-layer events into exchanges and body events.
fn drain_events(
    ctx: &ConnCtx,
    conn: &mut ServerConnection,
    streams: &mut HashMap<ExchangeId, StreamCtx>,
    cmd_tx: &mpsc::UnboundedSender<(ExchangeId, ResponseCmd)>,
    release_tx: &mpsc::UnboundedSender<(ExchangeId, u32)>,
) {
    while let Some(event) = conn.poll_event() {
        match event {
            ServerEvent::HandshakeComplete => {}
            ServerEvent::RequestHeaders {
                stream_id,
                fields,
                end_stream,
            } => {
                open_stream(
                    ctx, conn, streams, cmd_tx, release_tx, stream_id, fields, end_stream,
                );
            }
            ServerEvent::Data {
                stream_id,
                data,
                flow_len,
                end_stream,
            } => {
                let id = stream_id as ExchangeId;
                let Some(stream) = streams.get_mut(&id) else {
                    conn.release_capacity(stream_id, flow_len);
                    continue;
                };
                stream.body_bytes += data.len() as u64;
                if stream.body_bytes > ctx.config.max_request_size {
                    ctx.stats.on_invalid_request();
                    let _ = stream.body_tx.send(BodyEvent::Error(Error::InvalidRequest {
                        status: 413,
                        detail: "request body too large".into(),
                    }));
                    if ctx.config.body_too_large_action == BodyTooLargeAction::SendResponse
                        && !stream.exchange.response_started()
                    {
                        respond_error_page(conn, stream_id, 413, "The request body exceeds the limit.");
                        stream.exchange.on_response_headers_sent();
                    }
                    conn.reset_stream(stream_id, ErrorCode::Cancel);
                    conn.release_capacity(stream_id, flow_len);
                    finish_stream(ctx, streams.remove(&id).expect("present"), ExchangeState::Errored);
                    continue;
                }
                stream.exchange.on_request_body_streaming();
                let _ = stream.body_tx.send(BodyEvent::Chunk {
                    data: data.into(),
                    flow: flow_len,
                });
                if end_stream {
                    stream.exchange.on_request_complete();
                    let _ = stream.body_tx.send(BodyEvent::End);
                    maybe_finish_complete(ctx, streams, id);
                }
            }
            ServerEvent::Trailers { stream_id, fields } => {
                let id = stream_id as ExchangeId;
                if let Some(stream) = streams.get_mut(&id) {
                    let trailers: HeaderList = fields
                        .into_iter()
                        .map(|f| {
                            (
                                String::from_utf8_lossy(&f.name).into_owned(),
                                String::from_utf8_lossy(&f.value).into_owned(),
                            )
                        })
                        .collect();
                    let _ = stream.body_tx.send(BodyEvent::Trailers(trailers));
                    stream.exchange.on_request_complete();
                    let _ = stream.body_tx.send(BodyEvent::End);
                    maybe_finish_complete(ctx, streams, id);
                }
            }
            ServerEvent::HeaderListTooLarge { stream_id, .. } => {
                ctx.stats.on_invalid_request();
                respond_error_page(conn, stream_id, 431, "Request header fields too large.");
                conn.reset_stream(stream_id, ErrorCode::Cancel);
            }
            ServerEvent::StreamRefused { .. } => {
                ctx.stats.on_rejected_overload();
            }
            ServerEvent::StreamReset { stream_id, .. } => {
                if let Some(stream) = streams.remove(&(stream_id as ExchangeId)) {
                    let _ = stream
                        .body_tx
                        .send(BodyEvent::Error(Error::ClientDisconnected));
                    finish_stream(ctx, stream, ExchangeState::ClientDisconnected);
                }
            }
            ServerEvent::GoAway { .. } => {
                // The client stops opening streams; existing ones finish.
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn open_stream(
    ctx: &ConnCtx,
    conn: &mut ServerConnection,
    streams: &mut HashMap<ExchangeId, StreamCtx>,
    cmd_tx: &mpsc::UnboundedSender<(ExchangeId, ResponseCmd)>,
    release_tx: &mpsc::UnboundedSender<(ExchangeId, u32)>,
    stream_id: u32,
    fields: Vec<HeaderField>,
    end_stream: bool,
) {
    let mut method: Option<Method> = None;
    let mut raw_path: Option<Vec<u8>> = None;
    let mut authority: Option<String> = None;
    let mut headers = HeaderMap::new();

    for field in fields {
        match field.name.as_slice() {
            b":method" => method = Method::from_bytes(&field.value),
            b":path" => raw_path = Some(field.value),
            b":authority" => {
                authority = Some(String::from_utf8_lossy(&field.value).into_owned())
            }
            b":scheme" => {}
            name if name.starts_with(b":") => {}
            _ => headers.add(
                String::from_utf8_lossy(&field.name).into_owned(),
                String::from_utf8_lossy(&field.value).into_owned(),
            ),
        }
    }

    let Some(method) = method else {
        ctx.stats.on_invalid_request();
        respond_error_page(conn, stream_id, 405, "Method not supported.");
        if !end_stream {
            conn.reset_stream(stream_id, ErrorCode::Cancel);
        }
        return;
    };
    let Some(raw_path) = raw_path else {
        ctx.stats.on_invalid_request();
        respond_error_page(conn, stream_id, 400, "Missing :path.");
        if !end_stream {
            conn.reset_stream(stream_id, ErrorCode::Cancel);
        }
        return;
    };

    let (path_bytes, query) = match raw_path.iter().position(|&b| b == b'?') {
        Some(q) => (
            &raw_path[..q],
            Some(String::from_utf8_lossy(&raw_path[q + 1..]).into_owned()),
        ),
        None => (&raw_path[..], None),
    };
    let path = decode_path(path_bytes);

    if let Some(host) = authority {
        if !headers.contains("host") {
            headers.set("host", host);
        }
    }

    let id = stream_id as ExchangeId;
    let te_trailers = headers.has_token("te", "trailers");
    let is_head = method == Method::Head;

    let (body_tx, body_rx) = mpsc::unbounded_channel();
    let shared = ExchangeShared::new(id, cmd_tx.clone());
    let mut exchange = Exchange::new(Arc::clone(&shared));
    let reader = BodyReader::new(body_rx, release_tx.clone(), id);

    if end_stream {
        exchange.on_request_complete();
        let _ = body_tx.send(BodyEvent::End);
    } else {
        exchange.on_request_body_streaming();
    }

    let request = Request::new(
        method,
        path,
        query,
        Version::Http2,
        Protocol::Http2,
        headers,
        reader,
        ctx.info.remote_addr,
        Arc::clone(&shared),
        ctx.exec.clone(),
    );
    let response = Response::new(Arc::clone(&shared));

    ctx.stats.on_request_started();
    ctx.info.on_request_started();

    let dispatch_ctx = Arc::clone(&ctx.dispatch);
    if ctx
        .exec
        .submit(Box::new(move || {
            crate::handler::dispatch(&dispatch_ctx, request, response);
        }))
        .is_err()
    {
        ctx.stats.on_rejected_overload();
        respond_error_page(conn, stream_id, 503, "The server is overloaded.");
        if !end_stream {
            conn.reset_stream(stream_id, ErrorCode::RefusedStream);
        }
        if exchange.finish(ExchangeState::Errored, Some("overloaded".into())) {
            ctx.stats.on_request_ended();
            ctx.info.on_request_ended();
        }
        return;
    }

    streams.insert(
        id,
        StreamCtx {
            exchange,
            body_tx,
            shared,
            is_head,
            te_trailers,
            response_done: false,
            body_bytes: 0,
        },
    );
}

fn strips_body(status: u16) -> bool {
    status == 204 || status == 304 || (100..200).contains(&status)
}

/// Map one response command onto the stream.
fn handle_cmd(
    ctx: &ConnCtx,
    conn: &mut ServerConnection,
    streams: &mut HashMap<ExchangeId, StreamCtx>,
    pending_acks: &mut Vec<(ExchangeId, oneshot::Sender<Result<(), Error>>)>,
    id: ExchangeId,
    cmd: ResponseCmd,
) {
    let stream_id = id as u32;
    // Copy what the command needs out of the stream entry so removals
    // below don't fight the borrow.
    let Some((is_head, te_trailers, response_done, response_started, shared)) =
        streams.get(&id).map(|s| {
            (
                s.is_head,
                s.te_trailers,
                s.response_done,
                s.exchange.response_started(),
                Arc::clone(&s.shared),
            )
        })
    else {
        // Stream already reset; unblock any writer.
        if let ResponseCmd::Chunk { ack: Some(ack), .. } = cmd {
            let _ = ack.send(Err(Error::ClientDisconnected));
        }
        return;
    };

    match cmd {
        ResponseCmd::Full {
            status,
            headers,
            body,
        } => {
            let suppress = is_head || strips_body(status);
            let mut headers = HeaderMap::from(headers);
            if strips_body(status) {
                headers.remove("content-length");
            } else {
                headers.set("content-length", body.len().to_string());
            }
            let trailers = shared.trailers.lock().expect("trailer lock").clone();
            let send_trailers = te_trailers && !trailers.is_empty() && !suppress;
            let end_on_headers = (suppress || body.is_empty()) && !send_trailers;

            let fields = response_fields(status, &headers);
            if conn.send_headers(stream_id, &fields, end_on_headers).is_err() {
                if let Some(stream) = streams.remove(&id) {
                    finish_stream(ctx, stream, ExchangeState::ClientDisconnected);
                }
                return;
            }
            if !suppress && !body.is_empty() {
                let _ = conn.send_data(stream_id, body.to_vec(), !send_trailers);
            }
            if send_trailers {
                let _ = conn.send_trailers(stream_id, trailer_fields(&trailers));
            }
            if let Some(stream) = streams.get_mut(&id) {
                stream.exchange.on_response_headers_sent();
                stream.response_done = true;
            }
            maybe_finish_complete(ctx, streams, id);
        }
        ResponseCmd::Start { status, headers } => {
            let suppress = is_head || strips_body(status);
            let mut headers = HeaderMap::from(headers);
            if strips_body(status) {
                headers.remove("content-length");
            }
            let fields = response_fields(status, &headers);
            if conn.send_headers(stream_id, &fields, suppress).is_err() {
                if let Some(stream) = streams.remove(&id) {
                    finish_stream(ctx, stream, ExchangeState::ClientDisconnected);
                }
                return;
            }
            if let Some(stream) = streams.get_mut(&id) {
                stream.exchange.on_response_headers_sent();
                if suppress {
                    stream.response_done = true;
                }
            }
            if suppress {
                maybe_finish_complete(ctx, streams, id);
            }
        }
        ResponseCmd::Chunk { data, ack } => {
            if response_done {
                // HEAD/204/304: body writes are no-ops at the socket.
                if let Some(ack) = ack {
                    let _ = ack.send(Ok(()));
                }
                return;
            }
            if let Some(stream) = streams.get_mut(&id) {
                stream.exchange.on_response_body_streaming();
            }
            if conn.send_data(stream_id, data.to_vec(), false).is_err() {
                if let Some(ack) = ack {
                    let _ = ack.send(Err(Error::ClientDisconnected));
                }
                if let Some(stream) = streams.remove(&id) {
                    finish_stream(ctx, stream, ExchangeState::ClientDisconnected);
                }
                return;
            }
            if let Some(ack) = ack {
                if conn.outbound_buffered(stream_id) > OUTBOUND_WATERMARK {
                    pending_acks.push((id, ack));
                } else {
                    let _ = ack.send(Ok(()));
                }
            }
        }
        ResponseCmd::Complete {
            error,
            status,
            headers,
        } => {
            if let Some(err) = error {
                if response_started {
                    conn.reset_stream(stream_id, ErrorCode::InternalError);
                } else {
                    respond_error_page(conn, stream_id, err.response_status(), &err.to_string());
                }
                if let Some(stream) = streams.remove(&id) {
                    finish_stream(ctx, stream, ExchangeState::Errored);
                }
                return;
            }

            if !response_started {
                // Nothing written: 204 default (or the status the handler
                // set) with its headers.
                let status = status.unwrap_or(204);
                let mut headers = HeaderMap::from(headers);
                headers.remove("content-length");
                let fields = response_fields(status, &headers);
                let _ = conn.send_headers(stream_id, &fields, true);
            } else if !response_done {
                let trailers = shared.trailers.lock().expect("trailer lock").clone();
                if te_trailers && !trailers.is_empty() && !is_head {
                    let _ = conn.send_trailers(stream_id, trailer_fields(&trailers));
                } else {
                    let _ = conn.send_data(stream_id, Vec::new(), true);
                }
            }
            if let Some(stream) = streams.get_mut(&id) {
                stream.exchange.on_response_headers_sent();
                stream.response_done = true;
            }
            maybe_finish_complete(ctx, streams, id);
        }
        ResponseCmd::Cancel { retry_after_secs } => {
            if !response_started {
                let mut headers = HeaderMap::new();
                headers.set("content-type", "text/html;charset=utf-8");
                if let Some(secs) = retry_after_secs {
                    headers.set("retry-after", secs.to_string());
                }
                let page = error_page(503, "The request was cancelled.");
                headers.set("content-length", page.len().to_string());
                let fields = response_fields(503, &headers);
                if conn.send_headers(stream_id, &fields, false).is_ok() {
                    let _ = conn.send_data(stream_id, page.into_bytes(), true);
                }
            } else {
                conn.reset_stream(stream_id, ErrorCode::Cancel);
            }
            if let Some(stream) = streams.remove(&id) {
                finish_stream(ctx, stream, ExchangeState::Errored);
            }
        }
    }
}

/// Remove and finish a stream whose response is done, once the request
/// side is also complete (or will never complete meaningfully).
fn maybe_finish_complete(
    ctx: &ConnCtx,
    streams: &mut HashMap<ExchangeId, StreamCtx>,
    id: ExchangeId,
) {
    let done = streams
        .get(&id)
        .map(|s| s.response_done)
        .unwrap_or(false);
    if done {
        let stream = streams.remove(&id).expect("present");
        finish_stream(ctx, stream, ExchangeState::Complete);
    }
}

fn finish_stream(ctx: &ConnCtx, mut stream: StreamCtx, state: ExchangeState) {
    if state != ExchangeState::Complete {
        let _ = stream.body_tx.send(BodyEvent::Error(match state {
            ExchangeState::TimedOut => Error::TimedOut { status: 408 },
            ExchangeState::ClientDisconnected => Error::ClientDisconnected,
            _ => Error::Internal("exchange failed".into()),
        }));
    }
    if stream.exchange.finish(state, None) {
        ctx.stats.on_request_ended();
        ctx.info.on_request_ended();
    }
}

fn cancel_all(ctx: &ConnCtx, streams: &mut HashMap<ExchangeId, StreamCtx>, state: ExchangeState) {
    for (_, stream) in streams.drain() {
        finish_stream(ctx, stream, state);
    }
}

/// 408 every stream still waiting for request-body bytes, then the caller
/// closes the connection.
fn timeout_waiting_streams(
    ctx: &ConnCtx,
    conn: &mut ServerConnection,
    streams: &mut HashMap<ExchangeId, StreamCtx>,
) {
    let waiting: Vec<ExchangeId> = streams
        .iter()
        .filter(|(_, s)| !s.exchange.request_is_complete())
        .map(|(id, _)| *id)
        .collect();
    for id in waiting {
        let Some(stream) = streams.remove(&id) else {
            continue;
        };
        if !stream.exchange.response_started() {
            respond_error_page(conn, id as u32, 408, "Timed out waiting for the request body.");
        }
        conn.reset_stream(id as u32, ErrorCode::Cancel);
        finish_stream(ctx, stream, ExchangeState::TimedOut);
    }
    cancel_all(ctx, streams, ExchangeState::TimedOut);
}

/// `:status` + date + regular headers, hop-by-hop fields dropped.
fn response_fields(status: u16, headers: &HeaderMap) -> Vec<HeaderField> {
    let mut fields = vec![HeaderField::new(
        b":status".as_slice(),
        status.to_string().into_bytes(),
    )];
    if !headers.contains("date") {
        fields.push(HeaderField::new(b"date".as_slice(), date::now().into_bytes()));
    }
    for (name, value) in headers.iter() {
        if matches!(name, "connection" | "keep-alive" | "transfer-encoding" | "upgrade") {
            continue;
        }
        fields.push(HeaderField::new(
            name.as_bytes().to_vec(),
            value.as_bytes().to_vec(),
        ));
    }
    fields
}

fn trailer_fields(trailers: &HeaderList) -> Vec<HeaderField> {
    trailers
        .iter()
        .map(|(n, v)| HeaderField::new(n.as_bytes().to_vec(), v.as_bytes().to_vec()))
        .collect()
}

/// Emit a complete minimal error response on a stream.
fn respond_error_page(conn: &mut ServerConnection, stream_id: u32, status: u16, detail: &str) {
    let page = error_page(status, detail);
    let mut headers = HeaderMap::new();
    headers.set("content-type", "text/html;charset=utf-8");
    headers.set("content-length", page.len().to_string());
    let fields = response_fields(status, &headers);
    if conn.send_headers(stream_id, &fields, false).is_ok() {
        let _ = conn.send_data(stream_id, page.into_bytes(), true);
    }
}

/// Ship everything the frame layer queued.
async fn flush(
    io: &mut crate::tls::ServerStream,
    ctx: &ConnCtx,
    conn: &mut ServerConnection,
) -> Result<(), Error> {
    if !conn.has_pending_send() {
        return Ok(());
    }
    let data = conn.take_pending_send();
    match tokio::time::timeout(ctx.config.response_write_timeout, io.write_all(&data)).await {
        Ok(Ok(())) => {
            ctx.stats.on_bytes_sent(data.len() as u64);
            Ok(())
        }
        Ok(Err(err)) => Err(err),
        Err(_) => {
            ctx.stats.on_timed_out();
            Err(Error::TimedOut { status: 504 })
        }
    }
}
