//! HTTP/1.1 connection driver.
//!
//! One task per connection: it owns the socket, the parser, and the
//! response writer, and serves exchanges strictly one at a time
//! (pipelined request bytes wait in the cursor until the current exchange
//! finishes). Handler output arrives as response commands; request body
//! bytes leave as body events. Every await is serviced by this loop, so
//! nothing about one exchange ever runs concurrently with itself.

use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use portside_h1::{
    BodyKind, BodyWriteOutcome, HeaderList, MessageParser, Method, ParseEvent, ParseStep,
    ParserLimits, RequestHead, ResponseWriter, Version, WriterState, reason_phrase,
};

use crate::config::BodyTooLargeAction;
use crate::conn::ConnCtx;
use crate::cursor::ByteCursor;
use crate::error::Error;
use crate::exchange::{BodyEvent, BodyReader, Exchange, ExchangeShared, ExchangeState, ResponseCmd};
use crate::headers::HeaderMap;
use crate::request::{Protocol, Request};
use crate::response::{Response, error_page};

const READ_CHUNK: usize = 8 * 1024;

/// Pause socket reads once this many body bytes sit unacknowledged.
const UNACKED_WATERMARK: u64 = 128 * 1024;

pub(crate) async fn drive(mut io: crate::tls::ServerStream, ctx: ConnCtx) {
    ctx.info.set_protocol(Protocol::Http1);
    if let Err(err) = run(&mut io, &ctx).await {
        debug!(conn = ctx.info.id, error = %err, "connection ended with error");
    }
    let _ = io.shutdown().await;
}

enum Next {
    KeepAlive,
    Close,
}

async fn run(io: &mut crate::tls::ServerStream, ctx: &ConnCtx) -> Result<(), Error> {
    let limits = ParserLimits {
        max_url_size: ctx.config.max_url_size,
        max_headers_size: ctx.config.max_headers_size,
    };
    let mut parser = MessageParser::request(limits);
    let mut cursor = ByteCursor::with_capacity(ctx.config.read_buffer_size().max(READ_CHUNK));
    let mut draining = ctx.draining.clone();
    let mut served: u64 = 0;

    loop {
        // ── Await the next request head ─────────────────────────────
        let head = loop {
            let mut found: Option<Box<RequestHead>> = None;
            loop {
                match parser.next_event(cursor.unread()) {
                    Ok(ParseStep::Event { consumed, event }) => {
                        let is_head = matches!(event, ParseEvent::NewRequest(_));
                        if let ParseEvent::NewRequest(h) = event {
                            found = Some(h);
                        }
                        cursor.consume(consumed);
                        if is_head {
                            break;
                        }
                        // Leftover EndOfBody from the previous message.
                    }
                    Ok(ParseStep::NeedMore { consumed }) => {
                        cursor.consume(consumed);
                        break;
                    }
                    Err(err) => {
                        ctx.stats.on_invalid_request();
                        return respond_canned(io, ctx, err.status, err.message).await;
                    }
                }
            }
            if let Some(head) = found {
                break head;
            }

            let mut tmp = [0u8; READ_CHUNK];
            let spare = cursor_space(&mut cursor).min(READ_CHUNK);
            let read = tokio::select! {
                biased;
                _ = draining.changed() => None,
                r = tokio::time::timeout(ctx.config.idle_timeout, io.read(&mut tmp[..spare])) => Some(r),
            };
            match read {
                None => {
                    // Graceful shutdown: leave immediately when idle,
                    // otherwise finish parsing the in-flight request.
                    if parser.is_idle() && cursor.is_empty() {
                        return Ok(());
                    }
                }
                Some(Err(_)) => {
                    // Idle deadline. A partially received head gets a 408;
                    // an idle keep-alive connection just closes.
                    if parser.is_idle() && cursor.is_empty() {
                        return Ok(());
                    }
                    ctx.stats.on_timed_out();
                    return respond_canned(io, ctx, 408, "request timed out").await;
                }
                Some(Ok(Ok(0))) => return Ok(()),
                Some(Ok(Ok(n))) => {
                    ctx.stats.on_bytes_read(n as u64);
                    push_into_cursor(&mut cursor, &tmp[..n]);
                }
                Some(Ok(Err(err))) => return Err(err),
            }
        };

        served += 1;

        // ── Pre-dispatch screens ────────────────────────────────────
        if let Some(reject) = head.reject {
            ctx.stats.on_invalid_request();
            let status = reject.status();
            let detail = match status {
                405 => "method not supported",
                414 => "request target too long",
                _ => "request header fields too large",
            };
            return respond_canned(io, ctx, status, detail).await;
        }

        if let Some(target) = head.redirect {
            // Authority-form target: point the client at the relative form.
            if head.body != BodyKind::None {
                return respond_canned(io, ctx, 400, "redirect with body").await;
            }
            let mut writer = ResponseWriter::new();
            let mut out = BytesMut::new();
            let mut headers: HeaderList = vec![("location".into(), target)];
            let _ = writer.write_full(&mut out, 301, &mut headers, b"");
            write_out(io, ctx, &mut out).await?;
            continue;
        }

        if head.websocket_upgrade {
            // The frame layer lives outside the core.
            return respond_canned(io, ctx, 501, "websocket upgrade not supported").await;
        }

        match serve_exchange(io, ctx, &mut parser, &mut cursor, *head, served, &mut draining)
            .await?
        {
            Next::KeepAlive => continue,
            Next::Close => return Ok(()),
        }
    }
}

/// Owned copy of one parser event, so the cursor can be consumed while
/// the event is still in hand.
enum OwnedEvent {
    Chunk(Bytes),
    Trailers(HeaderList),
    End,
    Skip,
}

#[allow(clippy::too_many_arguments)]
async fn serve_exchange(
    io: &mut crate::tls::ServerStream,
    ctx: &ConnCtx,
    parser: &mut MessageParser,
    cursor: &mut ByteCursor,
    head: RequestHead,
    served: u64,
    draining: &mut tokio::sync::watch::Receiver<bool>,
) -> Result<Next, Error> {
    let config = Arc::clone(&ctx.config);
    let headers = HeaderMap::from(head.headers);
    let te_trailers = headers.has_token("te", "trailers");
    let is_head = head.method == Method::Head;
    let close_requested = headers.has_token("connection", "close")
        || (head.version == Version::Http10 && !headers.has_token("connection", "keep-alive"));
    let capped = config
        .max_keep_alive_requests
        .is_some_and(|cap| served >= cap);
    let mut must_close = close_requested || capped || ctx.is_draining();

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    let (body_tx, body_rx) = mpsc::unbounded_channel();
    let (release_tx, mut release_rx) = mpsc::unbounded_channel();
    let shared = ExchangeShared::new(served, cmd_tx);
    let mut exchange = Exchange::new(Arc::clone(&shared));
    let reader = BodyReader::new(body_rx, release_tx, served);

    let request = Request::new(
        head.method,
        head.target.path,
        head.target.query,
        head.version,
        Protocol::Http1,
        headers,
        reader,
        ctx.info.remote_addr,
        Arc::clone(&shared),
        ctx.exec.clone(),
    );
    let response = Response::new(Arc::clone(&shared));

    ctx.stats.on_request_started();
    ctx.info.on_request_started();

    if head.body != BodyKind::None {
        exchange.on_request_body_streaming();
    }

    let mut writer = ResponseWriter::new()
        .close_connection(must_close)
        .trailers_negotiated(te_trailers);
    if is_head {
        writer = writer.for_head_request();
    }
    let mut out = BytesMut::with_capacity(8 * 1024);

    // Hand the exchange to the application executor.
    let dispatch_ctx = Arc::clone(&ctx.dispatch);
    if ctx
        .exec
        .submit(Box::new(move || {
            crate::handler::dispatch(&dispatch_ctx, request, response);
        }))
        .is_err()
    {
        ctx.stats.on_rejected_overload();
        finish_exchange(ctx, &mut exchange, ExchangeState::Errored, Some("overloaded".into()));
        let mut headers: HeaderList =
            vec![("content-type".into(), "text/html;charset=utf-8".into())];
        let page = error_page(503, "The server is overloaded. Please try again later.");
        let _ = writer.write_full(&mut out, 503, &mut headers, page.as_bytes());
        write_out(io, ctx, &mut out).await?;
        return Ok(Next::Close);
    }

    let mut body_done = false;
    let mut body_bytes: u64 = 0;
    let mut unacked: u64 = 0;
    let mut input_closed = false;
    let mut response_done = false;
    let mut close_for_error = false;
    let mut last_activity = Instant::now();

    let next = 'serve: loop {
        // ── Feed buffered bytes through the parser ──────────────────
        while !body_done {
            let owned = match parser.next_event(cursor.unread()) {
                Ok(ParseStep::Event { consumed, event }) => {
                    let owned = match event {
                        ParseEvent::BodyChunk { data, .. } => {
                            OwnedEvent::Chunk(Bytes::copy_from_slice(data))
                        }
                        ParseEvent::Trailers(trailers) => OwnedEvent::Trailers(trailers),
                        ParseEvent::EndOfBody => OwnedEvent::End,
                        _ => OwnedEvent::Skip,
                    };
                    cursor.consume(consumed);
                    owned
                }
                Ok(ParseStep::NeedMore { consumed }) => {
                    cursor.consume(consumed);
                    break;
                }
                Err(err) => {
                    ctx.stats.on_invalid_request();
                    let _ = body_tx.send(BodyEvent::Error(Error::InvalidRequest {
                        status: err.status,
                        detail: err.message.into(),
                    }));
                    if writer.state() == WriterState::Nothing {
                        let mut headers: HeaderList =
                            vec![("content-type".into(), "text/plain".into())];
                        let body = format!("{} {}\n", err.status, reason_phrase(err.status));
                        let _ = writer.write_full(&mut out, err.status, &mut headers, body.as_bytes());
                        let _ = write_out(io, ctx, &mut out).await;
                    }
                    finish_exchange(ctx, &mut exchange, ExchangeState::Errored, Some(err.to_string()));
                    break 'serve Next::Close;
                }
            };

            match owned {
                OwnedEvent::Chunk(chunk) => {
                    body_bytes += chunk.len() as u64;
                    if body_bytes > config.max_request_size {
                        ctx.stats.on_invalid_request();
                        let _ = body_tx.send(BodyEvent::Error(Error::InvalidRequest {
                            status: 413,
                            detail: "request body too large".into(),
                        }));
                        if config.body_too_large_action == BodyTooLargeAction::SendResponse
                            && writer.state() == WriterState::Nothing
                        {
                            let mut headers: HeaderList =
                                vec![("content-type".into(), "text/html;charset=utf-8".into())];
                            let page = error_page(413, "The request body exceeds the limit.");
                            let _ = writer.write_full(&mut out, 413, &mut headers, page.as_bytes());
                            let _ = write_out(io, ctx, &mut out).await;
                        }
                        finish_exchange(
                            ctx,
                            &mut exchange,
                            ExchangeState::Errored,
                            Some("request body too large".into()),
                        );
                        break 'serve Next::Close;
                    }
                    exchange.on_request_body_streaming();
                    unacked += chunk.len() as u64;
                    let flow = chunk.len() as u32;
                    let _ = body_tx.send(BodyEvent::Chunk { data: chunk, flow });
                }
                OwnedEvent::Trailers(trailers) => {
                    let _ = body_tx.send(BodyEvent::Trailers(trailers));
                }
                OwnedEvent::End => {
                    body_done = true;
                    exchange.on_request_complete();
                    let _ = body_tx.send(BodyEvent::End);
                }
                OwnedEvent::Skip => {}
            }
        }

        if response_done {
            break if body_done && !must_close && !close_for_error {
                Next::KeepAlive
            } else {
                Next::Close
            };
        }

        // ── Wait for the next event ─────────────────────────────────
        let read_allowed = !input_closed && !cursor.is_full() && unacked < UNACKED_WATERMARK;
        let read_deadline = if body_done {
            config.idle_timeout
        } else {
            config.request_read_timeout
        };
        let mut tmp = [0u8; READ_CHUNK];
        let spare = cursor_space(cursor).min(READ_CHUNK).max(1);

        enum Act {
            Cmd(Option<(u64, ResponseCmd)>),
            Release(u64),
            Read(Result<Result<usize, Error>, tokio::time::error::Elapsed>),
            Drain,
            /// Fires when every other branch is quiet, so an abandoned
            /// exchange still hits the idle deadline.
            Tick,
        }

        let act = tokio::select! {
            biased;
            cmd = cmd_rx.recv() => Act::Cmd(cmd),
            Some((_, n)) = release_rx.recv() => Act::Release(n as u64),
            _ = draining.changed() => Act::Drain,
            r = tokio::time::timeout(read_deadline, io.read(&mut tmp[..spare])), if read_allowed => Act::Read(r),
            _ = tokio::time::sleep(config.idle_timeout), if !read_allowed => Act::Tick,
        };

        match act {
            Act::Tick => {
                if last_activity.elapsed() >= config.idle_timeout {
                    ctx.stats.on_timed_out();
                    if !body_done {
                        let _ = body_tx.send(BodyEvent::Error(Error::TimedOut { status: 408 }));
                    }
                    finish_exchange(ctx, &mut exchange, ExchangeState::TimedOut, None);
                    break 'serve Next::Close;
                }
            }
            Act::Drain => {
                // Exchanges that had request headers before the stop call
                // finish; the connection closes afterwards.
                must_close = true;
            }
            Act::Release(n) => {
                unacked = unacked.saturating_sub(n);
                last_activity = Instant::now();
            }
            Act::Read(Err(_elapsed)) => {
                if !body_done {
                    ctx.stats.on_timed_out();
                    let _ = body_tx.send(BodyEvent::Error(Error::TimedOut { status: 408 }));
                    if writer.state() == WriterState::Nothing {
                        let mut headers: HeaderList =
                            vec![("content-type".into(), "text/html;charset=utf-8".into())];
                        let page = error_page(408, "Timed out waiting for the request body.");
                        let _ = writer.write_full(&mut out, 408, &mut headers, page.as_bytes());
                        let _ = write_out(io, ctx, &mut out).await;
                    }
                    finish_exchange(ctx, &mut exchange, ExchangeState::TimedOut, None);
                    break 'serve Next::Close;
                }
                if last_activity.elapsed() >= config.idle_timeout {
                    ctx.stats.on_timed_out();
                    finish_exchange(ctx, &mut exchange, ExchangeState::TimedOut, None);
                    break 'serve Next::Close;
                }
            }
            Act::Read(Ok(Ok(0))) => {
                input_closed = true;
                last_activity = Instant::now();
                if !body_done {
                    let _ = body_tx.send(BodyEvent::Error(Error::ClientDisconnected));
                    finish_exchange(ctx, &mut exchange, ExchangeState::ClientDisconnected, None);
                    break 'serve Next::Close;
                }
                // Half-close: the client is done sending and waits for the
                // rest of the response. Serve it, then close.
                must_close = true;
            }
            Act::Read(Ok(Ok(n))) => {
                ctx.stats.on_bytes_read(n as u64);
                last_activity = Instant::now();
                push_into_cursor(cursor, &tmp[..n]);
            }
            Act::Read(Ok(Err(err))) => {
                debug!(conn = ctx.info.id, error = %err, "read failed mid-exchange");
                if !body_done {
                    let _ = body_tx.send(BodyEvent::Error(Error::ClientDisconnected));
                }
                finish_exchange(ctx, &mut exchange, ExchangeState::ClientDisconnected, None);
                break 'serve Next::Close;
            }
            Act::Cmd(None) => {
                // Every response sender is gone without a completion: an
                // async handle was dropped on the floor.
                if writer.state() == WriterState::Nothing {
                    let mut headers: HeaderList =
                        vec![("content-type".into(), "text/html;charset=utf-8".into())];
                    let page = error_page(500, "The response was abandoned.");
                    let _ = writer.write_full(&mut out, 500, &mut headers, page.as_bytes());
                    let _ = write_out(io, ctx, &mut out).await;
                }
                finish_exchange(
                    ctx,
                    &mut exchange,
                    ExchangeState::Errored,
                    Some("response abandoned".into()),
                );
                break 'serve Next::Close;
            }
            Act::Cmd(Some((_, cmd))) => match cmd {
                ResponseCmd::Full {
                    status,
                    headers,
                    body,
                } => {
                    let mut headers = headers;
                    match writer.write_full(&mut out, status, &mut headers, &body) {
                        Ok(()) => {
                            exchange.on_response_headers_sent();
                            if let Err(err) = write_out(io, ctx, &mut out).await {
                                fail_on_write(ctx, &mut exchange, &err);
                                break 'serve Next::Close;
                            }
                            last_activity = Instant::now();
                            response_done = true;
                        }
                        Err(werr) => warn!(conn = ctx.info.id, error = %werr, "dropped response write"),
                    }
                }
                ResponseCmd::Start { status, headers } => {
                    let mut headers = headers;
                    match writer.start_streaming(&mut out, status, &mut headers) {
                        Ok(()) => {
                            exchange.on_response_headers_sent();
                            if let Err(err) = write_out(io, ctx, &mut out).await {
                                fail_on_write(ctx, &mut exchange, &err);
                                break 'serve Next::Close;
                            }
                            last_activity = Instant::now();
                        }
                        Err(werr) => warn!(conn = ctx.info.id, error = %werr, "dropped stream start"),
                    }
                }
                ResponseCmd::Chunk { data, ack } => {
                    let write = match writer.write_body(&mut out, &data) {
                        Ok(BodyWriteOutcome::Truncated { dropped, .. }) => {
                            warn!(
                                conn = ctx.info.id,
                                dropped, "body write overruns declared content-length; truncated"
                            );
                            Ok(())
                        }
                        Ok(_) => Ok(()),
                        Err(werr) => Err(Error::Internal(werr.to_string())),
                    };
                    let write = match write {
                        Ok(()) => {
                            exchange.on_response_body_streaming();
                            write_out(io, ctx, &mut out).await
                        }
                        Err(err) => Err(err),
                    };
                    match write {
                        Ok(()) => {
                            last_activity = Instant::now();
                            if let Some(ack) = ack {
                                let _ = ack.send(Ok(()));
                            }
                        }
                        Err(err) => {
                            if let Some(ack) = ack {
                                let _ = ack.send(Err(Error::ClientDisconnected));
                            }
                            fail_on_write(ctx, &mut exchange, &err);
                            break 'serve Next::Close;
                        }
                    }
                }
                ResponseCmd::Complete {
                    error,
                    status,
                    headers,
                } => {
                    match writer.state() {
                        WriterState::Nothing => {
                            // Nothing was written: 204 for a handler that
                            // only set headers, or the status it chose.
                            let mut headers = headers;
                            let status = status.unwrap_or(204);
                            let _ = writer.write_full(&mut out, status, &mut headers, b"");
                            exchange.on_response_headers_sent();
                        }
                        WriterState::Streaming => {
                            let trailers = shared.trailers.lock().expect("trailer lock").clone();
                            let trailers = (!trailers.is_empty()).then_some(&trailers);
                            if let Err(werr) = writer.finish(&mut out, trailers) {
                                warn!(conn = ctx.info.id, error = %werr, "response finished inconsistently");
                                close_for_error = true;
                            }
                        }
                        WriterState::FullSent | WriterState::StreamingComplete => {}
                    }
                    if let Err(err) = write_out(io, ctx, &mut out).await {
                        fail_on_write(ctx, &mut exchange, &err);
                        break 'serve Next::Close;
                    }
                    last_activity = Instant::now();
                    response_done = true;
                    if let Some(err) = error {
                        close_for_error = true;
                        finish_exchange(
                            ctx,
                            &mut exchange,
                            ExchangeState::Errored,
                            Some(err.to_string()),
                        );
                    }
                }
                ResponseCmd::Cancel { retry_after_secs } => {
                    if writer.state() == WriterState::Nothing {
                        let mut headers: HeaderList =
                            vec![("content-type".into(), "text/html;charset=utf-8".into())];
                        if let Some(secs) = retry_after_secs {
                            headers.push(("retry-after".into(), secs.to_string()));
                        }
                        let page = error_page(503, "The request was cancelled.");
                        let _ = writer.write_full(&mut out, 503, &mut headers, page.as_bytes());
                        let _ = write_out(io, ctx, &mut out).await;
                    }
                    finish_exchange(
                        ctx,
                        &mut exchange,
                        ExchangeState::Errored,
                        Some("cancelled".into()),
                    );
                    break 'serve Next::Close;
                }
            },
        }
    };

    let terminal = if close_for_error {
        ExchangeState::Errored
    } else {
        ExchangeState::Complete
    };
    finish_exchange(ctx, &mut exchange, terminal, None);
    Ok(next)
}

fn finish_exchange(
    ctx: &ConnCtx,
    exchange: &mut Exchange,
    state: ExchangeState,
    error: Option<String>,
) {
    if exchange.finish(state, error) {
        ctx.stats.on_request_ended();
        ctx.info.on_request_ended();
    }
}

fn fail_on_write(ctx: &ConnCtx, exchange: &mut Exchange, err: &Error) {
    let state = match err {
        Error::TimedOut { .. } => {
            ctx.stats.on_timed_out();
            ExchangeState::TimedOut
        }
        _ => ExchangeState::ClientDisconnected,
    };
    finish_exchange(ctx, exchange, state, Some(err.to_string()));
}

/// Canned pre-dispatch response; always closes the connection.
async fn respond_canned(
    io: &mut crate::tls::ServerStream,
    ctx: &ConnCtx,
    status: u16,
    detail: &str,
) -> Result<(), Error> {
    let mut writer = ResponseWriter::new().close_connection(true);
    let mut out = BytesMut::new();
    let mut headers: HeaderList = vec![("content-type".into(), "text/plain".into())];
    let body = format!("{} {}\n{}\n", status, reason_phrase(status), detail);
    let _ = writer.write_full(&mut out, status, &mut headers, body.as_bytes());
    write_out(io, ctx, &mut out).await?;
    Ok(())
}

async fn write_out(
    io: &mut crate::tls::ServerStream,
    ctx: &ConnCtx,
    out: &mut BytesMut,
) -> Result<(), Error> {
    if out.is_empty() {
        return Ok(());
    }
    let data = out.split().freeze();
    match tokio::time::timeout(ctx.config.response_write_timeout, io.write_all(&data)).await {
        Ok(Ok(())) => {
            ctx.stats.on_bytes_sent(data.len() as u64);
            Ok(())
        }
        Ok(Err(err)) => Err(err),
        Err(_) => Err(Error::TimedOut { status: 504 }),
    }
}

fn cursor_space(cursor: &mut ByteCursor) -> usize {
    cursor.spare_mut().len()
}

fn push_into_cursor(cursor: &mut ByteCursor, data: &[u8]) {
    let spare = cursor.spare_mut();
    debug_assert!(spare.len() >= data.len());
    spare[..data.len()].copy_from_slice(data);
    cursor.advance(data.len());
}
