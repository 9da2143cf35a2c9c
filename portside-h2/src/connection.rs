//! Server-side HTTP/2 connection state machine.
//!
//! `ServerConnection` is sans-IO: feed bytes from the transport with
//! [`ServerConnection::recv`], drain [`ServerEvent`]s with
//! [`ServerConnection::poll_event`], and ship
//! [`ServerConnection::take_pending_send`] back to the transport. The
//! driver that owns the socket decides when to pump.
//!
//! Flow control is explicit on both sides. Inbound: DATA charges the
//! connection and stream windows for the full frame payload (padding
//! included), and windows are only replenished when the consumer calls
//! [`ServerConnection::release_capacity`] after the application has taken
//! the bytes; that is the backpressure path. Outbound:
//! [`ServerConnection::send_data`] never blocks and never drops; what the
//! peer's windows cannot take right now is queued per stream and drained
//! as WINDOW_UPDATEs arrive, so one stalled stream cannot starve another.

use std::collections::{BTreeMap, VecDeque};

use crate::error::{ErrorCode, H2Error};
use crate::flowcontrol::{self, FlowWindow};
use crate::frame::{self, Frame};
use crate::hpack::{Decoder, Encoder, HeaderField};
use crate::settings::Settings;
use crate::stream::{Outbound, Stream, StreamState};

/// Client connection preface magic (RFC 7540 Section 3.5).
pub const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Events surfaced to the connection driver.
#[derive(Debug)]
pub enum ServerEvent {
    /// The SETTINGS exchange completed; requests may now arrive.
    HandshakeComplete,
    /// A complete request header block arrived on a new stream.
    RequestHeaders {
        stream_id: u32,
        fields: Vec<HeaderField>,
        end_stream: bool,
    },
    /// Request body bytes. `flow_len` is the flow-controlled cost
    /// (payload + padding) to pass back to `release_capacity`.
    Data {
        stream_id: u32,
        data: Vec<u8>,
        flow_len: u32,
        end_stream: bool,
    },
    /// Request trailers; the stream's inbound side is done.
    Trailers {
        stream_id: u32,
        fields: Vec<HeaderField>,
    },
    /// The decoded header list blew the configured budget; answer 431.
    HeaderListTooLarge { stream_id: u32, end_stream: bool },
    /// A stream was refused because the concurrent-stream cap is reached.
    StreamRefused { stream_id: u32 },
    /// The client reset a stream.
    StreamReset {
        stream_id: u32,
        error_code: ErrorCode,
    },
    /// The client sent GOAWAY.
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    /// Waiting for the 24-byte client preface magic.
    ExpectPreface,
    /// Preface seen; the first frame must be SETTINGS.
    ExpectSettings,
    Open,
    /// GOAWAY sent or received; existing streams drain, new ones refused.
    Closing,
    Closed,
}

/// Where a HEADERS + CONTINUATION block is being accumulated.
#[derive(Debug, Clone, Copy)]
enum BlockTarget {
    /// A live stream in the table.
    Stream(u32),
    /// A refused or stale stream: the block must still be decoded to keep
    /// HPACK state in sync, then discarded.
    Discard(u32),
}

/// Sans-IO server-side HTTP/2 connection.
pub struct ServerConnection {
    state: ConnState,
    local: Settings,
    remote: Settings,

    streams: BTreeMap<u32, Stream>,
    /// Highest client-initiated stream id seen.
    highest_stream_id: u32,

    conn_recv: FlowWindow,
    conn_send: FlowWindow,
    /// Consumed-but-unreleased connection-level flow bytes.
    conn_unreleased: u32,

    encoder: Encoder,
    decoder: Decoder,

    /// In-progress header block (no interleaving allowed until END_HEADERS).
    continuation: Option<BlockTarget>,
    /// Accumulator for discarded blocks; live streams use their own buffer.
    discard_buf: Vec<u8>,

    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
    events: VecDeque<ServerEvent>,

    header_list_budget: usize,
    goaway_sent: bool,
}

impl ServerConnection {
    /// Create a server connection and queue its SETTINGS frame.
    pub fn new(local: Settings) -> Self {
        let mut send_buf = Vec::new();
        frame::put_settings(&mut send_buf, Some(&local));

        // The connection-level window starts at the protocol default and is
        // only ever moved by WINDOW_UPDATE; SETTINGS does not touch it.
        let mut conn_recv = FlowWindow::default();
        let extra = i64::from(local.initial_window_size) - flowcontrol::DEFAULT_WINDOW_SIZE;
        if extra > 0 {
            frame::put_window_update(&mut send_buf, 0, extra as u32);
            conn_recv.grow(extra as u32).expect("window within bounds");
        }

        let header_list_budget = local
            .max_header_list_size
            .map(|v| v as usize)
            .unwrap_or(usize::MAX / 8);

        Self {
            state: ConnState::ExpectPreface,
            decoder: Decoder::new(local.header_table_size as usize),
            encoder: Encoder::new(Settings::default().header_table_size as usize),
            local,
            remote: Settings::default(),
            streams: BTreeMap::new(),
            highest_stream_id: 0,
            conn_recv,
            conn_send: FlowWindow::default(),
            conn_unreleased: 0,
            continuation: None,
            discard_buf: Vec::new(),
            recv_buf: Vec::new(),
            send_buf,
            events: VecDeque::new(),
            header_list_budget,
            goaway_sent: false,
        }
    }

    // -- Transport side --

    /// Feed bytes received from the transport.
    ///
    /// On a connection error the GOAWAY is already queued; flush
    /// `take_pending_send` and close the transport.
    pub fn recv(&mut self, data: &[u8]) -> Result<(), H2Error> {
        if self.state == ConnState::Closed {
            return Ok(());
        }
        self.recv_buf.extend_from_slice(data);
        match self.process_recv_buf() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail_connection(&e);
                Err(e)
            }
        }
    }

    /// Drain the next application-visible event.
    pub fn poll_event(&mut self) -> Option<ServerEvent> {
        self.events.pop_front()
    }

    /// Take all bytes queued for the transport.
    pub fn take_pending_send(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.send_buf)
    }

    pub fn has_pending_send(&self) -> bool {
        !self.send_buf.is_empty()
    }

    // -- Response side --

    /// Send the response header block for a stream.
    pub fn send_headers(
        &mut self,
        stream_id: u32,
        fields: &[HeaderField],
        end_stream: bool,
    ) -> Result<(), H2Error> {
        let stream = self
            .streams
            .get(&stream_id)
            .ok_or(H2Error::StreamClosed(stream_id))?;
        if stream.end_queued || matches!(stream.state, StreamState::HalfClosedLocal) {
            return Err(H2Error::StreamClosed(stream_id));
        }

        let mut block = Vec::new();
        self.encoder.encode(fields, &mut block);
        frame::put_header_block(
            &mut self.send_buf,
            stream_id,
            &block,
            end_stream,
            self.remote.max_frame_size,
        );
        if end_stream {
            if let Some(stream) = self.streams.get_mut(&stream_id) {
                stream.end_queued = true;
            }
            self.close_local_and_purge(stream_id);
        }
        Ok(())
    }

    /// Queue response body bytes.
    ///
    /// Bytes beyond the peer's flow-control windows are buffered on the
    /// stream and drained as WINDOW_UPDATEs arrive. Use
    /// [`Self::outbound_buffered`] to apply backpressure to the producer.
    pub fn send_data(
        &mut self,
        stream_id: u32,
        data: Vec<u8>,
        end_stream: bool,
    ) -> Result<(), H2Error> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(H2Error::StreamClosed(stream_id))?;
        if stream.end_queued {
            return Err(H2Error::StreamClosed(stream_id));
        }
        stream.outbound_buffered += data.len();
        stream.end_queued |= end_stream;
        stream.outbound.push_back(Outbound::Data { data, end_stream });
        self.flush_outbound();
        Ok(())
    }

    /// Queue response trailers; implies end of stream.
    pub fn send_trailers(
        &mut self,
        stream_id: u32,
        fields: Vec<HeaderField>,
    ) -> Result<(), H2Error> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(H2Error::StreamClosed(stream_id))?;
        if stream.end_queued {
            return Err(H2Error::StreamClosed(stream_id));
        }
        stream.end_queued = true;
        stream.outbound.push_back(Outbound::Trailers { fields });
        self.flush_outbound();
        Ok(())
    }

    /// Abort a stream.
    pub fn reset_stream(&mut self, stream_id: u32, code: ErrorCode) {
        if self.streams.remove(&stream_id).is_some() {
            frame::put_rst_stream(&mut self.send_buf, stream_id, code);
        }
    }

    /// Return consumed request-body capacity to the peer.
    ///
    /// The driver calls this once the application has accepted `flow_len`
    /// bytes of a [`ServerEvent::Data`]; accumulated releases become
    /// WINDOW_UPDATE frames once they reach half a window.
    pub fn release_capacity(&mut self, stream_id: u32, flow_len: u32) {
        self.release_connection(flow_len);
        let stream_threshold = u32::max(1, self.local.initial_window_size / 2);
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if !stream.accepts_data() {
                return;
            }
            stream.unreleased += flow_len;
            if stream.unreleased >= stream_threshold {
                let inc = stream.unreleased;
                stream.unreleased = 0;
                if stream.recv_window.grow(inc).is_ok() {
                    frame::put_window_update(&mut self.send_buf, stream_id, inc);
                }
            }
        }
    }

    // -- Lifecycle --

    /// Begin a graceful close: GOAWAY with the highest processed stream id;
    /// existing streams finish, new ones are not accepted.
    pub fn graceful_shutdown(&mut self) {
        if !self.goaway_sent {
            frame::put_goaway(&mut self.send_buf, self.highest_stream_id, ErrorCode::NoError);
            self.goaway_sent = true;
        }
        if self.state != ConnState::Closed {
            self.state = ConnState::Closing;
        }
    }

    /// All streams are finished after a graceful shutdown.
    pub fn is_drained(&self) -> bool {
        self.state == ConnState::Closed
            || (self.state == ConnState::Closing && self.streams.is_empty())
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Number of live streams.
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    /// Response bytes queued behind flow control for a stream.
    pub fn outbound_buffered(&self, stream_id: u32) -> usize {
        self.streams
            .get(&stream_id)
            .map(|s| s.outbound_buffered)
            .unwrap_or(0)
    }

    /// Highest client stream id processed (for diagnostics).
    pub fn highest_stream_id(&self) -> u32 {
        self.highest_stream_id
    }

    // -- Inbound processing --

    fn process_recv_buf(&mut self) -> Result<(), H2Error> {
        if self.state == ConnState::ExpectPreface {
            if self.recv_buf.len() < CLIENT_PREFACE.len() {
                // Reject early on a prefix mismatch so garbage doesn't sit
                // in the buffer until 24 bytes arrive.
                if !CLIENT_PREFACE.starts_with(&self.recv_buf[..]) {
                    return Err(H2Error::BadPreface);
                }
                return Ok(());
            }
            if &self.recv_buf[..CLIENT_PREFACE.len()] != CLIENT_PREFACE {
                return Err(H2Error::BadPreface);
            }
            self.recv_buf.drain(..CLIENT_PREFACE.len());
            self.state = ConnState::ExpectSettings;
        }

        loop {
            match frame::decode_frame(&self.recv_buf, self.local.max_frame_size)? {
                Some((frame, consumed)) => {
                    self.recv_buf.drain(..consumed);
                    self.handle_frame(frame)?;
                }
                None => return Ok(()),
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), H2Error> {
        // While a header block is open, only its CONTINUATIONs may arrive.
        if let Some(target) = self.continuation {
            let expected = match target {
                BlockTarget::Stream(id) | BlockTarget::Discard(id) => id,
            };
            match &frame {
                Frame::Continuation { stream_id, .. } if *stream_id == expected => {}
                _ => {
                    return Err(H2Error::ProtocolError(
                        "expected CONTINUATION for open header block".into(),
                    ));
                }
            }
        }

        if self.state == ConnState::ExpectSettings
            && !matches!(frame, Frame::Settings { ack: false, .. })
        {
            return Err(H2Error::ProtocolError(
                "first frame after preface must be SETTINGS".into(),
            ));
        }

        match frame {
            Frame::Settings { ack, settings } => {
                if !ack {
                    self.apply_remote_settings(settings)?;
                }
            }
            Frame::Headers {
                stream_id,
                fragment,
                end_stream,
                end_headers,
            } => self.handle_headers(stream_id, fragment, end_stream, end_headers)?,
            Frame::Continuation {
                stream_id,
                fragment,
                end_headers,
            } => self.handle_continuation(stream_id, fragment, end_headers)?,
            Frame::Data {
                stream_id,
                payload,
                flow_len,
                end_stream,
            } => self.handle_data(stream_id, payload, flow_len, end_stream)?,
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => self.handle_window_update(stream_id, increment)?,
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                if self.streams.remove(&stream_id).is_some() {
                    self.events.push_back(ServerEvent::StreamReset {
                        stream_id,
                        error_code,
                    });
                }
            }
            Frame::Ping { ack, opaque_data } => {
                if !ack {
                    frame::put_ping(&mut self.send_buf, true, opaque_data);
                }
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                ..
            } => {
                self.state = ConnState::Closing;
                self.events.push_back(ServerEvent::GoAway {
                    last_stream_id,
                    error_code,
                });
            }
            Frame::PushPromise { .. } => {
                return Err(H2Error::ProtocolError("PUSH_PROMISE from client".into()));
            }
            Frame::Priority { .. } | Frame::Unknown { .. } => {}
        }
        Ok(())
    }

    fn apply_remote_settings(&mut self, settings: Settings) -> Result<(), H2Error> {
        let delta =
            i64::from(settings.initial_window_size) - i64::from(self.remote.initial_window_size);
        if delta != 0 {
            for stream in self.streams.values_mut() {
                stream.send_window.shift(delta)?;
            }
        }
        self.encoder
            .set_capacity(settings.header_table_size as usize);
        self.remote = settings;

        frame::put_settings(&mut self.send_buf, None);
        if self.state == ConnState::ExpectSettings {
            self.state = ConnState::Open;
            self.events.push_back(ServerEvent::HandshakeComplete);
        }
        // A larger initial window may unblock queued data.
        if delta > 0 {
            self.flush_outbound();
        }
        Ok(())
    }

    fn handle_headers(
        &mut self,
        stream_id: u32,
        fragment: Vec<u8>,
        end_stream: bool,
        end_headers: bool,
    ) -> Result<(), H2Error> {
        if stream_id % 2 == 0 {
            return Err(H2Error::ProtocolError(
                "client stream ids must be odd".into(),
            ));
        }

        if self.streams.contains_key(&stream_id) {
            // A second header block on a live stream is the trailer block.
            if !end_stream {
                return Err(H2Error::ProtocolError(
                    "trailer block without END_STREAM".into(),
                ));
            }
            let stream = self.streams.get_mut(&stream_id).expect("checked above");
            stream.header_buf = fragment;
            stream.header_block_end_stream = true;
            if end_headers {
                self.finish_stream_block(stream_id)?;
            } else {
                self.continuation = Some(BlockTarget::Stream(stream_id));
            }
            return Ok(());
        }

        // New stream id. Three discard cases, all of which still carry
        // HPACK state and must be decoded: stale ids (reset or completed
        // streams the client raced against), streams arriving while the
        // connection drains after GOAWAY, and streams over the concurrency
        // cap. Only the last is an overload rejection.
        let stale = stream_id <= self.highest_stream_id;
        let draining = self.goaway_sent || self.state != ConnState::Open;
        let over_cap = !stale && !draining && !self.has_stream_capacity();
        if stale || draining || over_cap {
            if over_cap {
                self.highest_stream_id = stream_id;
                frame::put_rst_stream(&mut self.send_buf, stream_id, ErrorCode::RefusedStream);
                self.events
                    .push_back(ServerEvent::StreamRefused { stream_id });
            }
            self.discard_buf = fragment;
            if end_headers {
                self.finish_discard_block()?;
            } else {
                self.continuation = Some(BlockTarget::Discard(stream_id));
            }
            return Ok(());
        }

        self.highest_stream_id = stream_id;
        let mut stream = Stream::new(
            i64::from(self.local.initial_window_size),
            i64::from(self.remote.initial_window_size),
        );
        stream.header_buf = fragment;
        stream.header_block_end_stream = end_stream;
        self.streams.insert(stream_id, stream);

        if end_headers {
            self.finish_stream_block(stream_id)?;
        } else {
            self.continuation = Some(BlockTarget::Stream(stream_id));
        }
        Ok(())
    }

    fn handle_continuation(
        &mut self,
        stream_id: u32,
        fragment: Vec<u8>,
        end_headers: bool,
    ) -> Result<(), H2Error> {
        let target = match self.continuation {
            Some(t) => t,
            None => {
                return Err(H2Error::ProtocolError(
                    "CONTINUATION outside a header block".into(),
                ));
            }
        };

        match target {
            BlockTarget::Stream(id) => {
                debug_assert_eq!(id, stream_id);
                let stream = self
                    .streams
                    .get_mut(&id)
                    .ok_or_else(|| H2Error::Internal("continuation stream vanished".into()))?;
                stream.header_buf.extend_from_slice(&fragment);
                if end_headers {
                    self.continuation = None;
                    self.finish_stream_block(id)?;
                }
            }
            BlockTarget::Discard(_) => {
                self.discard_buf.extend_from_slice(&fragment);
                if end_headers {
                    self.continuation = None;
                    self.finish_discard_block()?;
                }
            }
        }
        Ok(())
    }

    /// Decode a completed header block on a live stream and emit the event.
    fn finish_stream_block(&mut self, stream_id: u32) -> Result<(), H2Error> {
        let (block, end_stream, is_trailers) = {
            let stream = self
                .streams
                .get_mut(&stream_id)
                .ok_or_else(|| H2Error::Internal("header block stream vanished".into()))?;
            (
                std::mem::take(&mut stream.header_buf),
                stream.header_block_end_stream,
                stream.saw_request_headers,
            )
        };

        let decoded = self.decoder.decode(&block, self.header_list_budget)?;

        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or_else(|| H2Error::Internal("header block stream vanished".into()))?;
        stream.saw_request_headers = true;
        if end_stream {
            stream.close_remote();
        }

        if decoded.over_budget {
            self.events.push_back(ServerEvent::HeaderListTooLarge {
                stream_id,
                end_stream,
            });
        } else if is_trailers {
            self.events.push_back(ServerEvent::Trailers {
                stream_id,
                fields: decoded.fields,
            });
        } else {
            self.events.push_back(ServerEvent::RequestHeaders {
                stream_id,
                fields: decoded.fields,
                end_stream,
            });
        }
        Ok(())
    }

    /// Decode and drop a header block for a refused or stale stream.
    fn finish_discard_block(&mut self) -> Result<(), H2Error> {
        let block = std::mem::take(&mut self.discard_buf);
        let _ = self.decoder.decode(&block, self.header_list_budget)?;
        Ok(())
    }

    fn handle_data(
        &mut self,
        stream_id: u32,
        payload: Vec<u8>,
        flow_len: u32,
        end_stream: bool,
    ) -> Result<(), H2Error> {
        // The whole frame payload occupies the connection window even if
        // the stream is gone.
        self.conn_recv.consume_recv(flow_len)?;

        match self.streams.get_mut(&stream_id) {
            Some(stream) if stream.accepts_data() => {
                if stream.recv_window.consume_recv(flow_len).is_err() {
                    // The peer overran the stream window we granted.
                    self.reset_stream(stream_id, ErrorCode::FlowControlError);
                    self.release_connection(flow_len);
                    return Ok(());
                }
                if end_stream {
                    stream.close_remote();
                }
                self.events.push_back(ServerEvent::Data {
                    stream_id,
                    data: payload,
                    flow_len,
                    end_stream,
                });
            }
            Some(_) => {
                // DATA after the client already ended its side.
                self.reset_stream(stream_id, ErrorCode::StreamClosed);
                self.release_connection(flow_len);
            }
            None => {
                // Stale stream (already reset/finished): hand the window
                // capacity straight back.
                self.release_connection(flow_len);
            }
        }
        Ok(())
    }

    fn handle_window_update(&mut self, stream_id: u32, increment: u32) -> Result<(), H2Error> {
        if stream_id == 0 {
            self.conn_send.grow(increment)?;
        } else if let Some(stream) = self.streams.get_mut(&stream_id) {
            if stream.send_window.grow(increment).is_err() {
                self.reset_stream(stream_id, ErrorCode::FlowControlError);
                return Ok(());
            }
        }
        self.flush_outbound();
        Ok(())
    }

    // -- Outbound flushing --

    /// Drain queued outbound items across all streams as far as the
    /// connection and stream windows allow. Round-robins until no stream
    /// can make progress, so a zero-window stream never blocks the rest.
    fn flush_outbound(&mut self) {
        let mut progressed = true;
        while progressed {
            progressed = false;
            let ids: Vec<u32> = self.streams.keys().copied().collect();
            for id in ids {
                if self.flush_one(id) {
                    progressed = true;
                }
            }
        }
    }

    /// Emit at most one frame for this stream. Returns whether progress
    /// was made.
    fn flush_one(&mut self, stream_id: u32) -> bool {
        enum Step {
            Stuck,
            Popped,
            Data { chunk: Vec<u8>, end: bool },
            BareEnd,
            Trailers(Vec<HeaderField>),
        }

        let step = {
            let Some(stream) = self.streams.get_mut(&stream_id) else {
                return false;
            };
            match stream.outbound.front_mut() {
                None => Step::Stuck,
                Some(Outbound::Trailers { .. }) => {
                    match stream.outbound.pop_front() {
                        Some(Outbound::Trailers { fields }) => Step::Trailers(fields),
                        _ => unreachable!("front was trailers"),
                    }
                }
                Some(Outbound::Data { data, end_stream }) => {
                    if data.is_empty() {
                        let end = *end_stream;
                        stream.outbound.pop_front();
                        if end { Step::BareEnd } else { Step::Popped }
                    } else {
                        let budget = self
                            .conn_send
                            .available()
                            .min(stream.send_window.available())
                            .min(self.remote.max_frame_size);
                        let allowed = (budget as usize).min(data.len());
                        if allowed == 0 {
                            Step::Stuck
                        } else {
                            let chunk: Vec<u8> = data.drain(..allowed).collect();
                            let finished = data.is_empty();
                            let end = finished && *end_stream;
                            if finished {
                                stream.outbound.pop_front();
                            }
                            stream.outbound_buffered -= allowed;
                            let _ = stream.send_window.consume(allowed as u32);
                            Step::Data { chunk, end }
                        }
                    }
                }
            }
        };

        match step {
            Step::Stuck => false,
            Step::Popped => true,
            Step::BareEnd => {
                frame::put_data(&mut self.send_buf, stream_id, &[], true);
                self.close_local_and_purge(stream_id);
                true
            }
            Step::Data { chunk, end } => {
                let _ = self.conn_send.consume(chunk.len() as u32);
                frame::put_data(&mut self.send_buf, stream_id, &chunk, end);
                if end {
                    self.close_local_and_purge(stream_id);
                }
                true
            }
            Step::Trailers(fields) => {
                let mut block = Vec::new();
                self.encoder.encode(&fields, &mut block);
                frame::put_header_block(
                    &mut self.send_buf,
                    stream_id,
                    &block,
                    true,
                    self.remote.max_frame_size,
                );
                self.close_local_and_purge(stream_id);
                true
            }
        }
    }

    // -- Internals --

    fn has_stream_capacity(&self) -> bool {
        match self.local.max_concurrent_streams {
            Some(cap) => (self.streams.len() as u32) < cap,
            None => true,
        }
    }

    fn release_connection(&mut self, flow_len: u32) {
        self.conn_unreleased += flow_len;
        let threshold = (flowcontrol::DEFAULT_WINDOW_SIZE / 2) as u32;
        if self.conn_unreleased >= threshold {
            let inc = self.conn_unreleased;
            self.conn_unreleased = 0;
            if self.conn_recv.grow(inc).is_ok() {
                frame::put_window_update(&mut self.send_buf, 0, inc);
            }
        }
    }

    fn close_local_and_purge(&mut self, stream_id: u32) {
        let purge = match self.streams.get_mut(&stream_id) {
            Some(stream) => {
                stream.close_local();
                stream.is_closed()
            }
            None => false,
        };
        if purge {
            self.streams.remove(&stream_id);
        }
    }

    fn fail_connection(&mut self, error: &H2Error) {
        if !self.goaway_sent {
            frame::put_goaway(&mut self.send_buf, self.highest_stream_id, error.code());
            self.goaway_sent = true;
        }
        self.state = ConnState::Closed;
        self.streams.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal in-test HTTP/2 client: encodes frames the way a browser
    /// would and decodes whatever the server connection queues.
    struct TestClient {
        encoder: Encoder,
        decoder: Decoder,
        settings: Settings,
    }

    impl TestClient {
        fn new() -> Self {
            Self {
                encoder: Encoder::new(4096),
                decoder: Decoder::new(4096),
                settings: Settings {
                    enable_push: false,
                    ..Settings::default()
                },
            }
        }

        fn preface_and_settings(&self) -> Vec<u8> {
            let mut buf = CLIENT_PREFACE.to_vec();
            frame::put_settings(&mut buf, Some(&self.settings));
            buf
        }

        fn request(&mut self, stream_id: u32, path: &str, end_stream: bool) -> Vec<u8> {
            let fields = vec![
                HeaderField::new(b":method".as_slice(), b"GET".as_slice()),
                HeaderField::new(b":path".as_slice(), path.as_bytes()),
                HeaderField::new(b":scheme".as_slice(), b"https".as_slice()),
                HeaderField::new(b":authority".as_slice(), b"test".as_slice()),
            ];
            let mut block = Vec::new();
            self.encoder.encode(&fields, &mut block);
            let mut buf = Vec::new();
            frame::put_header_block(&mut buf, stream_id, &block, end_stream, 16384);
            buf
        }

        /// Decode every frame the server queued.
        fn read_frames(&mut self, bytes: &[u8]) -> Vec<Frame> {
            let mut rest = bytes;
            let mut frames = Vec::new();
            while !rest.is_empty() {
                let (frame, consumed) = frame::decode_frame(rest, 1 << 24)
                    .expect("server emitted invalid frame")
                    .expect("server emitted partial frame");
                frames.push(frame);
                rest = &rest[consumed..];
            }
            frames
        }

        fn response_fields(&mut self, block: &[u8]) -> Vec<HeaderField> {
            self.decoder.decode(block, usize::MAX / 8).unwrap().fields
        }
    }

    fn handshake(server: &mut ServerConnection, client: &mut TestClient) {
        server.recv(&client.preface_and_settings()).unwrap();
        assert!(matches!(
            server.poll_event(),
            Some(ServerEvent::HandshakeComplete)
        ));
        let _ = server.take_pending_send(); // server SETTINGS + ACK
    }

    #[test]
    fn settings_handshake() {
        let mut server = ServerConnection::new(Settings::server_default());
        let mut client = TestClient::new();

        // Server SETTINGS are queued before any input.
        let initial = server.take_pending_send();
        let frames = client.read_frames(&initial);
        assert!(matches!(frames[0], Frame::Settings { ack: false, .. }));

        server.recv(&client.preface_and_settings()).unwrap();
        assert!(matches!(
            server.poll_event(),
            Some(ServerEvent::HandshakeComplete)
        ));
        let frames = client.read_frames(&server.take_pending_send());
        assert!(frames.iter().any(|f| matches!(f, Frame::Settings { ack: true, .. })));
    }

    #[test]
    fn bad_preface_fails() {
        let mut server = ServerConnection::new(Settings::server_default());
        let err = server.recv(b"GET / HTTP/1.1\r\n").unwrap_err();
        assert!(matches!(err, H2Error::BadPreface));
        // GOAWAY queued for the transport.
        let bytes = server.take_pending_send();
        assert!(!bytes.is_empty());
        assert!(server.is_closed());
    }

    #[test]
    fn first_frame_must_be_settings() {
        let mut server = ServerConnection::new(Settings::server_default());
        let mut buf = CLIENT_PREFACE.to_vec();
        frame::put_ping(&mut buf, false, [0; 8]);
        assert!(server.recv(&buf).is_err());
    }

    #[test]
    fn request_and_full_response() {
        let mut server = ServerConnection::new(Settings::server_default());
        let mut client = TestClient::new();
        handshake(&mut server, &mut client);

        server.recv(&client.request(1, "/hello", true)).unwrap();
        match server.poll_event() {
            Some(ServerEvent::RequestHeaders {
                stream_id,
                fields,
                end_stream,
            }) => {
                assert_eq!(stream_id, 1);
                assert!(end_stream);
                assert!(fields.iter().any(|f| f.name == b":path" && f.value == b"/hello"));
            }
            other => panic!("{other:?}"),
        }

        server
            .send_headers(
                1,
                &[
                    HeaderField::new(b":status".as_slice(), b"200".as_slice()),
                    HeaderField::new(b"content-type".as_slice(), b"text/plain".as_slice()),
                ],
                false,
            )
            .unwrap();
        server.send_data(1, b"Hello 0".to_vec(), true).unwrap();

        let frames = client.read_frames(&server.take_pending_send());
        match &frames[0] {
            Frame::Headers { fragment, end_stream, .. } => {
                assert!(!end_stream);
                let fields = client.response_fields(fragment);
                assert_eq!(fields[0], HeaderField::new(b":status".as_slice(), b"200".as_slice()));
            }
            other => panic!("{other:?}"),
        }
        match &frames[1] {
            Frame::Data { payload, end_stream, .. } => {
                assert_eq!(payload, b"Hello 0");
                assert!(end_stream);
            }
            other => panic!("{other:?}"),
        }
        // Both sides closed: the stream is purged.
        assert_eq!(server.active_streams(), 0);
    }

    #[test]
    fn blocked_stream_does_not_block_another() {
        let mut server = ServerConnection::new(Settings::server_default());
        let mut client = TestClient::new();
        // Client grants tiny per-stream windows.
        client.settings.initial_window_size = 10;
        handshake(&mut server, &mut client);

        server.recv(&client.request(1, "/slow", true)).unwrap();
        server.recv(&client.request(3, "/fast", true)).unwrap();
        let _ = server.poll_event();
        let _ = server.poll_event();

        server.send_headers(1, &[HeaderField::new(b":status".as_slice(), b"200".as_slice())], false).unwrap();
        server.send_data(1, vec![b'a'; 25], true).unwrap();
        server.send_headers(3, &[HeaderField::new(b":status".as_slice(), b"200".as_slice())], false).unwrap();
        server.send_data(3, vec![b'b'; 10], true).unwrap();

        let frames = client.read_frames(&server.take_pending_send());
        // Stream 1 emitted only its 10-byte window; stream 3 fully drained
        // even though stream 1 is blocked.
        let sent: Vec<(u32, usize, bool)> = frames
            .iter()
            .filter_map(|f| match f {
                Frame::Data { stream_id, payload, end_stream, .. } => {
                    Some((*stream_id, payload.len(), *end_stream))
                }
                _ => None,
            })
            .collect();
        assert_eq!(sent, vec![(1, 10, false), (3, 10, true)]);
        assert_eq!(server.outbound_buffered(1), 15);
        assert_eq!(server.outbound_buffered(3), 0);

        // Opening stream 1's window drains the rest.
        let mut wu = Vec::new();
        frame::put_window_update(&mut wu, 1, 100);
        server.recv(&wu).unwrap();
        let frames = client.read_frames(&server.take_pending_send());
        match &frames[0] {
            Frame::Data { stream_id, payload, end_stream, .. } => {
                assert_eq!(*stream_id, 1);
                assert_eq!(payload.len(), 15);
                assert!(end_stream);
            }
            other => panic!("{other:?}"),
        }
        assert_eq!(server.active_streams(), 0);
    }

    #[test]
    fn concurrent_stream_cap_refuses_excess() {
        let mut local = Settings::server_default();
        local.max_concurrent_streams = Some(1);
        let mut server = ServerConnection::new(local);
        let mut client = TestClient::new();
        handshake(&mut server, &mut client);

        server.recv(&client.request(1, "/a", false)).unwrap();
        server.recv(&client.request(3, "/b", true)).unwrap();

        assert!(matches!(
            server.poll_event(),
            Some(ServerEvent::RequestHeaders { stream_id: 1, .. })
        ));
        assert!(matches!(
            server.poll_event(),
            Some(ServerEvent::StreamRefused { stream_id: 3 })
        ));

        let frames = client.read_frames(&server.take_pending_send());
        assert!(frames.iter().any(|f| matches!(
            f,
            Frame::RstStream {
                stream_id: 3,
                error_code: ErrorCode::RefusedStream
            }
        )));
    }

    #[test]
    fn request_body_flow_accounting_and_release() {
        let mut server = ServerConnection::new(Settings::server_default());
        let mut client = TestClient::new();
        handshake(&mut server, &mut client);

        server.recv(&client.request(1, "/upload", false)).unwrap();
        let _ = server.poll_event();

        let mut data = Vec::new();
        frame::put_data(&mut data, 1, &[b'x'; 1000], false);
        server.recv(&data).unwrap();

        let flow_len = match server.poll_event() {
            Some(ServerEvent::Data { flow_len, data, .. }) => {
                assert_eq!(data.len(), 1000);
                flow_len
            }
            other => panic!("{other:?}"),
        };

        // Below the half-window threshold: no WINDOW_UPDATE yet.
        server.release_capacity(1, flow_len);
        assert!(client
            .read_frames(&server.take_pending_send())
            .iter()
            .all(|f| !matches!(f, Frame::WindowUpdate { .. })));

        // Push total releases past half a window.
        let mut big = Vec::new();
        frame::put_data(&mut big, 1, &vec![b'x'; 16000], false);
        server.recv(&big).unwrap();
        server.recv(&big.clone()).unwrap();
        let _ = server.poll_event();
        let _ = server.poll_event();
        server.release_capacity(1, 16000);
        server.release_capacity(1, 16000);

        let frames = client.read_frames(&server.take_pending_send());
        let updates: Vec<u32> = frames
            .iter()
            .filter_map(|f| match f {
                Frame::WindowUpdate { stream_id, increment } => Some((*stream_id, *increment)),
                _ => None,
            })
            .map(|(_, inc)| inc)
            .collect();
        assert!(!updates.is_empty(), "expected WINDOW_UPDATE after release");
    }

    #[test]
    fn oversized_header_list_flagged() {
        let mut local = Settings::server_default();
        local.max_header_list_size = Some(128);
        let mut server = ServerConnection::new(local);
        let mut client = TestClient::new();
        handshake(&mut server, &mut client);

        let fields = vec![
            HeaderField::new(b":method".as_slice(), b"GET".as_slice()),
            HeaderField::new(b":path".as_slice(), b"/".as_slice()),
            HeaderField::new(b"x-big".as_slice(), vec![b'v'; 200]),
        ];
        let mut block = Vec::new();
        client.encoder.encode(&fields, &mut block);
        let mut buf = Vec::new();
        frame::put_header_block(&mut buf, 1, &block, true, 16384);
        server.recv(&buf).unwrap();

        assert!(matches!(
            server.poll_event(),
            Some(ServerEvent::HeaderListTooLarge { stream_id: 1, .. })
        ));
    }

    #[test]
    fn ping_is_acknowledged() {
        let mut server = ServerConnection::new(Settings::server_default());
        let mut client = TestClient::new();
        handshake(&mut server, &mut client);

        let mut buf = Vec::new();
        frame::put_ping(&mut buf, false, [1, 2, 3, 4, 5, 6, 7, 8]);
        server.recv(&buf).unwrap();
        let frames = client.read_frames(&server.take_pending_send());
        assert!(matches!(
            frames[0],
            Frame::Ping { ack: true, opaque_data: [1, 2, 3, 4, 5, 6, 7, 8] }
        ));
    }

    #[test]
    fn graceful_shutdown_drains_existing_streams() {
        let mut server = ServerConnection::new(Settings::server_default());
        let mut client = TestClient::new();
        handshake(&mut server, &mut client);

        server.recv(&client.request(1, "/inflight", true)).unwrap();
        let _ = server.poll_event();

        server.graceful_shutdown();
        let frames = client.read_frames(&server.take_pending_send());
        assert!(matches!(
            frames[0],
            Frame::GoAway { last_stream_id: 1, error_code: ErrorCode::NoError, .. }
        ));
        assert!(!server.is_drained());

        // The in-flight stream still completes.
        server
            .send_headers(1, &[HeaderField::new(b":status".as_slice(), b"204".as_slice())], true)
            .unwrap();
        assert!(server.is_drained());

        // A new stream arriving now is decoded (HPACK) but not surfaced.
        server.recv(&client.request(5, "/late", true)).unwrap();
        assert!(server.poll_event().is_none());
    }

    #[test]
    fn client_reset_purges_stream() {
        let mut server = ServerConnection::new(Settings::server_default());
        let mut client = TestClient::new();
        handshake(&mut server, &mut client);

        server.recv(&client.request(1, "/x", false)).unwrap();
        let _ = server.poll_event();

        let mut buf = Vec::new();
        frame::put_rst_stream(&mut buf, 1, ErrorCode::Cancel);
        server.recv(&buf).unwrap();
        assert!(matches!(
            server.poll_event(),
            Some(ServerEvent::StreamReset { stream_id: 1, error_code: ErrorCode::Cancel })
        ));
        assert_eq!(server.active_streams(), 0);
        assert!(server.send_headers(1, &[], false).is_err());
    }

    #[test]
    fn client_trailers_are_surfaced() {
        let mut server = ServerConnection::new(Settings::server_default());
        let mut client = TestClient::new();
        handshake(&mut server, &mut client);

        server.recv(&client.request(1, "/upload", false)).unwrap();
        let _ = server.poll_event();

        let mut data = Vec::new();
        frame::put_data(&mut data, 1, b"abc", false);
        server.recv(&data).unwrap();
        let _ = server.poll_event();

        let fields = vec![HeaderField::new(b"x-checksum".as_slice(), b"900150983".as_slice())];
        let mut block = Vec::new();
        client.encoder.encode(&fields, &mut block);
        let mut buf = Vec::new();
        frame::put_header_block(&mut buf, 1, &block, true, 16384);
        server.recv(&buf).unwrap();

        match server.poll_event() {
            Some(ServerEvent::Trailers { stream_id, fields }) => {
                assert_eq!(stream_id, 1);
                assert_eq!(fields[0].name, b"x-checksum");
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn response_trailers_ride_behind_data() {
        let mut server = ServerConnection::new(Settings::server_default());
        let mut client = TestClient::new();
        client.settings.initial_window_size = 4;
        handshake(&mut server, &mut client);

        server.recv(&client.request(1, "/t", true)).unwrap();
        let _ = server.poll_event();

        server.send_headers(1, &[HeaderField::new(b":status".as_slice(), b"200".as_slice())], false).unwrap();
        server.send_data(1, b"12345678".to_vec(), false).unwrap();
        server
            .send_trailers(1, vec![HeaderField::new(b"server-timing".as_slice(), b"total;dur=1".as_slice())])
            .unwrap();

        // Only 4 bytes of data fit; trailers must wait behind the rest.
        let frames = client.read_frames(&server.take_pending_send());
        assert!(frames.iter().any(|f| matches!(f, Frame::Data { payload, .. } if payload.len() == 4)));
        let trailer_frames: Vec<_> = frames
            .iter()
            .filter(|f| matches!(f, Frame::Headers { .. }))
            .collect();
        // First HEADERS (response head) only; the trailer block is queued.
        assert_eq!(trailer_frames.len(), 1);

        let mut wu = Vec::new();
        frame::put_window_update(&mut wu, 1, 100);
        server.recv(&wu).unwrap();
        let frames = client.read_frames(&server.take_pending_send());
        let mut saw_data = false;
        let mut saw_trailers = false;
        for f in &frames {
            match f {
                Frame::Data { payload, .. } => {
                    assert!(!saw_trailers, "trailers emitted before data");
                    assert_eq!(payload.len(), 4);
                    saw_data = true;
                }
                Frame::Headers { fragment, end_stream, .. } => {
                    assert!(saw_data);
                    assert!(end_stream);
                    let fields = client.response_fields(fragment);
                    assert_eq!(fields[0].name, b"server-timing");
                    saw_trailers = true;
                }
                _ => {}
            }
        }
        assert!(saw_data && saw_trailers);
        assert_eq!(server.active_streams(), 0);
    }
}
