//! Per-stream state (RFC 7540 Section 5.1), server side.

use std::collections::VecDeque;

use crate::flowcontrol::FlowWindow;
use crate::hpack::HeaderField;

/// Server-side stream state walk: client HEADERS opens the stream,
/// END_STREAM from either side half-closes it, and a stream is purged from
/// the table once both sides are done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Client HEADERS received; both directions open.
    Open,
    /// Client sent END_STREAM; the response is still being written.
    HalfClosedRemote,
    /// We sent END_STREAM; request body may still be arriving.
    HalfClosedLocal,
    /// Both sides done or the stream was reset.
    Closed,
}

/// An item queued for sending on a stream, drained as flow-control windows
/// allow. Trailers ride behind all queued data so the HPACK encoder sees
/// header blocks in wire order.
#[derive(Debug)]
pub enum Outbound {
    Data { data: Vec<u8>, end_stream: bool },
    Trailers { fields: Vec<HeaderField> },
}

/// One entry in the stream table.
pub(crate) struct Stream {
    pub state: StreamState,
    pub recv_window: FlowWindow,
    pub send_window: FlowWindow,

    /// Accumulates a HEADERS + CONTINUATION block until END_HEADERS.
    pub header_buf: Vec<u8>,
    /// END_STREAM flag observed on the HEADERS that started `header_buf`.
    pub header_block_end_stream: bool,
    /// The initial header block was delivered; a later block is trailers.
    pub saw_request_headers: bool,

    /// Outbound data/trailers waiting for window capacity.
    pub outbound: VecDeque<Outbound>,
    /// Number of queued body bytes (backpressure signal for the driver).
    pub outbound_buffered: usize,
    /// END_STREAM is already queued; further sends are a caller bug.
    pub end_queued: bool,

    /// Received-but-unacknowledged flow bytes, turned into WINDOW_UPDATE
    /// once the consumer releases them.
    pub unreleased: u32,
}

impl Stream {
    pub fn new(recv_window: i64, send_window: i64) -> Self {
        Self {
            state: StreamState::Open,
            recv_window: FlowWindow::new(recv_window),
            send_window: FlowWindow::new(send_window),
            header_buf: Vec::new(),
            header_block_end_stream: false,
            saw_request_headers: false,
            outbound: VecDeque::new(),
            outbound_buffered: 0,
            end_queued: false,
            unreleased: 0,
        }
    }

    /// Record that the peer finished its side.
    pub fn close_remote(&mut self) {
        self.state = match self.state {
            StreamState::HalfClosedLocal | StreamState::Closed => StreamState::Closed,
            _ => StreamState::HalfClosedRemote,
        };
    }

    /// Record that our side is finished.
    pub fn close_local(&mut self) {
        self.state = match self.state {
            StreamState::HalfClosedRemote | StreamState::Closed => StreamState::Closed,
            _ => StreamState::HalfClosedLocal,
        };
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// The peer may still send DATA in this state.
    pub fn accepts_data(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
    }
}
