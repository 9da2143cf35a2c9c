//! Per-request exchange state and the application-facing async contract.
//!
//! An exchange is one request/response pair. The connection driver owns
//! the socket and the [`Exchange`] state machine; handlers interact
//! through three narrow channels:
//!
//! - response commands ([`ResponseCmd`]) flow handler -> driver over an
//!   unbounded FIFO, which is what serialises writes even when they are
//!   issued from arbitrary threads;
//! - request body bytes flow driver -> handler through a [`BodyReader`],
//!   whose pull-acknowledgement is the inbound flow-control signal;
//! - completion listeners and the terminal outcome live in the shared
//!   exchange cell.
//!
//! The [`AsyncHandle`] is the escape hatch for handlers that finish after
//! returning: writes stay ordered, `complete` is idempotent, and a body
//! listener receives chunks strictly in order with exactly one
//! outstanding acknowledgement.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use portside_h1::HeaderList;
use tokio::sync::{mpsc, oneshot};

use crate::error::Error;
use crate::exec::ExecHandle;
use crate::headers::HeaderMap;

/// Identifies an exchange within its connection (H2: the stream id).
pub type ExchangeId = u64;

/// Exchange lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    RequestHeadersReceived,
    RequestBodyStreaming,
    RequestComplete,
    ResponseHeadersSent,
    ResponseBodyStreaming,
    Complete,
    Errored,
    TimedOut,
    ClientDisconnected,
}

impl ExchangeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExchangeState::Complete
                | ExchangeState::Errored
                | ExchangeState::TimedOut
                | ExchangeState::ClientDisconnected
        )
    }
}

/// What completion listeners observe.
#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    pub state: ExchangeState,
    pub error: Option<String>,
}

/// Listener invoked exactly once at the exchange's terminal transition.
pub type CompletionListener = Box<dyn FnOnce(&ExchangeOutcome) + Send>;

/// Commands from the response side to the connection driver.
pub(crate) enum ResponseCmd {
    /// Entire response in one shot.
    Full {
        status: u16,
        headers: HeaderList,
        body: Bytes,
    },
    /// Begin streaming: head now, body writes follow.
    Start { status: u16, headers: HeaderList },
    /// One body write. `ack` resolves once the bytes reached the socket
    /// (or the transport failed), providing write backpressure.
    Chunk {
        data: Bytes,
        ack: Option<oneshot::Sender<Result<(), Error>>>,
    },
    /// The handler is done. `status`/`headers` carry the response snapshot
    /// for the nothing-written-yet default paths.
    Complete {
        error: Option<Error>,
        status: Option<u16>,
        headers: HeaderList,
    },
    /// Abort with 503 (+ optional Retry-After seconds).
    Cancel { retry_after_secs: Option<u64> },
}

/// State shared between the driver and the request/response facades.
pub(crate) struct ExchangeShared {
    pub id: ExchangeId,
    pub cmd_tx: mpsc::UnboundedSender<(ExchangeId, ResponseCmd)>,
    pub async_claimed: AtomicBool,
    pub completed: AtomicBool,
    pub response_started: AtomicBool,
    pub trailers: Mutex<HeaderList>,
    listeners: Mutex<ListenerCell>,
}

enum ListenerCell {
    Waiting(Vec<CompletionListener>),
    Done(ExchangeOutcome),
}

impl ExchangeShared {
    pub fn new(id: ExchangeId, cmd_tx: mpsc::UnboundedSender<(ExchangeId, ResponseCmd)>) -> Arc<Self> {
        Arc::new(Self {
            id,
            cmd_tx,
            async_claimed: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            response_started: AtomicBool::new(false),
            trailers: Mutex::new(Vec::new()),
            listeners: Mutex::new(ListenerCell::Waiting(Vec::new())),
        })
    }

    pub fn send(&self, cmd: ResponseCmd) {
        // A closed channel means the driver is gone; the exchange outcome
        // was already decided.
        let _ = self.cmd_tx.send((self.id, cmd));
    }

    /// Register a completion listener; fires immediately when the
    /// exchange already ended.
    pub fn add_completion_listener(&self, listener: CompletionListener) {
        let mut cell = self.listeners.lock().expect("listener lock");
        match &mut *cell {
            ListenerCell::Waiting(list) => list.push(listener),
            ListenerCell::Done(outcome) => {
                let outcome = outcome.clone();
                drop(cell);
                listener(&outcome);
            }
        }
    }

    /// Resolve listeners with the terminal outcome.
    fn fire_listeners(&self, outcome: &ExchangeOutcome) {
        let drained = {
            let mut cell = self.listeners.lock().expect("listener lock");
            match std::mem::replace(&mut *cell, ListenerCell::Done(outcome.clone())) {
                ListenerCell::Waiting(list) => list,
                ListenerCell::Done(_) => Vec::new(),
            }
        };
        for listener in drained {
            listener(outcome);
        }
    }
}

/// Driver-side exchange state machine.
///
/// The response-side state never regresses, and exactly one terminal
/// transition fires listeners. Request-side completion is tracked
/// separately because the response may start while the body is still
/// streaming in.
pub(crate) struct Exchange {
    state: ExchangeState,
    request_complete: bool,
    shared: Arc<ExchangeShared>,
}

impl Exchange {
    pub fn new(shared: Arc<ExchangeShared>) -> Self {
        Self {
            state: ExchangeState::RequestHeadersReceived,
            request_complete: false,
            shared,
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn shared(&self) -> &Arc<ExchangeShared> {
        &self.shared
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn request_is_complete(&self) -> bool {
        self.request_complete
    }

    pub fn response_started(&self) -> bool {
        self.shared.response_started.load(Ordering::Acquire)
    }

    pub fn on_request_body_streaming(&mut self) {
        if self.state == ExchangeState::RequestHeadersReceived {
            self.state = ExchangeState::RequestBodyStreaming;
        }
    }

    pub fn on_request_complete(&mut self) {
        self.request_complete = true;
        if matches!(
            self.state,
            ExchangeState::RequestHeadersReceived | ExchangeState::RequestBodyStreaming
        ) {
            self.state = ExchangeState::RequestComplete;
        }
    }

    /// First response byte hit the wire.
    pub fn on_response_headers_sent(&mut self) {
        if !self.is_terminal() {
            self.state = ExchangeState::ResponseHeadersSent;
            self.shared.response_started.store(true, Ordering::Release);
        }
    }

    pub fn on_response_body_streaming(&mut self) {
        if self.state == ExchangeState::ResponseHeadersSent {
            self.state = ExchangeState::ResponseBodyStreaming;
        }
    }

    /// Drive the exchange to a terminal state. Returns false when a
    /// terminal transition already happened (the call is ignored).
    pub fn finish(&mut self, terminal: ExchangeState, error: Option<String>) -> bool {
        debug_assert!(terminal.is_terminal());
        if self.is_terminal() {
            return false;
        }
        self.state = terminal;
        self.shared.completed.store(true, Ordering::Release);
        let outcome = ExchangeOutcome {
            state: terminal,
            error,
        };
        self.shared.fire_listeners(&outcome);
        true
    }
}

// -- Request body plumbing --

/// Driver -> application body events.
pub(crate) enum BodyEvent {
    Chunk { data: Bytes, flow: u32 },
    Trailers(HeaderList),
    End,
    Error(Error),
}

/// Pull-based request body.
///
/// Each `next_chunk` acknowledges the previous chunk back to the driver,
/// which releases inbound flow-control capacity; a consumer that stops
/// pulling stops the peer from sending. Blocking API: call from handler
/// (application-executor) threads only.
pub struct BodyReader {
    rx: mpsc::UnboundedReceiver<BodyEvent>,
    release_tx: mpsc::UnboundedSender<(ExchangeId, u32)>,
    id: ExchangeId,
    pending_release: u32,
    trailers: Option<HeaderMap>,
    finished: bool,
}

impl BodyReader {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<BodyEvent>,
        release_tx: mpsc::UnboundedSender<(ExchangeId, u32)>,
        id: ExchangeId,
    ) -> Self {
        Self {
            rx,
            release_tx,
            id,
            pending_release: 0,
            trailers: None,
            finished: false,
        }
    }

    /// A reader that is already at end-of-body.
    pub(crate) fn empty() -> Self {
        let (_tx, rx) = mpsc::unbounded_channel();
        let (release_tx, _release_rx) = mpsc::unbounded_channel();
        Self {
            rx,
            release_tx,
            id: 0,
            pending_release: 0,
            trailers: None,
            finished: true,
        }
    }

    fn release_pending(&mut self) {
        if self.pending_release > 0 {
            let _ = self.release_tx.send((self.id, self.pending_release));
            self.pending_release = 0;
        }
    }

    /// Next run of body bytes, or `None` at end of body.
    pub fn next_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        if self.finished {
            return Ok(None);
        }
        self.release_pending();
        loop {
            match self.rx.blocking_recv() {
                Some(BodyEvent::Chunk { data, flow }) => {
                    self.pending_release = flow;
                    return Ok(Some(data));
                }
                Some(BodyEvent::Trailers(trailers)) => {
                    self.trailers = Some(HeaderMap::from(trailers));
                }
                Some(BodyEvent::End) | None => {
                    self.finished = true;
                    return Ok(None);
                }
                Some(BodyEvent::Error(e)) => {
                    self.finished = true;
                    return Err(e);
                }
            }
        }
    }

    /// Collect the whole body, failing with 413 past `limit` bytes.
    pub fn read_to_vec(&mut self, limit: usize) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk()? {
            if out.len() + chunk.len() > limit {
                return Err(Error::InvalidRequest {
                    status: 413,
                    detail: "request body exceeds limit".into(),
                });
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Trailer fields, available once the body has been fully consumed.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

// -- Push-based body listener --

/// Acknowledgement token for one delivered body chunk. Dropping it
/// without an explicit call counts as success, so a listener cannot
/// deadlock the connection by forgetting it.
pub struct DoneAck {
    tx: Option<oneshot::Sender<Result<(), Error>>>,
}

impl DoneAck {
    fn new(tx: oneshot::Sender<Result<(), Error>>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn done(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Ok(()));
        }
    }

    pub fn done_with_error(mut self, error: Error) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(error));
        }
    }
}

impl Drop for DoneAck {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Ok(()));
        }
    }
}

/// Push-style request body consumer for async handlers.
///
/// Chunks arrive strictly in stream order with exactly one outstanding
/// acknowledgement; `on_complete` or `on_error` is called at most once.
pub trait RequestBodyListener: Send + 'static {
    fn on_data_received(&mut self, data: Bytes, done: DoneAck);
    fn on_complete(&mut self);
    fn on_error(&mut self, error: Error);
}

// -- Async handle --

type WriteCallback = Box<dyn FnOnce(Result<(), Error>) + Send>;

struct CallbackQueue {
    items: VecDeque<(oneshot::Receiver<Result<(), Error>>, WriteCallback)>,
    draining: bool,
}

struct AsyncInner {
    shared: Arc<ExchangeShared>,
    body: Mutex<Option<BodyReader>>,
    exec: ExecHandle,
    callbacks: Mutex<CallbackQueue>,
}

/// Handle for completing an exchange after the handler has returned.
///
/// Cloneable and sendable across threads; all writes funnel through the
/// exchange's command channel in call order.
#[derive(Clone)]
pub struct AsyncHandle {
    inner: Arc<AsyncInner>,
}

impl AsyncHandle {
    pub(crate) fn new(shared: Arc<ExchangeShared>, body: BodyReader, exec: ExecHandle) -> Self {
        shared.async_claimed.store(true, Ordering::Release);
        Self {
            inner: Arc::new(AsyncInner {
                shared,
                body: Mutex::new(Some(body)),
                exec,
                callbacks: Mutex::new(CallbackQueue {
                    items: VecDeque::new(),
                    draining: false,
                }),
            }),
        }
    }

    fn send_chunk(&self, data: Bytes) -> oneshot::Receiver<Result<(), Error>> {
        let (tx, rx) = oneshot::channel();
        self.inner.shared.send(ResponseCmd::Chunk {
            data,
            ack: Some(tx),
        });
        rx
    }

    /// Write response bytes; resolves once they reach the socket.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        let rx = self.send_chunk(data.into());
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ClientDisconnected),
        }
    }

    /// Blocking flavour of [`Self::write`] for executor threads.
    pub fn write_blocking(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        let rx = self.send_chunk(data.into());
        match rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(Error::ClientDisconnected),
        }
    }

    /// Callback flavour: `done` runs on the application executor once the
    /// write completes. Callbacks for successive writes run in write
    /// order, never concurrently for the same exchange.
    pub fn write_with(
        &self,
        data: impl Into<Bytes>,
        done: impl FnOnce(Result<(), Error>) + Send + 'static,
    ) {
        let rx = self.send_chunk(data.into());
        let start_drainer = {
            let mut queue = self.inner.callbacks.lock().expect("callback lock");
            queue.items.push_back((rx, Box::new(done)));
            if queue.draining {
                false
            } else {
                queue.draining = true;
                true
            }
        };
        if start_drainer {
            let inner = Arc::clone(&self.inner);
            let submitted = self.inner.exec.submit(Box::new(move || {
                loop {
                    let next = {
                        let mut queue = inner.callbacks.lock().expect("callback lock");
                        match queue.items.pop_front() {
                            Some(item) => item,
                            None => {
                                queue.draining = false;
                                return;
                            }
                        }
                    };
                    let (rx, callback) = next;
                    let result = match rx.blocking_recv() {
                        Ok(result) => result,
                        Err(_) => Err(Error::ClientDisconnected),
                    };
                    callback(result);
                }
            }));
            if submitted.is_err() {
                let mut queue = self.inner.callbacks.lock().expect("callback lock");
                queue.draining = false;
            }
        }
    }

    /// Finish the exchange. Idempotent: calls after the first are ignored.
    pub fn complete(&self) {
        if !self.inner.shared.completed.swap(true, Ordering::AcqRel) {
            self.inner.shared.send(ResponseCmd::Complete {
                error: None,
                status: None,
                headers: Vec::new(),
            });
        }
    }

    /// Finish the exchange with an error, mapped by the same policy as a
    /// synchronous handler failure.
    pub fn complete_with_error(&self, error: Error) {
        if !self.inner.shared.completed.swap(true, Ordering::AcqRel) {
            self.inner.shared.send(ResponseCmd::Complete {
                error: Some(error),
                status: None,
                headers: Vec::new(),
            });
        }
    }

    /// Abort with 503 and an optional `Retry-After`.
    pub fn cancel(&self, retry_after: Option<std::time::Duration>) {
        if !self.inner.shared.completed.swap(true, Ordering::AcqRel) {
            self.inner.shared.send(ResponseCmd::Cancel {
                retry_after_secs: retry_after.map(|d| d.as_secs()),
            });
        }
    }

    /// Stream the request body into `listener` on the application
    /// executor. When the body is already complete, `on_complete` fires
    /// immediately with no data.
    pub fn set_read_listener(&self, mut listener: Box<dyn RequestBodyListener>) {
        let taken = self.inner.body.lock().expect("body lock").take();
        let mut reader = match taken {
            Some(reader) => reader,
            None => {
                listener.on_error(Error::Internal("read listener already set".into()));
                return;
            }
        };

        let handle = self.clone();
        let submitted = self.inner.exec.submit(Box::new(move || {
            loop {
                match reader.next_chunk() {
                    Ok(Some(data)) => {
                        let (tx, rx) = oneshot::channel();
                        listener.on_data_received(data, DoneAck::new(tx));
                        match rx.blocking_recv() {
                            Ok(Ok(())) | Err(_) => continue,
                            Ok(Err(error)) => {
                                handle.complete_with_error(error);
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        listener.on_complete();
                        return;
                    }
                    Err(error) => {
                        listener.on_error(error);
                        return;
                    }
                }
            }
        }));
        if let Err(error) = submitted {
            // Listener already moved into the rejected job; nothing to
            // notify. Fail the exchange instead.
            self.complete_with_error(error);
        }
    }

    /// Run `listener` when the exchange reaches its terminal state.
    pub fn add_response_complete_listener(&self, listener: CompletionListener) {
        self.inner.shared.add_completion_listener(listener);
    }

    /// Take the request body reader for direct (pull) consumption.
    pub fn take_body(&self) -> Option<BodyReader> {
        self.inner.body.lock().expect("body lock").take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_pair() -> (
        Arc<ExchangeShared>,
        mpsc::UnboundedReceiver<(ExchangeId, ResponseCmd)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ExchangeShared::new(7, tx), rx)
    }

    #[test]
    fn response_state_never_regresses() {
        let (shared, _rx) = shared_pair();
        let mut ex = Exchange::new(shared);
        assert_eq!(ex.state(), ExchangeState::RequestHeadersReceived);
        ex.on_request_body_streaming();
        assert_eq!(ex.state(), ExchangeState::RequestBodyStreaming);
        ex.on_response_headers_sent();
        assert_eq!(ex.state(), ExchangeState::ResponseHeadersSent);
        // Late request completion is tracked without regressing.
        ex.on_request_complete();
        assert_eq!(ex.state(), ExchangeState::ResponseHeadersSent);
        assert!(ex.request_is_complete());
        ex.on_response_body_streaming();
        assert_eq!(ex.state(), ExchangeState::ResponseBodyStreaming);
    }

    #[test]
    fn exactly_one_terminal_transition() {
        let (shared, _rx) = shared_pair();
        let mut ex = Exchange::new(shared);
        assert!(ex.finish(ExchangeState::Complete, None));
        assert!(!ex.finish(ExchangeState::Errored, Some("late".into())));
        assert_eq!(ex.state(), ExchangeState::Complete);
    }

    #[test]
    fn listeners_fire_once_with_outcome() {
        use std::sync::atomic::AtomicU32;

        let (shared, _rx) = shared_pair();
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        shared.add_completion_listener(Box::new(move |outcome| {
            assert_eq!(outcome.state, ExchangeState::TimedOut);
            c.fetch_add(1, Ordering::SeqCst);
        }));

        let mut ex = Exchange::new(Arc::clone(&shared));
        ex.finish(ExchangeState::TimedOut, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A listener added after the terminal transition fires immediately.
        let c = Arc::clone(&calls);
        shared.add_completion_listener(Box::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn body_reader_pull_acks_previous_chunk() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (release_tx, mut release_rx) = mpsc::unbounded_channel();
        let mut reader = BodyReader::new(rx, release_tx, 9);

        tx.send(BodyEvent::Chunk {
            data: Bytes::from_static(b"one"),
            flow: 3,
        })
        .unwrap();
        tx.send(BodyEvent::Chunk {
            data: Bytes::from_static(b"two"),
            flow: 3,
        })
        .unwrap();
        tx.send(BodyEvent::End).unwrap();

        assert_eq!(reader.next_chunk().unwrap().unwrap(), "one");
        assert!(release_rx.try_recv().is_err(), "no release before pull");
        assert_eq!(reader.next_chunk().unwrap().unwrap(), "two");
        assert_eq!(release_rx.try_recv().unwrap(), (9, 3));
        assert!(reader.next_chunk().unwrap().is_none());
        assert!(reader.is_finished());
    }

    #[test]
    fn body_reader_collects_trailers() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (release_tx, _release_rx) = mpsc::unbounded_channel();
        let mut reader = BodyReader::new(rx, release_tx, 1);

        tx.send(BodyEvent::Chunk {
            data: Bytes::from_static(b"x"),
            flow: 1,
        })
        .unwrap();
        tx.send(BodyEvent::Trailers(vec![("x-sum".into(), "1".into())]))
            .unwrap();
        tx.send(BodyEvent::End).unwrap();

        assert!(reader.next_chunk().unwrap().is_some());
        assert!(reader.next_chunk().unwrap().is_none());
        assert_eq!(reader.trailers().unwrap().get("x-sum"), Some("1"));
    }

    #[test]
    fn read_to_vec_enforces_limit() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (release_tx, _release_rx) = mpsc::unbounded_channel();
        let mut reader = BodyReader::new(rx, release_tx, 1);
        tx.send(BodyEvent::Chunk {
            data: Bytes::from_static(b"0123456789"),
            flow: 10,
        })
        .unwrap();
        drop(tx);
        let err = reader.read_to_vec(5).unwrap_err();
        assert_eq!(err.response_status(), 413);
    }

    #[test]
    fn complete_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared = ExchangeShared::new(1, tx);
        let exec = ExecHandle::inline_for_tests();
        let handle = AsyncHandle::new(shared, BodyReader::empty(), exec);

        handle.complete();
        handle.complete();
        handle.complete_with_error(Error::Internal("late".into()));

        let mut completes = 0;
        while let Ok((_, cmd)) = rx.try_recv() {
            if matches!(cmd, ResponseCmd::Complete { .. }) {
                completes += 1;
            }
        }
        assert_eq!(completes, 1);
    }

    #[test]
    fn read_listener_on_complete_fires_for_finished_body() {
        use std::sync::atomic::AtomicBool;

        let (tx, _rx) = mpsc::unbounded_channel();
        let shared = ExchangeShared::new(1, tx);
        let exec = ExecHandle::inline_for_tests();
        let handle = AsyncHandle::new(shared, BodyReader::empty(), exec);

        struct Probe {
            complete: Arc<AtomicBool>,
        }
        impl RequestBodyListener for Probe {
            fn on_data_received(&mut self, _data: Bytes, _done: DoneAck) {
                panic!("no data expected");
            }
            fn on_complete(&mut self) {
                self.complete.store(true, Ordering::SeqCst);
            }
            fn on_error(&mut self, _error: Error) {
                panic!("no error expected");
            }
        }

        let complete = Arc::new(AtomicBool::new(false));
        handle.set_read_listener(Box::new(Probe {
            complete: Arc::clone(&complete),
        }));
        assert!(complete.load(Ordering::SeqCst));
    }
}
