//! Process-wide server metrics.
//!
//! Registered with metriken for exposition. These aggregate across every
//! `Server` in the process; per-server numbers come from
//! [`crate::stats::ServerStats`], which is incremented at the same sites.

use metriken::{Gauge, metric};

use crate::counter::{Counter, CounterGroup};

static BYTES: CounterGroup = CounterGroup::new();
static REQUESTS: CounterGroup = CounterGroup::new();
static CONNECTIONS: CounterGroup = CounterGroup::new();

/// Slot indices for byte counters.
mod bytes_slot {
    pub const READ: usize = 0;
    pub const SENT: usize = 1;
}

/// Slot indices for request counters.
mod request_slot {
    pub const COMPLETED: usize = 0;
    pub const INVALID: usize = 1;
    pub const REJECTED_OVERLOAD: usize = 2;
    pub const TIMED_OUT: usize = 3;
}

/// Slot indices for connection counters.
mod conn_slot {
    pub const ACCEPTED: usize = 0;
    pub const CLOSED: usize = 1;
    pub const FAILED_TO_CONNECT: usize = 2;
}

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "portside/bytes/read", description = "Total request bytes read")]
pub static BYTES_READ: Counter = Counter::new(&BYTES, bytes_slot::READ);

#[metric(name = "portside/bytes/sent", description = "Total response bytes sent")]
pub static BYTES_SENT: Counter = Counter::new(&BYTES, bytes_slot::SENT);

// ── Requests ─────────────────────────────────────────────────────

#[metric(
    name = "portside/requests/completed",
    description = "Requests that reached a terminal state"
)]
pub static REQUESTS_COMPLETED: Counter = Counter::new(&REQUESTS, request_slot::COMPLETED);

#[metric(
    name = "portside/requests/invalid",
    description = "Requests rejected as malformed or over limits"
)]
pub static INVALID_REQUESTS: Counter = Counter::new(&REQUESTS, request_slot::INVALID);

#[metric(
    name = "portside/requests/rejected_overload",
    description = "Requests rejected because the server was overloaded"
)]
pub static REJECTED_OVERLOAD: Counter = Counter::new(&REQUESTS, request_slot::REJECTED_OVERLOAD);

#[metric(
    name = "portside/requests/timed_out",
    description = "Exchanges that hit an idle, read or write deadline"
)]
pub static REQUESTS_TIMED_OUT: Counter = Counter::new(&REQUESTS, request_slot::TIMED_OUT);

#[metric(
    name = "portside/requests/active",
    description = "Requests currently in flight"
)]
pub static ACTIVE_REQUESTS: Gauge = Gauge::new();

// ── Connections ──────────────────────────────────────────────────

#[metric(
    name = "portside/connections/accepted",
    description = "Connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new(&CONNECTIONS, conn_slot::ACCEPTED);

#[metric(name = "portside/connections/closed", description = "Connections closed")]
pub static CONNECTIONS_CLOSED: Counter = Counter::new(&CONNECTIONS, conn_slot::CLOSED);

#[metric(
    name = "portside/connections/failed_to_connect",
    description = "Connections dropped before a request (TLS or preface failure)"
)]
pub static FAILED_TO_CONNECT: Counter = Counter::new(&CONNECTIONS, conn_slot::FAILED_TO_CONNECT);

#[metric(
    name = "portside/connections/active",
    description = "Connections currently open"
)]
pub static ACTIVE_CONNECTIONS: Gauge = Gauge::new();
