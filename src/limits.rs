//! Pipeline, connection, and server limits.
//!
//! Defaults are intentionally conservative: every queue in the pipeline is
//! bounded, every body is capped, and every connection has a finite lifetime.

use std::time::Duration;

/// Limits applied to every stream flowing through the pipeline.
///
/// One copy lives on the [`Http`](crate::Http) runtime handle and is consulted
/// by the tail filter, the net connector, and the session store.
#[derive(Debug, Clone)]
pub struct HttpLimits {
    /// Maximum size of a buffered (form-style or opaque) request body
    /// (default: `64 KiB`). Enforced by the tail filter on the incoming side.
    pub rx_form_size: usize,

    /// Maximum size of a transmitted response body (default: `8 MiB`).
    /// Enforced both by the tail filter as packets are queued and by the net
    /// connector before each vectored write.
    pub tx_body_size: u64,

    /// Maximum header block size when serialising response headers
    /// (default: `16 KiB`).
    pub header_size: usize,

    /// Maximum number of request headers (default: `64`).
    pub header_count: usize,

    /// Maximum request-target length (default: `2 KiB`).
    pub uri_size: usize,

    /// Largest packet any downstream queue will accept in one piece
    /// (default: `8 KiB`). Oversized packets are split.
    pub packet_size: usize,

    /// Per-queue buffering high-water mark in content bytes (default: `32 KiB`).
    /// A queue refuses further packets once `count` reaches this level.
    pub queue_max: usize,

    /// Maximum number of live sessions across the shared cache (default: `100`).
    /// Breaching it fails session creation with 503.
    pub session_max: usize,

    /// Session lifespan in the shared TTL cache (default: `30 minutes`).
    pub session_lifespan: Duration,

    /// Initial HTTP/2 per-stream send window (default: `65_535`).
    pub stream_window: i64,

    /// HPACK dynamic table byte budget (default: `4096`).
    pub header_table_size: usize,

    /// Requests allowed on one connection before keep-alive is disabled
    /// (default: `100`).
    pub keep_alive_max: u32,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for HttpLimits {
    fn default() -> Self {
        Self {
            rx_form_size: 64 * 1024,
            tx_body_size: 8 * 1024 * 1024,
            header_size: 16 * 1024,
            header_count: 64,
            uri_size: 2 * 1024,
            packet_size: 8 * 1024,
            queue_max: 32 * 1024,
            session_max: 100,
            session_lifespan: Duration::from_secs(30 * 60),
            stream_window: 65_535,
            header_table_size: 4096,
            keep_alive_max: 100,
            _priv: (),
        }
    }
}

/// Worker-pool sizing and overload behaviour.
///
/// Accepted connections pass through a bounded admission ring before a
/// worker picks them up. The ring is the only buffering between the
/// acceptor and the pool: once it fills, new connections are refused on the
/// spot rather than parked without bound.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Worker tasks serving connections, created once at startup
    /// (default: `64`).
    pub workers: usize,

    /// Capacity of the admission ring between the acceptor and the workers
    /// (default: `512`).
    pub admission_backlog: usize,

    /// Answer ring overflow with a canned 503 before closing. When `false`
    /// overflow connections are dropped silently (default: `true`).
    pub reject_overflow: bool,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            workers: 64,
            admission_backlog: 512,
            reject_overflow: true,
        }
    }
}

/// Per-connection timeouts and lifetime caps.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Read inactivity timeout (default: `10 seconds`).
    pub socket_read_timeout: Duration,

    /// Write progress timeout (default: `10 seconds`).
    pub socket_write_timeout: Duration,

    /// Hard cap on connection lifetime (default: `2 minutes`).
    pub connection_lifetime: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_read_timeout: Duration::from_secs(10),
            socket_write_timeout: Duration::from_secs(10),
            connection_lifetime: Duration::from_secs(120),
            _priv: (),
        }
    }
}
