//! conduit_web - Embeddable staged-pipeline HTTP server core
//!
//! An HTTP/1.x server core organised as a bidirectional pipeline of bounded
//! queues, with the HTTP/2 session plumbing (HPACK header table, per-stream
//! flow-control admission, GOAWAY) needed to sit under a framing layer.
//!
//! # Architecture
//!
//! Every exchange is a [`Stream`] owning its pipeline of [`Stage`]s: a
//! terminal handler, optional filters (byte ranges), and the tail filter,
//! draining into a per-connection network output queue serviced by the net
//! connector with vectored writes.
//!
//! - **Back-pressure everywhere** - every queue is bounded; producers are
//!   suspended, never buffered without limit.
//! - **Partial-write recovery** - the scatter/gather vector carries residue
//!   across socket readiness events.
//! - **Alternate error bodies** - errors before headers synthesise a small
//!   response; errors after headers tear the connection down honestly.
//! - **Sessions and identities** - cookie-bound sessions over a shared TTL
//!   cache, users and roles expanded to ability sets.
//!
//! # Quick Start
//!
//! ```no_run
//! use conduit_web::{Route, Server, server::bind};
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(bind("127.0.0.1:8080".parse().unwrap()).unwrap())
//!         .route(Route::default())
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```
//!
//! Custom behaviour hangs off the stage registry: register a
//! [`Stage`] on the [`Http`] handle and point a [`Route`] at it, or map
//! paths to callables through the action handler.
pub(crate) mod pipeline {
    pub(crate) mod packet;
    pub(crate) mod queue;
    pub(crate) mod stage;
    pub(crate) mod stream;
}
pub(crate) mod net {
    pub(crate) mod connection;
    pub(crate) mod connector;
    pub(crate) mod http1;
}
pub(crate) mod filters {
    pub(crate) mod range;
    pub(crate) mod tail;
}
pub(crate) mod auth {
    pub(crate) mod basic;
    pub(crate) mod user;
}
pub(crate) mod clf;
pub(crate) mod errors;
pub(crate) mod handlers;
pub(crate) mod hpack;
pub mod limits;
pub(crate) mod route;
pub(crate) mod runtime;
pub(crate) mod session;
pub(crate) mod uri;

pub mod server {
    pub(crate) mod pool;
    pub use pool::{bind, Router, SingleRoute};
}

pub use crate::{
    auth::{
        basic::decode_credentials,
        user::{Auth, Role, User},
    },
    clf::{format_access_log, LogPeer, COMMON_LOG_FORMAT},
    errors::{status, ErrorKind, Fault},
    handlers::{Action, ActionHandler, PassHandler},
    hpack::{HeaderTable, HEADER_OVERHEAD},
    net::connection::{NetChannel, NetConnection, Protocol},
    pipeline::{
        packet::{Packet, PacketKind},
        queue::Queue,
        stage::{Direction, Stage, StageKind, StageMatch},
        stream::{Headers, Rx, Stream, StreamEvent, StreamState, Tx},
    },
    route::Route,
    runtime::{Counter, Http},
    server::pool::{Server, ServerBuilder},
    session::{Session, TtlCache, SESSION_COOKIE},
    uri::{normalize_uri_path, validate_uri_path},
};
pub use filters::range::{parse_range_header, ByteRange, RangeFilter};
pub use filters::tail::TailFilter;
