//! Terminal handlers: pass, error, and action.
//!
//! The pass handler relays content and finalizes the exchange; it also
//! answers TRACE and OPTIONS for every route. The error handler is the pass
//! handler with an implicit 503. The action handler maps the request path to
//! a registered callable.

use crate::{
    errors::{status, Fault},
    pipeline::{
        packet::Packet,
        stage::{Stage, StageKind},
        stream::Stream,
    },
};
use std::{collections::HashMap, sync::RwLock};

pub type Action = Box<dyn Fn(&mut Stream) + Send + Sync>;

/// Relays all content to the network connector. Used as the error handler
/// alias and when a route defines no handler.
pub struct PassHandler {
    name: &'static str,
    implicit_error: bool,
}

impl PassHandler {
    pub fn pass() -> Self {
        PassHandler {
            name: "passHandler",
            implicit_error: false,
        }
    }

    pub fn error_alias() -> Self {
        PassHandler {
            name: "errorHandler",
            implicit_error: true,
        }
    }
}

impl Stage for PassHandler {
    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Handler
    }

    fn start(&self, stream: &mut Stream) {
        if stream.rx.method == "TRACE" {
            handle_trace(stream);
        }
    }

    fn ready(&self, stream: &mut Stream) {
        if self.implicit_error && !stream.error {
            stream.error(
                Fault::status(status::SERVICE_UNAVAILABLE),
                "The requested resource is not available",
            );
        }
        if stream.rx.method == "OPTIONS" {
            handle_options(stream);
        }
        stream.finalize();
    }
}

/// OPTIONS: advertise the route's permitted methods.
pub(crate) fn handle_options(stream: &mut Stream) {
    let methods = stream
        .rx
        .route
        .as_ref()
        .map(|r| r.methods_string())
        .unwrap_or_default();
    stream.tx.headers.set("allow", methods);
    stream.tx.length = Some(0);
    stream.tx.no_body = true;
}

/// TRACE: echo the request head back as a `message/http` body.
pub(crate) fn handle_trace(stream: &mut Stream) {
    let echo = stream.rx.head_text();
    stream.tx.headers.set("content-type", "message/http");
    stream.tx.length = Some(echo.len() as u64);
    stream.write_packet(Packet::data(echo.as_bytes()));
    stream.finalize();
}

/// Maps `rx.path_info` to a registered callable.
pub struct ActionHandler {
    actions: RwLock<HashMap<String, Action>>,
}

impl ActionHandler {
    pub fn new() -> Self {
        ActionHandler {
            actions: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a callable under a path. Later definitions replace earlier
    /// ones.
    pub fn define(&self, name: impl Into<String>, action: Action) {
        self.actions
            .write()
            .expect("action table poisoned")
            .insert(name.into(), action);
    }
}

impl Default for ActionHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for ActionHandler {
    fn name(&self) -> &'static str {
        "actionHandler"
    }

    fn kind(&self) -> StageKind {
        StageKind::Handler
    }

    fn ready(&self, stream: &mut Stream) {
        let name = stream.rx.path_info.clone();
        let actions = self.actions.read().expect("action table poisoned");
        match actions.get(&name) {
            Some(action) => action(stream),
            None => {
                drop(actions);
                stream.error(
                    Fault::status(status::NOT_FOUND),
                    format!("Cannot find action: {name}"),
                );
            }
        }
    }
}
