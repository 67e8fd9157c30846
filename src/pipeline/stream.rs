//! A stream is one HTTP request/response exchange.
//!
//! The stream exclusively owns its pipeline queues; the network connection
//! owns its streams and drops them on completion. Stages are shared,
//! stateless singletons; everything mutable lives here.

use crate::{
    errors::{status, Fault},
    filters::range::ByteRange,
    limits::HttpLimits,
    net::connection::{NetChannel, Protocol},
    pipeline::{
        packet::Packet,
        queue::Queue,
        stage::{Direction, Stage, StageMatch},
    },
    route::Route,
    runtime::{Counter, Http},
    session::Session,
    Auth, User,
};
use std::{sync::Arc, time::Instant};

/// Stream lifecycle. Terminal transitions also flow from any non-terminal
/// state to `Complete` via abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StreamState {
    Begin,
    Connected,
    /// Request line seen.
    First,
    /// Headers parsed.
    Parsed,
    /// Body in flight.
    Content,
    /// The application can respond.
    Ready,
    /// Response in flight.
    Running,
    Finalized,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    Readable,
    Writable,
    Error,
    Complete,
}

/// Ordered response/request header collection with case-insensitive names.
#[derive(Debug, Default)]
pub struct Headers {
    items: Vec<(String, String)>,
}

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Sets a header, replacing any existing value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .items
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(slot) => slot.1 = value,
            None => self.items.push((name.to_string(), value)),
        }
    }

    /// Appends a header without replacing earlier values.
    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        self.items.push((name.to_string(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.items.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Request side of the exchange.
#[derive(Debug)]
pub struct Rx {
    pub method: String,
    pub uri: String,
    /// Trailing path used by the action handler to select a callable.
    pub path_info: String,
    pub version: String,
    pub headers: Headers,
    pub eof: bool,
    pub(crate) net_eof: bool,
    pub(crate) end_input: bool,
    pub(crate) session: Option<Session>,
    pub(crate) session_probed: bool,
    pub route: Option<Arc<Route>>,
    pub content_length: Option<u64>,
    /// Form-style request whose body is aggregated before dispatch.
    pub form: bool,
    /// Body is streamed to the handler rather than buffered.
    pub streaming: bool,
    /// Value of the `Authorization` header after the `basic` scheme token.
    pub auth_details: Option<String>,
    pub accept: Option<String>,
    /// Client-side response status.
    pub status: u16,
}

impl Rx {
    fn new() -> Self {
        Rx {
            method: String::new(),
            uri: String::new(),
            path_info: String::new(),
            version: "HTTP/1.1".to_string(),
            headers: Headers::default(),
            eof: false,
            net_eof: false,
            end_input: false,
            session: None,
            session_probed: false,
            route: None,
            content_length: None,
            form: false,
            streaming: true,
            auth_details: None,
            accept: None,
            status: 0,
        }
    }

    /// Request head echoed for TRACE responses.
    pub(crate) fn head_text(&self) -> String {
        let mut text = format!("{} {} {}\r\n", self.method, self.uri, self.version);
        for (name, value) in self.headers.iter() {
            text.push_str(name);
            text.push_str(": ");
            text.push_str(value);
            text.push_str("\r\n");
        }
        text.push_str("\r\n");
        text
    }
}

/// Response side of the exchange.
#[derive(Debug)]
pub struct Tx {
    pub status: u16,
    pub headers: Headers,
    /// Server-synthesised body used when the stream has errored and headers
    /// have not yet been sent.
    pub alt_body: Option<String>,
    /// Wire bytes written by the net connector, headers included.
    pub bytes_written: u64,
    pub header_size: usize,
    /// Body bytes accepted into the outgoing pipeline by the tail filter.
    pub(crate) queued_body: u64,
    pub output_ranges: Vec<ByteRange>,
    pub range_boundary: Option<String>,
    pub(crate) current_range: usize,
    pub(crate) range_pos: u64,
    pub(crate) chunked: bool,
    pub(crate) chunk_started: bool,
    pub entity_length: Option<u64>,
    pub length: Option<u64>,
    pub headers_created: bool,
    pub no_body: bool,
    pub no_length: bool,
    pub sendfile: bool,
    pub finalized: bool,
    pub finalized_output: bool,
    pub finalized_connector: bool,
    /// Error document to re-dispatch internally on completion.
    pub error_document: Option<String>,
    /// HTTP/2 per-stream send window from peer WINDOW_UPDATEs.
    pub window: i64,
}

impl Tx {
    fn new(window: i64) -> Self {
        Tx {
            status: status::OK,
            headers: Headers::default(),
            alt_body: None,
            bytes_written: 0,
            header_size: 0,
            queued_body: 0,
            output_ranges: Vec::new(),
            range_boundary: None,
            current_range: 0,
            range_pos: 0,
            chunked: false,
            chunk_started: false,
            entity_length: None,
            length: None,
            headers_created: false,
            no_body: false,
            no_length: false,
            sendfile: false,
            finalized: false,
            finalized_output: false,
            finalized_connector: false,
            error_document: None,
            window,
        }
    }
}

pub struct Stream {
    pub(crate) http: Arc<Http>,
    pub rx: Rx,
    pub tx: Tx,
    state: StreamState,
    pub error: bool,
    pub error_msg: Option<String>,
    pub keep_alive_count: u32,
    pub disconnect: bool,
    pub user: Option<Arc<User>>,
    /// Credentials still base64-encoded.
    pub encoded: bool,
    server: bool,
    pub(crate) protocol: Protocol,
    tx_stages: Vec<Arc<dyn Stage>>,
    tx_queues: Vec<Queue>,
    rx_stages: Vec<Arc<dyn Stage>>,
    rx_queues: Vec<Queue>,
    pub(crate) net_packet_size: usize,
    events: Vec<StreamEvent>,
    pub last_activity: Instant,
}

impl Stream {
    pub fn new_server(http: &Arc<Http>, protocol: Protocol) -> Self {
        Self::new(http, protocol, true)
    }

    pub fn new_client(http: &Arc<Http>, protocol: Protocol) -> Self {
        Self::new(http, protocol, false)
    }

    fn new(http: &Arc<Http>, protocol: Protocol, server: bool) -> Self {
        let limits = &http.limits;
        let mut stream = Stream {
            http: http.clone(),
            rx: Rx::new(),
            tx: Tx::new(limits.stream_window),
            state: StreamState::Begin,
            error: false,
            error_msg: None,
            keep_alive_count: limits.keep_alive_max,
            disconnect: false,
            user: None,
            encoded: false,
            server,
            protocol,
            tx_stages: Vec::new(),
            tx_queues: Vec::new(),
            rx_stages: Vec::new(),
            rx_queues: Vec::new(),
            net_packet_size: limits.packet_size,
            events: Vec::new(),
            last_activity: Instant::now(),
        };
        stream.set_state(StreamState::Connected);
        stream
    }

    #[inline(always)]
    pub fn limits(&self) -> &HttpLimits {
        &self.http.limits
    }

    #[inline(always)]
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Advances the state machine. States never move backwards.
    pub fn set_state(&mut self, state: StreamState) {
        if state > self.state {
            self.state = state;
        }
    }

    #[inline(always)]
    pub fn is_server(&self) -> bool {
        self.server
    }

    #[inline(always)]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub(crate) fn notify(&mut self, event: StreamEvent) {
        self.events.push(event);
    }

    pub fn take_events(&mut self) -> Vec<StreamEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn set_eof(&mut self) {
        self.rx.eof = true;
    }

    // Pipeline construction

    /// Builds the stream's pipeline for a route: handler, optional filters,
    /// and the tail, with a bounded queue per stage and direction.
    pub fn build_pipeline(&mut self, route: Arc<Route>) {
        let limits = self.http.limits.clone();
        let handler = route
            .handler
            .clone()
            .or_else(|| self.http.lookup_stage("passHandler"))
            .expect("passHandler is registered at runtime creation");
        let tail = self
            .http
            .lookup_stage("tailFilter")
            .expect("tailFilter is registered at runtime creation");
        let range = self.http.lookup_stage("rangeFilter");

        self.rx.route = Some(route);
        if self.server {
            self.tx.headers.set("accept-ranges", "bytes");
        }

        let mut tx: Vec<Arc<dyn Stage>> = vec![handler.clone()];
        if let Some(range) = range {
            if range.matches(self, Direction::Tx) == StageMatch::Accept {
                tx.push(range);
            }
        }
        tx.push(tail.clone());

        self.tx_queues = tx
            .iter()
            .map(|s| Queue::new(s.name(), limits.queue_max, limits.packet_size))
            .collect();
        self.tx_stages = tx;

        let rx: Vec<Arc<dyn Stage>> = vec![tail, handler];
        self.rx_queues = rx
            .iter()
            .map(|s| Queue::new(s.name(), limits.queue_max, limits.packet_size))
            .collect();
        self.rx_stages = rx;

        for i in 0..self.tx_stages.len() {
            let stage = self.tx_stage(i);
            stage.open(self, Direction::Tx);
        }
        for i in 0..self.tx_stages.len() {
            let stage = self.tx_stage(i);
            stage.start(self);
        }
    }

    #[inline(always)]
    pub(crate) fn tx_stage(&self, at: usize) -> Arc<dyn Stage> {
        self.tx_stages[at].clone()
    }

    #[inline(always)]
    pub(crate) fn rx_stage(&self, at: usize) -> Arc<dyn Stage> {
        self.rx_stages[at].clone()
    }

    #[inline(always)]
    pub(crate) fn tx_stage_count(&self) -> usize {
        self.tx_stages.len()
    }

    #[inline(always)]
    pub(crate) fn rx_stage_count(&self) -> usize {
        self.rx_stages.len()
    }

    #[inline(always)]
    pub(crate) fn tx_queue(&self, at: usize) -> &Queue {
        &self.tx_queues[at]
    }

    #[inline(always)]
    pub(crate) fn tx_queue_mut(&mut self, at: usize) -> &mut Queue {
        &mut self.tx_queues[at]
    }

    #[inline(always)]
    pub(crate) fn rx_queue_mut(&mut self, at: usize) -> &mut Queue {
        &mut self.rx_queues[at]
    }

    /// The handler-side hold queue for readable request data.
    pub fn readq(&self) -> &Queue {
        self.rx_queues.last().expect("pipeline built")
    }

    pub(crate) fn readq_mut(&mut self) -> &mut Queue {
        self.rx_queues.last_mut().expect("pipeline built")
    }

    // Data movement

    /// Writes response body data into the pipeline, split to packet size.
    pub fn write(&mut self, data: &[u8]) {
        let size = self.net_packet_size.max(1);
        for chunk in data.chunks(size) {
            let stage = self.tx_stage(0);
            stage.outgoing(self, 0, Packet::data(chunk));
        }
    }

    /// Sends one packet into the head of the outgoing pipeline.
    pub fn write_packet(&mut self, packet: Packet) {
        let stage = self.tx_stage(0);
        stage.outgoing(self, 0, packet);
    }

    /// Feeds request data into the incoming pipeline.
    pub fn receive(&mut self, packet: Packet, net_eof: bool) {
        if net_eof {
            self.rx.net_eof = true;
        }
        let stage = self.rx_stage(0);
        stage.incoming(self, 0, packet);
    }

    /// Dequeues buffered request data.
    pub fn read_packet(&mut self) -> Option<Packet> {
        self.readq_mut().get()
    }

    /// Drains the buffered request body into one vector.
    pub fn read_body(&mut self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.readq().count());
        while let Some(packet) = self.readq_mut().get() {
            body.extend_from_slice(packet.content());
        }
        body
    }

    /// Runs scheduled outgoing service routines until the pipeline settles.
    pub fn service_outgoing(&mut self, net: &mut NetChannel) {
        loop {
            let Some(i) = (0..self.tx_queues.len()).find(|&i| self.tx_queues[i].is_scheduled())
            else {
                break;
            };
            self.tx_queues[i].take_scheduled();
            let stage = self.tx_stage(i);
            stage.outgoing_service(self, i, net);
        }
    }

    /// Applies a peer WINDOW_UPDATE to the stream's send window and resumes
    /// any stage suspended on flow control.
    pub fn update_send_window(&mut self, delta: i64) {
        self.tx.window += delta;
        if self.tx.window > 0 {
            self.resume_outgoing();
        }
    }

    /// Resumes any queues suspended on downstream back-pressure.
    pub(crate) fn resume_outgoing(&mut self) {
        for q in &mut self.tx_queues {
            if q.is_suspended() {
                q.resume();
            }
        }
    }

    // Finalization

    /// Declares the output complete: an END packet is appended to the
    /// outgoing tail and the stream may still drain.
    pub fn finalize(&mut self) {
        if self.tx.finalized {
            return;
        }
        self.tx.finalized = true;
        self.tx.finalized_output = true;
        let pending: usize = self.tx_queues.iter().map(|q| q.count()).sum();
        if !self.tx.headers_created
            && self.tx.length.is_none()
            && self.tx.queued_body == 0
            && pending == 0
            && self.tx.alt_body.is_none()
        {
            // Nothing was written and nothing is pending: the length is known.
            self.tx.length = Some(0);
        }
        if !self.tx_stages.is_empty() {
            let stage = self.tx_stage(0);
            stage.outgoing(self, 0, Packet::end());
            // Drain even before READY when the exchange is already decided.
            self.tx_queues[0].schedule();
        }
        self.set_state(StreamState::Finalized);
    }

    pub(crate) fn finalize_connector(&mut self) {
        self.tx.finalized_connector = true;
        if self.tx.finalized_output {
            self.set_state(StreamState::Complete);
            self.notify(StreamEvent::Complete);
        }
    }

    // Error subsystem

    pub fn bad_request_error(&mut self, fault: Fault, msg: impl Into<String>) {
        if self.server {
            self.http.monitor(Counter::BadRequestErrors, 1);
        }
        self.error(fault, msg);
    }

    pub fn limit_error(&mut self, fault: Fault, msg: impl Into<String>) {
        if self.server {
            self.http.monitor(Counter::LimitErrors, 1);
        }
        self.error(fault, msg);
    }

    pub fn memory_error(&mut self) {
        self.error(
            Fault::abort(status::INTERNAL_SERVER_ERROR),
            "Memory allocation error",
        );
    }

    /// Records an error on the stream. The first error wins; later calls only
    /// fill in a missing message. When response headers have already been
    /// sent the stream is aborted: the status cannot be rewritten on the
    /// wire, so a torn connection is the only honest signal left.
    pub fn error(&mut self, fault: Fault, msg: impl Into<String>) {
        let msg = msg.into();
        let code = fault.effective_status();
        let mut abort = fault.abort;

        if abort || fault.close {
            self.keep_alive_count = 0;
            if !self.rx.eof {
                self.set_eof();
            }
        }
        if self.error {
            if self.error_msg.is_none() {
                self.error_msg = Some(msg);
            }
            return;
        }
        self.error = true;
        self.error_msg = Some(msg.clone());
        if self.server {
            if !self.tx.headers_created {
                self.tx.status = code;
            }
        } else {
            self.rx.status = code;
        }
        tracing::error!(status = code, msg = %msg, "stream error");
        self.notify(StreamEvent::Error);

        if self.server {
            if code == status::NOT_FOUND {
                self.http.monitor(Counter::NotFound, 1);
            }
            self.http.monitor(Counter::Errors, 1);
        }
        self.tx.headers.set("cache-control", "no-cache");

        // Application output already queued is stale; drop it before the alt
        // body or error document takes over.
        if !self.tx.headers_created {
            for q in &mut self.tx_queues {
                q.discard_data();
            }
        }

        if self.server {
            if self.tx.headers_created {
                abort = true;
            } else {
                let error_doc = self
                    .rx
                    .route
                    .as_ref()
                    .and_then(|r| r.error_document(self.tx.status))
                    .filter(|uri| *uri != self.rx.uri)
                    .map(str::to_string);
                if let Some(uri) = error_doc {
                    // Completion re-dispatches the request internally.
                    self.tx.error_document = Some(uri);
                    self.tx.finalized = true;
                    self.tx.finalized_output = true;
                } else {
                    self.make_alt_body(code);
                }
            }
        }
        if abort {
            self.disconnect = true;
        }
        self.finalize();
    }

    fn make_alt_body(&mut self, code: u16) {
        let reason = status::reason(code);
        let show = self
            .rx
            .route
            .as_ref()
            .map(|r| r.show_errors)
            .unwrap_or(false);
        let msg = if show {
            self.error_msg.clone().unwrap_or_default()
        } else {
            String::new()
        };
        let body = if self.rx.accept.as_deref() == Some("text/plain") {
            format!("Access Error: {} -- {}\r\n{}\r\n", code, reason, msg)
        } else {
            self.tx.headers.set("content-type", "text/html");
            format!(
                "<!DOCTYPE html>\r\n<head>\r\n    <title>{}</title>\r\n</head>\r\n\
                 <body>\r\n<h2>Access Error: {} -- {}</h2>\r\n<pre>{}</pre>\r\n</body>\r\n</html>\r\n",
                reason,
                code,
                reason,
                escape_html(&msg)
            )
        };
        self.tx.length = Some(body.len() as u64);
        self.tx.alt_body = Some(body);
    }

    // Header writer

    /// Serialises the response head into `packet` exactly once.
    pub fn write_headers(&mut self, packet: &mut Packet) {
        if self.tx.headers_created {
            return;
        }
        self.tx.headers_created = true;

        if self.tx.headers.get("content-length").is_none() && !self.tx.no_length {
            let length = self.tx.length.or(self.tx.entity_length);
            match length {
                Some(len) if !self.tx.no_body => {
                    self.tx.headers.set("content-length", len.to_string());
                }
                Some(_) => {
                    self.tx.headers.set("content-length", "0");
                }
                None if self.rx.version == "HTTP/1.1" && !self.tx.no_body => {
                    self.tx.headers.set("transfer-encoding", "chunked");
                    self.tx.chunked = true;
                }
                None => {
                    // Close delimits the body.
                    self.keep_alive_count = 0;
                }
            }
        } else if self.tx.no_length && self.rx.version == "HTTP/1.1" && !self.tx.no_body {
            self.tx.headers.set("transfer-encoding", "chunked");
            self.tx.chunked = true;
        }
        if self.keep_alive_count == 0 {
            self.tx.headers.set("connection", "close");
        }
        self.tx.headers.set(
            "date",
            jiff::Timestamp::now()
                .strftime("%a, %d %b %Y %H:%M:%S GMT")
                .to_string(),
        );

        let version = if self.rx.version.is_empty() {
            "HTTP/1.1"
        } else {
            self.rx.version.as_str()
        };
        packet.write(
            format!(
                "{} {} {}\r\n",
                version,
                self.tx.status,
                status::reason(self.tx.status)
            )
            .as_bytes(),
        );
        for (name, value) in self.tx.headers.iter() {
            packet.write(name.as_bytes());
            packet.write(b": ");
            packet.write(value.as_bytes());
            packet.write(b"\r\n");
        }
        packet.write(b"\r\n");
        self.tx.header_size = packet.len();
    }
}

impl Stream {
    /// The auth context for the stream's route, if any.
    pub fn auth(&self) -> Option<Arc<Auth>> {
        self.rx.route.as_ref().and_then(|r| r.auth.clone())
    }
}

pub(crate) fn escape_html(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    for c in src.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

impl Queue {
    /// Drops buffered data packets, keeping headers and END markers.
    pub(crate) fn discard_data(&mut self) {
        let mut kept = Vec::new();
        while let Some(packet) = self.get() {
            if !packet.is_data() {
                kept.push(packet);
            }
        }
        for packet in kept {
            self.put(packet);
        }
    }
}

#[cfg(test)]
mod stream_self {
    use super::*;
    use crate::runtime::Http;

    fn stream() -> Stream {
        let http = Http::new(HttpLimits::default());
        let mut s = Stream::new_server(&http, Protocol::Http1);
        s.build_pipeline(Arc::new(Route::default()));
        s
    }

    #[test]
    fn states_are_monotonic() {
        let mut s = stream();
        assert_eq!(s.state(), StreamState::Connected);

        s.set_state(StreamState::Parsed);
        s.set_state(StreamState::First);
        assert_eq!(s.state(), StreamState::Parsed);

        s.set_state(StreamState::Complete);
        assert_eq!(s.state(), StreamState::Complete);
    }

    #[test]
    fn first_error_wins() {
        let mut s = stream();
        s.error(Fault::status(404), "missing");
        s.error(Fault::status(500), "boom");

        assert_eq!(s.tx.status, 404);
        assert_eq!(s.error_msg.as_deref(), Some("missing"));
        assert_eq!(s.tx.headers.get("cache-control"), Some("no-cache"));
        assert!(s.tx.finalized);
    }

    #[test]
    fn close_error_zeroes_keep_alive_and_sets_eof() {
        let mut s = stream();
        s.error(Fault::close(413), "too big");

        assert_eq!(s.keep_alive_count, 0);
        assert!(s.rx.eof);
        assert!(!s.disconnect);
    }

    #[test]
    fn error_after_headers_forces_abort() {
        let mut s = stream();
        let mut head = Packet::header();
        s.write_headers(&mut head);
        assert!(s.tx.headers_created);

        s.error(Fault::status(500), "boom");
        assert!(s.disconnect);
        assert!(s.tx.alt_body.is_none());
        // Status was already serialised; it stays at 200 on the wire.
        assert_eq!(s.tx.status, 200);
    }

    #[test]
    fn alt_body_html_escapes_only_when_shown() {
        let http = Http::new(HttpLimits::default());
        let mut s = Stream::new_server(&http, Protocol::Http1);
        let route = Route {
            show_errors: true,
            ..Route::default()
        };
        s.build_pipeline(Arc::new(route));
        s.error(Fault::status(404), "no <script> here");

        let body = s.tx.alt_body.as_deref().unwrap();
        assert!(body.contains("Access Error: 404 -- Not Found"));
        assert!(body.contains("no &lt;script&gt; here"));
        assert_eq!(s.tx.headers.get("content-type"), Some("text/html"));
    }

    #[test]
    fn alt_body_hides_message_by_default() {
        let mut s = stream();
        s.error(Fault::status(404), "secret detail");

        let body = s.tx.alt_body.as_deref().unwrap();
        assert!(!body.contains("secret detail"));
    }

    #[test]
    fn alt_body_plain_when_accepted() {
        let mut s = stream();
        s.rx.accept = Some("text/plain".to_string());
        s.error(Fault::status(503), "down");

        let body = s.tx.alt_body.as_deref().unwrap();
        assert!(body.starts_with("Access Error: 503 -- Service Unavailable"));
        assert_ne!(s.tx.headers.get("content-type"), Some("text/html"));
    }

    #[test]
    fn error_document_redispatch() {
        let http = Http::new(HttpLimits::default());
        let mut s = Stream::new_server(&http, Protocol::Http1);
        let mut route = Route::default();
        route.error_documents.insert(404, "/missing.html".into());
        s.build_pipeline(Arc::new(route));
        s.rx.uri = "/gone".to_string();

        s.error(Fault::status(404), "gone");
        assert_eq!(s.tx.error_document.as_deref(), Some("/missing.html"));
        assert!(s.tx.alt_body.is_none());
        assert!(s.tx.finalized && s.tx.finalized_output);
    }

    #[test]
    fn header_writer_runs_once_and_measures() {
        let mut s = stream();
        s.tx.length = Some(5);
        let mut head = Packet::header();
        s.write_headers(&mut head);

        let text = String::from_utf8(head.content().to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert_eq!(s.tx.header_size, head.len());

        let mut again = Packet::header();
        s.write_headers(&mut again);
        assert_eq!(again.len(), 0);
    }

    #[test]
    fn unknown_length_http11_uses_chunking() {
        let mut s = stream();
        let mut head = Packet::header();
        s.write_headers(&mut head);

        assert!(s.tx.chunked);
        let text = String::from_utf8(head.content().to_vec()).unwrap();
        assert!(text.contains("transfer-encoding: chunked\r\n"));
    }

    #[test]
    fn finalize_appends_end_packet() {
        let mut s = stream();
        s.set_state(StreamState::Ready);
        s.write(b"hello");
        s.finalize();
        s.finalize();

        assert!(s.tx.finalized && s.tx.finalized_output);
        assert!(s.tx_queue(0).last().unwrap().is_end());
        // END carries no payload.
        assert_eq!(s.tx_queue(0).count(), 5);
    }

    #[test]
    fn write_splits_to_packet_size() {
        let mut s = stream();
        s.net_packet_size = 4;
        s.set_state(StreamState::Ready);
        s.write(b"0123456789");

        let sizes: Vec<usize> = s.tx_queue(0).iter().map(|p| p.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn trace_head_text_roundtrip() {
        let mut s = stream();
        s.rx.method = "TRACE".into();
        s.rx.uri = "/x".into();
        s.rx.headers.add("host", "example.com");

        assert_eq!(
            s.rx.head_text(),
            "TRACE /x HTTP/1.1\r\nhost: example.com\r\n\r\n"
        );
    }
}
