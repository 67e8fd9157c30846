//! Worker-pool HTTP server over the staged pipeline.
//!
//! A fixed pool of workers shares a bounded admission ring with the
//! acceptor. Workers sleep on a notifier instead of polling; when the ring
//! is full the acceptor itself refuses the connection with a canned 503, so
//! overload never grows the buffer.

use crate::{
    clf::{format_access_log, LogPeer, COMMON_LOG_FORMAT},
    errors::{status, ErrorKind, Fault},
    limits::{ConnLimits, ServerLimits},
    net::{
        connection::{NetConnection, Protocol},
        http1,
    },
    pipeline::{
        packet::Packet,
        stream::{Stream, StreamState},
    },
    route::Route,
    runtime::Http,
};
use bytes::{Buf, BytesMut};
use crossbeam::queue::ArrayQueue;
use std::{io, net::SocketAddr, sync::Arc, time::Duration, time::Instant};
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    sync::Notify,
    time::sleep,
};

const RESPONSE_503: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nconnection: close\r\ncontent-length: 0\r\n\r\n";

/// An overflow 503 must not outlive the overload that caused it.
const OVERFLOW_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Chooses the route for a parsed request head.
pub trait Router: Send + Sync + 'static {
    fn route(&self, rx: &crate::pipeline::stream::Rx) -> Arc<Route>;
}

/// Serves every request from one route.
pub struct SingleRoute(pub Arc<Route>);

impl Router for SingleRoute {
    fn route(&self, _: &crate::pipeline::stream::Rx) -> Arc<Route> {
        self.0.clone()
    }
}

impl<F> Router for F
where
    F: Fn(&crate::pipeline::stream::Rx) -> Arc<Route> + Send + Sync + 'static,
{
    fn route(&self, rx: &crate::pipeline::stream::Rx) -> Arc<Route> {
        self(rx)
    }
}

/// Binds a listener with address reuse and a deep backlog.
pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = socket2::Domain::for_address(addr);
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

/// Bounded hand-off ring between the acceptor and the worker pool.
///
/// Every successful submit wakes one worker; a worker that finds the ring
/// empty parks on the notifier until the next submit. A stolen wakeup only
/// costs the sleeper one extra loop, never a lost connection.
struct Admission {
    ring: ArrayQueue<(TcpStream, SocketAddr)>,
    doorbell: Notify,
}

impl Admission {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Admission {
            ring: ArrayQueue::new(capacity.max(1)),
            doorbell: Notify::new(),
        })
    }

    /// Hands a connection to the pool; returns it back on overflow.
    fn submit(
        &self,
        conn: (TcpStream, SocketAddr),
    ) -> Result<(), (TcpStream, SocketAddr)> {
        self.ring.push(conn)?;
        self.doorbell.notify_one();
        Ok(())
    }

    async fn take(&self) -> (TcpStream, SocketAddr) {
        loop {
            if let Some(conn) = self.ring.pop() {
                return conn;
            }
            self.doorbell.notified().await;
        }
    }
}

pub struct Server {
    listener: TcpListener,
    admission: Arc<Admission>,
    reject_overflow: bool,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            listener: None,
            router: None,
            http: None,
            server_limits: None,
            connection_limits: None,
        }
    }

    /// Accepts connections forever. Admission failures are answered right
    /// here; nothing accumulates beyond the ring.
    pub async fn launch(self) {
        loop {
            match self.listener.accept().await {
                Ok(conn) => {
                    if let Err((refused, addr)) = self.admission.submit(conn) {
                        tracing::trace!(peer = %addr, "admission ring full");
                        refuse(refused, self.reject_overflow);
                    }
                }
                Err(e) => tracing::trace!(error = %e, "accept failed"),
            }
        }
    }
}

/// Closes an over-admission connection, optionally after a canned 503.
fn refuse(sock: TcpStream, answer: bool) {
    if !answer {
        return;
    }
    tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        let mut sock = sock;
        let _ = tokio::time::timeout(OVERFLOW_WRITE_TIMEOUT, sock.write_all(RESPONSE_503)).await;
    });
}

pub struct ServerBuilder {
    listener: Option<TcpListener>,
    router: Option<Arc<dyn Router>>,
    http: Option<Arc<Http>>,
    server_limits: Option<ServerLimits>,
    connection_limits: Option<ConnLimits>,
}

impl ServerBuilder {
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn router<R: Router>(mut self, router: R) -> Self {
        self.router = Some(Arc::new(router));
        self
    }

    /// Convenience: serve everything from one route.
    pub fn route(self, route: Route) -> Self {
        self.router(SingleRoute(Arc::new(route)))
    }

    /// Shares an existing runtime handle (stage registry, session cache).
    pub fn http(mut self, http: Arc<Http>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Spawns the worker pool and returns the server, ready to launch.
    ///
    /// # Panics
    /// Panics when `listener` or `router` was not provided.
    #[track_caller]
    pub fn build(self) -> Server {
        let listener = self.listener.expect("the `listener` method must be called");
        let router = self.router.expect("the `router` method must be called");
        let http = self
            .http
            .unwrap_or_else(|| Http::new(crate::limits::HttpLimits::default()));
        let server_limits = self.server_limits.unwrap_or_default();
        let conn_limits = self.connection_limits.unwrap_or_default();

        let admission = Admission::new(server_limits.admission_backlog);
        for _ in 0..server_limits.workers.max(1) {
            let admission = admission.clone();
            let conn_limits = conn_limits.clone();
            let http = http.clone();
            let router = router.clone();
            tokio::spawn(async move {
                loop {
                    let (sock, addr) = admission.take().await;
                    if let Err(e) = run_connection(&http, &router, &conn_limits, sock, addr).await
                    {
                        tracing::trace!(error = %e, "connection closed");
                    }
                }
            });
        }

        Server {
            listener,
            admission,
            reject_overflow: server_limits.reject_overflow,
        }
    }
}

impl NetConnection {
    async fn read_some(&mut self, buf: &mut BytesMut, timeout: Duration) -> io::Result<usize> {
        tokio::select! {
            biased;
            read = self.sock.read_buf(buf) => read,
            _ = sleep(timeout) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timeout")),
        }
    }
}

fn fault_for(kind: &ErrorKind) -> Fault {
    match kind {
        ErrorKind::UnsupportedVersion => Fault::close(505),
        ErrorKind::TooManyHeaders => Fault::close(431),
        ErrorKind::BodyTooLarge => Fault::close(status::REQUEST_TOO_LARGE),
        _ => Fault::close(status::BAD_REQUEST),
    }
}

/// Keep-alive loop for one connection: parse a head, build the pipeline,
/// feed the body, fire the handler, drain, log, repeat.
async fn run_connection(
    http: &Arc<Http>,
    router: &Arc<dyn Router>,
    limits: &ConnLimits,
    sock: TcpStream,
    addr: SocketAddr,
) -> io::Result<()> {
    let _ = sock.set_nodelay(true);
    let peer = LogPeer {
        remote_ip: addr.ip().to_string(),
        local_ip: sock
            .local_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_default(),
    };
    let mut conn = NetConnection::new(http.clone(), sock, Protocol::Http1);
    let mut buf = BytesMut::with_capacity(16 * 1024);
    let started = Instant::now();
    let mut served: u32 = 0;

    loop {
        if started.elapsed() > limits.connection_lifetime {
            break;
        }
        let mut stream = Stream::new_server(http, Protocol::Http1);
        stream.keep_alive_count = stream.keep_alive_count.saturating_sub(served);

        // Read until a complete head is buffered.
        let consumed = loop {
            match http1::parse_request_head(&mut stream, &buf) {
                Ok(Some(n)) => break Ok(n),
                Ok(None) => {
                    let n = conn.read_some(&mut buf, limits.socket_read_timeout).await?;
                    if n == 0 {
                        if buf.is_empty() {
                            // Clean close between requests.
                            return Ok(());
                        }
                        conn.channel.eof = true;
                        break Err(ErrorKind::InvalidHeader);
                    }
                }
                Err(kind) => break Err(kind),
            }
        };
        let consumed = match consumed {
            Ok(n) => n,
            Err(kind) => {
                stream.build_pipeline(Arc::new(Route::default()));
                stream.bad_request_error(fault_for(&kind), kind.to_string());
                finish_exchange(&mut conn, stream, &peer).await?;
                return Ok(());
            }
        };
        buf.advance(consumed);

        let route = router.route(&stream.rx);
        stream.build_pipeline(route);
        stream.set_state(StreamState::Content);

        // Buffered body: read exactly content-length bytes.
        let want = stream.rx.content_length.unwrap_or(0) as usize;
        while buf.len() < want {
            let n = conn.read_some(&mut buf, limits.socket_read_timeout).await?;
            if n == 0 {
                conn.channel.eof = true;
                break;
            }
        }
        if want > buf.len() {
            stream.bad_request_error(
                Fault::close(status::BAD_REQUEST),
                "Request body incomplete",
            );
        } else if want > 0 {
            let body = buf.split_to(want);
            stream.receive(Packet::data(&body), false);
        }
        stream.set_eof();
        stream.receive(Packet::data(&[]), false);

        if !stream.error {
            stream.set_state(StreamState::Ready);
            let handler = stream.tx_stage(0);
            handler.ready(&mut stream);
            stream.set_state(StreamState::Running);
        }

        let keep_alive = finish_exchange(&mut conn, stream, &peer).await?;
        served += 1;
        if !keep_alive || served >= http.limits.keep_alive_max {
            break;
        }
    }
    Ok(())
}

/// Drains one stream to the wire, emits the access log line, and reaps it.
/// Returns whether the connection may serve another request.
async fn finish_exchange(
    conn: &mut NetConnection,
    stream: Stream,
    peer: &LogPeer,
) -> io::Result<bool> {
    conn.streams.push(stream);
    let idx = conn.streams.len() - 1;
    conn.drain(idx).await?;

    let stream = &conn.streams[idx];
    tracing::info!(target: "access", "{}", format_access_log(stream, peer, COMMON_LOG_FORMAT));
    let keep_alive = stream.keep_alive_count > 0
        && !stream.disconnect
        && !conn.channel.eof
        && !conn.channel.error;
    conn.reap();
    Ok(keep_alive)
}

#[cfg(test)]
mod pool {
    use super::*;
    use crate::limits::HttpLimits;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn serve_one(route: Route) -> (std::net::SocketAddr, Arc<Http>) {
        let http = Http::new(HttpLimits::default());
        let listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::builder()
            .listener(listener)
            .http(http.clone())
            .route(route)
            .server_limits(ServerLimits {
                workers: 2,
                ..ServerLimits::default()
            })
            .build();
        tokio::spawn(server.launch());
        (addr, http)
    }

    async fn request(addr: std::net::SocketAddr, req: &str) -> String {
        let mut sock = TcpStream::connect(addr).await.unwrap();
        sock.write_all(req.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match tokio::time::timeout(Duration::from_secs(2), sock.read(&mut buf)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => response.extend_from_slice(&buf[..n]),
                Ok(Err(_)) => break,
            }
        }
        String::from_utf8_lossy(&response).into_owned()
    }

    #[tokio::test]
    async fn admission_ring_bounds_and_returns_overflow() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let admission = Admission::new(1);

        let first = TcpStream::connect(addr).await.unwrap();
        let second = TcpStream::connect(addr).await.unwrap();
        assert!(admission.submit((first, addr)).is_ok());
        // Ring full: the connection comes back to the caller.
        assert!(admission.submit((second, addr)).is_err());

        assert!(admission.take().await.1 == addr);
        assert!(admission.ring.pop().is_none());
    }

    #[tokio::test]
    async fn pass_handler_end_to_end() {
        let (addr, _) = serve_one(Route::default()).await;
        let response = request(addr, "GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("connection: close"));
    }

    #[tokio::test]
    async fn bad_request_gets_error_body() {
        let (addr, _) = serve_one(Route::default()).await;
        let response = request(addr, "BOGUS / HTTP/1.1\r\n\r\n").await;

        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(response.contains("cache-control: no-cache"));
    }

    #[tokio::test]
    async fn options_advertises_methods() {
        let (addr, _) = serve_one(Route::default()).await;
        let response = request(addr, "OPTIONS / HTTP/1.1\r\nConnection: close\r\n\r\n").await;

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("allow: GET,HEAD,POST,OPTIONS,TRACE"));
    }
}
