//! One network connection: a socket, a protocol choice, and the streams
//! multiplexed over it.
//!
//! The connection owns the socket exclusively; only the net connector
//! writes. Streams live on an ordered list and are dropped on completion.

use crate::{
    errors::{status, Fault},
    limits::HttpLimits,
    net::connector::{self, NetVec},
    pipeline::{queue::Queue, stream::Stream},
    runtime::Http,
};
use std::{
    io::{self, IoSlice},
    sync::Arc,
    time::Instant,
};
use tokio::net::TcpStream;

/// HTTP/2 GOAWAY error code for connection-level internal failures.
pub(crate) const GOAWAY_INTERNAL_ERROR: u32 = 0x2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
}

/// The write side of a connection as seen by service routines. Kept separate
/// from the socket so services stay synchronous and testable.
pub(crate) trait Transport: Send {
    fn try_writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;
}

impl Transport for TcpStream {
    fn try_writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.try_write_vectored(bufs)
    }
}

/// Shared outbound state for a connection: the network output queue, the
/// scatter/gather vector, and the connection-level flags.
pub struct NetChannel {
    pub protocol: Protocol,
    pub(crate) outputq: Queue,
    pub(crate) vec: NetVec,
    pub eof: bool,
    pub error: bool,
    pub error_msg: Option<String>,
    pub(crate) blocked: bool,
    pub(crate) goaway_sent: bool,
}

impl NetChannel {
    pub fn new(protocol: Protocol, limits: &HttpLimits) -> Self {
        let mut outputq = Queue::new("netConnector", limits.queue_max, limits.packet_size);
        outputq.window = limits.stream_window;
        NetChannel {
            protocol,
            outputq,
            vec: NetVec::new(),
            eof: false,
            error: false,
            error_msg: None,
            blocked: false,
            goaway_sent: false,
        }
    }
}

/// Builds an RFC 7540 GOAWAY frame carrying `code` and `msg` as debug data.
pub(crate) fn goaway_frame(last_stream_id: u32, code: u32, msg: &str) -> Vec<u8> {
    let debug = msg.as_bytes();
    let len = 8 + debug.len();
    let mut frame = Vec::with_capacity(9 + len);
    frame.extend_from_slice(&[(len >> 16) as u8, (len >> 8) as u8, len as u8]);
    frame.push(0x7); // GOAWAY
    frame.push(0x0); // no flags
    frame.extend_from_slice(&0u32.to_be_bytes()); // connection stream
    frame.extend_from_slice(&(last_stream_id & 0x7fff_ffff).to_be_bytes());
    frame.extend_from_slice(&code.to_be_bytes());
    frame.extend_from_slice(debug);
    frame
}

/// Best-effort GOAWAY emission straight to the transport; the connection is
/// about to be torn down, so failures are ignored.
pub(crate) fn send_goaway(
    io: &mut dyn Transport,
    channel: &mut NetChannel,
    last_stream_id: u32,
    code: u32,
    msg: &str,
) {
    if channel.goaway_sent {
        return;
    }
    channel.goaway_sent = true;
    let frame = goaway_frame(last_stream_id, code, msg);
    let _ = io.try_writev(&[IoSlice::new(&frame)]);
    tracing::debug!(code, msg, "sent GOAWAY");
}

/// A live connection: socket, protocol, channel state, and stream list.
pub struct NetConnection {
    pub http: Arc<Http>,
    pub(crate) sock: TcpStream,
    pub channel: NetChannel,
    pub streams: Vec<Stream>,
    server: bool,
    pub last_activity: Instant,
}

impl NetConnection {
    pub fn new(http: Arc<Http>, sock: TcpStream, protocol: Protocol) -> Self {
        let channel = NetChannel::new(protocol, &http.limits);
        NetConnection {
            http,
            sock,
            channel,
            streams: Vec::new(),
            server: true,
            last_activity: Instant::now(),
        }
    }

    #[inline(always)]
    pub fn is_server(&self) -> bool {
        self.server
    }

    /// Records a connection-level failure: emits GOAWAY on HTTP/2, then
    /// short-circuits every live stream with a single COMMS_ERROR abort.
    pub fn net_error(&mut self, msg: impl Into<String>) {
        if self.channel.error {
            return;
        }
        let msg = msg.into();
        self.channel.error = true;
        self.channel.error_msg = Some(msg.clone());
        tracing::error!(msg = %msg, "network error");

        if self.channel.protocol == Protocol::Http2 && !self.channel.eof {
            let last = self.streams.len() as u32;
            send_goaway(
                &mut self.sock,
                &mut self.channel,
                last,
                GOAWAY_INTERNAL_ERROR,
                &msg,
            );
        }
        if self.server {
            for stream in &mut self.streams {
                stream.error(Fault::abort(status::COMMS_ERROR), msg.clone());
            }
        }
    }

    /// Runs the outgoing pipeline and the net connector for one stream.
    pub fn service(&mut self, idx: usize) {
        let stream = &mut self.streams[idx];
        stream.service_outgoing(&mut self.channel);
        if self.channel.outputq.take_scheduled() || !self.channel.outputq.is_empty() {
            connector::service(stream, &mut self.channel, &mut self.sock);
        }
    }

    /// Drains a stream's output to the socket, waiting on writability when
    /// the connector reports back-pressure.
    pub async fn drain(&mut self, idx: usize) -> io::Result<()> {
        let mut stalled = 0u32;
        loop {
            let before = self.streams[idx].tx.bytes_written;
            self.service(idx);
            let stream = &self.streams[idx];
            if stream.tx.finalized_connector {
                break;
            }
            if self.channel.blocked {
                self.sock.writable().await?;
                self.channel.blocked = false;
                self.channel.outputq.resume();
                self.streams[idx].resume_outgoing();
                continue;
            }
            // No progress possible without more application output.
            if self.channel.outputq.is_empty() && !self.streams[idx].tx.finalized {
                break;
            }
            if self.channel.outputq.is_empty() {
                // Finalized but END not yet seen by the connector. A stage
                // suspended on flow control cannot make progress here; only
                // retry while bytes are still moving.
                if self.streams[idx].tx.bytes_written == before {
                    stalled += 1;
                    if stalled > 1 {
                        break;
                    }
                } else {
                    stalled = 0;
                }
                self.streams[idx].resume_outgoing();
                let stream = &mut self.streams[idx];
                if !(0..stream.tx_stage_count()).any(|i| stream.tx_queue(i).is_scheduled()) {
                    break;
                }
            }
        }
        // A stream abort on HTTP/2 owes the peer a GOAWAY before teardown.
        if self.streams[idx].disconnect
            && self.channel.protocol == Protocol::Http2
            && !self.channel.goaway_sent
        {
            let msg = self.streams[idx].error_msg.clone().unwrap_or_default();
            let last = idx as u32;
            send_goaway(
                &mut self.sock,
                &mut self.channel,
                last,
                GOAWAY_INTERNAL_ERROR,
                &msg,
            );
        }
        Ok(())
    }

    /// Drops streams whose output side is finished from the connection's
    /// list. Callers only reap between exchanges, never mid-drain.
    pub fn reap(&mut self) {
        self.streams.retain(|s| {
            s.state() < crate::pipeline::stream::StreamState::Complete && !s.tx.finalized_output
        });
    }
}
