//! The net connector: terminal outgoing stage attached to the socket.
//!
//! Each service pass aggregates queued packets into one scatter/gather
//! vector and issues a single vectored write. Partial writes are expected;
//! the vector carries the residue across passes and packets are consumed
//! front-first (prefix before content) as bytes leave.

use crate::{
    errors::{status, Fault},
    net::connection::{NetChannel, Transport},
    pipeline::{packet::PacketKind, stream::Stream},
};
use std::io::{self, IoSlice};

/// Two slots are reserved so a header materialisation mid-walk never
/// overflows the vector.
pub(crate) const NET_IOVEC_MAX: usize = 16;

/// The scatter/gather vector: entry lengths only. The byte slices themselves
/// are borrowed from the queue's packets at write time, so consuming packet
/// fronts keeps the two views aligned.
#[derive(Debug, Default)]
pub(crate) struct NetVec {
    segs: Vec<usize>,
    io_count: usize,
}

impl NetVec {
    pub(crate) fn new() -> Self {
        NetVec {
            segs: Vec::with_capacity(NET_IOVEC_MAX),
            io_count: 0,
        }
    }

    #[inline(always)]
    pub(crate) fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    #[inline(always)]
    pub(crate) fn io_count(&self) -> usize {
        self.io_count
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.segs.len()
    }

    fn add(&mut self, bytes: usize) {
        debug_assert!(bytes > 0);
        self.segs.push(bytes);
        self.io_count += bytes;
    }

    fn clear(&mut self) {
        self.segs.clear();
        self.io_count = 0;
    }

    /// Clears entries that have been transmitted, supporting a split write on
    /// the first partially written entry.
    pub(crate) fn adjust(&mut self, mut written: usize) {
        if written == self.io_count {
            self.clear();
            return;
        }
        self.io_count -= written;
        let mut drop = 0;
        for seg in self.segs.iter_mut() {
            if written < *seg {
                *seg -= written;
                break;
            }
            written -= *seg;
            drop += 1;
        }
        self.segs.drain(..drop);
    }
}

/// Services the network output queue: drain to the socket with vectored
/// writes until the socket blocks, the queue empties, or the stream ends.
pub(crate) fn service(stream: &mut Stream, net: &mut NetChannel, io: &mut dyn Transport) {
    stream.last_activity = std::time::Instant::now();
    if stream.tx.finalized_connector || net.error {
        return;
    }
    if stream.tx.sendfile {
        // File transmission belongs to the send connector. Once headers have
        // been created the opportunity has passed; fall back to this path.
        if stream.tx.headers_created {
            stream.tx.sendfile = false;
        } else {
            tracing::debug!("sendfile relay requested, deferring to send connector");
            return;
        }
    }
    if stream.tx.no_body {
        net.outputq.discard_data();
    }
    let limit = stream.limits().tx_body_size;
    if stream.tx.bytes_written + net.outputq.count() as u64 > limit {
        let fault = if stream.tx.bytes_written > 0 {
            Fault::abort(status::REQUEST_TOO_LARGE)
        } else {
            Fault::status(status::REQUEST_TOO_LARGE)
        };
        stream.limit_error(
            fault,
            format!("Transmission aborted. Exceeded max body of {limit} bytes"),
        );
        if stream.tx.bytes_written > 0 {
            stream.finalize_connector();
            return;
        }
        net.outputq.discard_data();
    }

    while !net.outputq.is_empty() || !net.vec.is_empty() {
        if net.vec.is_empty() && build_net_vec(stream, net) == 0 {
            break;
        }
        let written = {
            let slices = io_slices(net);
            debug_assert!(!slices.is_empty());
            io.try_writev(&slices)
        };
        match written {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // Socket full; the scheduler re-arms on writable.
                net.blocked = true;
                break;
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::BrokenPipe
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::NotConnected
                ) =>
            {
                tracing::trace!(error = %e, "peer gone, disconnecting");
                stream.disconnect = true;
                net.eof = true;
                stream.finalize_connector();
                break;
            }
            Err(e) => {
                stream.error(
                    Fault::abort(status::COMMS_ERROR),
                    format!("netConnector: write response error: {e}"),
                );
                stream.finalize_connector();
                break;
            }
            Ok(written) if written > 0 => {
                tracing::trace!(written, pending = net.vec.io_count(), "netConnector wrote");
                stream.tx.bytes_written += written as u64;
                free_net_packets(net, written);
                net.vec.adjust(written);
            }
            Ok(_) => {
                // Zero-byte write on non-empty buffers: the peer is gone.
                stream.disconnect = true;
                net.eof = true;
                stream.finalize_connector();
                break;
            }
        }
    }
    if net.outputq.first().map(|p| p.is_end()).unwrap_or(false) {
        tracing::trace!("end of stream, finalizing connector");
        net.outputq.get();
        stream.finalize_connector();
    } else {
        stream.notify(crate::pipeline::stream::StreamEvent::Writable);
    }
}

/// Builds the I/O vector from queued packets. Materialises header packets
/// exactly once, drops empty mid-stream packets, stops at END or when the
/// vector nears capacity. Returns the bytes described by the vector.
pub(crate) fn build_net_vec(stream: &mut Stream, net: &mut NetChannel) -> usize {
    let mut at = 0;
    loop {
        let Some(packet) = net.outputq.iter().nth(at) else {
            break;
        };
        if packet.is_end() {
            break;
        }
        if net.vec.len() >= NET_IOVEC_MAX - 2 {
            break;
        }
        if packet.kind() == PacketKind::Header && !stream.tx.headers_created {
            let mut head = crate::pipeline::packet::Packet::header();
            stream.write_headers(&mut head);
            let filled = head.len();
            if let Some(slot) = net.outputq.iter_mut().nth(at) {
                slot.join(head);
            }
            net.outputq.count += filled;
        }
        let packet = net.outputq.iter().nth(at).expect("still present");
        if packet.total_len() == 0 {
            net.outputq.remove_empty_at(at);
            continue;
        }
        if packet.prefix_len() > 0 {
            net.vec.add(packet.prefix_len());
        }
        if packet.len() > 0 {
            net.vec.add(packet.len());
        }
        at += 1;
    }
    net.vec.io_count()
}

/// Borrows the byte slices the current vector describes.
fn io_slices(net: &NetChannel) -> Vec<IoSlice<'_>> {
    let want = net.vec.len();
    let mut slices = Vec::with_capacity(want);
    for packet in net.outputq.iter() {
        if slices.len() >= want || packet.is_end() {
            break;
        }
        if packet.prefix_len() > 0 && slices.len() < want {
            slices.push(IoSlice::new(packet.prefix_bytes()));
        }
        if packet.len() > 0 && slices.len() < want {
            slices.push(IoSlice::new(packet.content()));
        }
    }
    slices
}

/// Consumes `bytes` of written data from the queue head: prefix first, then
/// content, per packet. Fully consumed packets are dequeued; the END packet
/// is never consumed here.
pub(crate) fn free_net_packets(net: &mut NetChannel, mut bytes: usize) {
    while bytes > 0 {
        let Some(packet) = net.outputq.first_mut() else {
            break;
        };
        if packet.is_end() {
            break;
        }
        let took = packet.consume_prefix(bytes);
        bytes -= took;
        if bytes > 0 {
            let took = packet.consume_content(bytes);
            bytes -= took;
            net.outputq.count -= took;
        }
        if net.outputq.first().map(|p| p.total_len()) == Some(0) {
            net.outputq.get();
        } else {
            break;
        }
    }
    debug_assert_eq!(bytes, 0);
}


#[cfg(test)]
mod connector {
    use super::*;
    use crate::{
        limits::HttpLimits,
        net::connection::{NetChannel, Protocol},
        pipeline::{packet::Packet, stream::Stream},
        route::Route,
        runtime::Http,
    };
    use std::sync::Arc;

    /// Transport double that accepts a scripted number of bytes per write.
    struct Pipe {
        accepts: Vec<usize>,
        written: Vec<u8>,
    }

    impl Pipe {
        fn new(accepts: Vec<usize>) -> Self {
            Pipe {
                accepts,
                written: Vec::new(),
            }
        }
    }

    impl Transport for Pipe {
        fn try_writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
            if self.accepts.is_empty() {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "full"));
            }
            let mut budget = self.accepts.remove(0);
            let mut wrote = 0;
            for buf in bufs {
                if budget == 0 {
                    break;
                }
                let take = budget.min(buf.len());
                self.written.extend_from_slice(&buf[..take]);
                budget -= take;
                wrote += take;
            }
            Ok(wrote)
        }
    }

    fn stream() -> (Stream, NetChannel) {
        let http = Http::new(HttpLimits::default());
        let mut s = Stream::new_server(&http, Protocol::Http1);
        s.build_pipeline(Arc::new(Route::default()));
        let net = NetChannel::new(Protocol::Http1, &http.limits);
        (s, net)
    }

    fn header_packet(stream: &mut Stream, size: usize) -> Packet {
        // Fixed-size pseudo head so written byte counts are predictable.
        stream.tx.headers_created = true;
        stream.tx.header_size = size;
        let mut p = Packet::header();
        p.write(&vec![b'H'; size]);
        p
    }

    #[test]
    fn partial_writes_recover_and_finalize() {
        let (mut stream, mut net) = stream();
        net.outputq.put(header_packet(&mut stream, 200));
        net.outputq.put(Packet::data(&[b'D'; 1000]));
        net.outputq.put(Packet::end());

        let mut pipe = Pipe::new(vec![600, 600]);
        service(&mut stream, &mut net, &mut pipe);

        assert_eq!(stream.tx.bytes_written, 1200);
        assert!(net.vec.is_empty());
        assert_eq!(pipe.written.len(), 1200);
        assert!(stream.tx.finalized_connector);
        assert!(net.outputq.is_empty());
    }

    #[test]
    fn would_block_marks_blocked_and_keeps_residue() {
        let (mut stream, mut net) = stream();
        net.outputq.put(Packet::data(&[b'D'; 500]));
        net.outputq.put(Packet::end());

        let mut pipe = Pipe::new(vec![100]);
        service(&mut stream, &mut net, &mut pipe);

        assert!(net.blocked);
        assert_eq!(stream.tx.bytes_written, 100);
        assert_eq!(net.vec.io_count(), 400);
        assert!(!stream.tx.finalized_connector);

        // Writable again: drain the rest.
        net.blocked = false;
        let mut pipe2 = Pipe::new(vec![400]);
        pipe2.written = pipe.written;
        service(&mut stream, &mut net, &mut pipe2);
        assert_eq!(stream.tx.bytes_written, 500);
        assert!(stream.tx.finalized_connector);
    }

    #[test]
    fn peer_reset_disconnects_quietly() {
        struct Reset;
        impl Transport for Reset {
            fn try_writev(&mut self, _: &[IoSlice<'_>]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            }
        }

        let (mut stream, mut net) = stream();
        net.outputq.put(Packet::data(b"data"));
        service(&mut stream, &mut net, &mut Reset);

        assert!(stream.disconnect);
        assert!(!stream.error);
        assert!(stream.tx.finalized_connector);
    }

    #[test]
    fn hard_write_error_raises_comms_abort() {
        struct Broken;
        impl Transport for Broken {
            fn try_writev(&mut self, _: &[IoSlice<'_>]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "efault"))
            }
        }

        let (mut stream, mut net) = stream();
        net.outputq.put(Packet::data(b"data"));
        service(&mut stream, &mut net, &mut Broken);

        assert!(stream.error);
        assert!(stream.disconnect);
        assert_eq!(stream.tx.status, crate::errors::status::COMMS_ERROR);
    }

    #[test]
    fn prefixes_are_written_before_content() {
        let (mut stream, mut net) = stream();
        stream.tx.headers_created = true;
        let mut p = Packet::data(b"hello");
        p.set_prefix(b"5\r\n");
        net.outputq.put(p);
        net.outputq.put(Packet::end());

        let mut pipe = Pipe::new(vec![100]);
        service(&mut stream, &mut net, &mut pipe);

        assert_eq!(pipe.written, b"5\r\nhello");
        assert!(stream.tx.finalized_connector);
    }

    #[test]
    fn oversized_transmission_errors() {
        let http = Http::new(HttpLimits {
            tx_body_size: 100,
            ..HttpLimits::default()
        });
        let mut stream = Stream::new_server(&http, Protocol::Http1);
        stream.build_pipeline(Arc::new(Route::default()));
        let mut net = NetChannel::new(Protocol::Http1, &http.limits);

        stream.tx.headers_created = true;
        net.outputq.put(Packet::data(&[0u8; 200]));
        let mut pipe = Pipe::new(vec![1000]);
        service(&mut stream, &mut net, &mut pipe);

        assert!(stream.error);
        assert_eq!(stream.tx.status, crate::errors::status::REQUEST_TOO_LARGE);
    }
}
