//! The tail filter: first outgoing and last incoming stage of every stream.
//!
//! Outgoing, it injects the serialised header block and any alternate error
//! body, enforces the transmission body limit, applies chunked framing
//! prefixes, and performs per-stream flow-control admission against the
//! network output queue. Incoming, it enforces the form body limit and marks
//! end of input.

use crate::{
    errors::{status, Fault},
    net::connection::{NetChannel, Protocol},
    pipeline::{
        packet::Packet,
        stage::{self, Stage, StageKind},
        stream::{Stream, StreamEvent},
    },
};
use std::time::Instant;

pub struct TailFilter;

impl Stage for TailFilter {
    fn name(&self) -> &'static str {
        "tailFilter"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn outgoing(&self, stream: &mut Stream, at: usize, packet: Packet) {
        stream.last_activity = Instant::now();

        if !stream.tx.headers_created {
            let mut headers = Packet::header();
            stream.write_headers(&mut headers);
            let size = stream.net_packet_size.max(1);
            while headers.len() > size {
                let rest = headers.split(size);
                let q = stream.tx_queue_mut(at);
                q.put(headers);
                q.schedule();
                headers = rest;
            }
            let q = stream.tx_queue_mut(at);
            q.put(headers);
            q.schedule();

            if let Some(alt) = stream.tx.alt_body.clone() {
                let q = stream.tx_queue_mut(at);
                q.put(Packet::data(alt.as_bytes()));
                q.schedule();
            }
        }
        if packet.is_data() {
            stream.tx.queued_body += packet.len() as u64;
            let limit = stream.limits().tx_body_size;
            if stream.tx.queued_body > limit {
                let fault = if stream.tx.bytes_written > 0 {
                    Fault::abort(status::REQUEST_TOO_LARGE)
                } else {
                    Fault::status(status::REQUEST_TOO_LARGE)
                };
                stream.limit_error(
                    fault,
                    format!("Transmission aborted. Exceeded max body of {limit} bytes"),
                );
            }
        }
        let q = stream.tx_queue_mut(at);
        q.put(packet);
        q.schedule();
    }

    fn outgoing_service(&self, stream: &mut Stream, at: usize, net: &mut NetChannel) {
        while let Some(mut packet) = stream.tx_queue_mut(at).get() {
            if !stream_can_absorb(stream, at, net, &mut packet) {
                stream.tx_queue_mut(at).put_back(packet);
                return;
            }
            if !net.outputq.will_accept(&packet) {
                stream.tx_queue_mut(at).put_back(packet);
                stream.tx_queue_mut(at).suspend();
                net.outputq.schedule();
                return;
            }
            if stream.tx.chunked {
                frame_chunk(stream, net, &mut packet);
            }
            if packet.is_data() && net.protocol == Protocol::Http2 {
                stream.tx.window -= packet.len() as i64;
            }
            net.outputq.put(packet);
            net.outputq.schedule();
        }
    }

    fn incoming(&self, stream: &mut Stream, at: usize, packet: Packet) {
        if stream.rx.net_eof && !stream.rx.eof {
            stream.set_eof();
        }
        let count = stream.readq().count() + packet.len();
        let limit = stream.limits().rx_form_size;
        if (stream.rx.form || !stream.rx.streaming) && count >= limit {
            stream.limit_error(
                Fault::close(status::REQUEST_TOO_LARGE),
                format!("Request form of {count} bytes is too big. Limit {limit}"),
            );
        } else {
            stage::put_to_next_rx(stream, at, packet);
        }
        if stream.rx.eof && !stream.rx.end_input {
            stream.rx.end_input = true;
            stage::put_to_next_rx(stream, at, Packet::end());
        }
        if stream.rx.route.is_some() && !stream.readq().is_empty() {
            stream.notify(StreamEvent::Readable);
        }
    }
}

/// Maximum the downstream side can absorb: the network packet size capped by
/// the HTTP/2 send window (protocol 2) or the output queue high-water mark
/// (1.x). Packets are resized down to fit; zero room suspends this queue and
/// kicks the output queue instead.
fn stream_can_absorb(
    stream: &mut Stream,
    at: usize,
    net: &mut NetChannel,
    packet: &mut Packet,
) -> bool {
    let size = packet.len();
    let room = match net.protocol {
        // Both the stream window and the connection window must have credit.
        Protocol::Http2 => net
            .outputq
            .packet_size
            .min(stream.tx.window.max(0) as usize)
            .min(net.outputq.window.max(0) as usize),
        Protocol::Http1 => net.outputq.packet_size.min(net.outputq.max),
    };
    if size <= room {
        return true;
    }
    if room > 0 {
        stream.tx_queue_mut(at).resize(packet, room);
        debug_assert!(packet.len() <= room);
        if packet.len() > 0 {
            return true;
        }
    }
    stream.tx_queue_mut(at).suspend();
    net.outputq.schedule();
    false
}

/// Chunked transfer framing. Chunk headers ride as packet prefixes; the
/// terminal `0` chunk travels on a prefix-only packet ahead of END.
fn frame_chunk(stream: &mut Stream, net: &mut NetChannel, packet: &mut Packet) {
    if packet.is_data() && packet.len() > 0 {
        let prefix = if stream.tx.chunk_started {
            format!("\r\n{:x}\r\n", packet.len())
        } else {
            stream.tx.chunk_started = true;
            format!("{:x}\r\n", packet.len())
        };
        packet.set_prefix(prefix.as_bytes());
    } else if packet.is_end() {
        let mut trailer = Packet::data(&[]);
        let text: &[u8] = if stream.tx.chunk_started {
            b"\r\n0\r\n\r\n"
        } else {
            b"0\r\n\r\n"
        };
        trailer.set_prefix(text);
        net.outputq.put(trailer);
    }
}
