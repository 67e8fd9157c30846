//! Stages are the building blocks of the request pipeline.
//!
//! A handler terminates the pipeline, a filter sits mid-pipeline, and a
//! connector is the terminal outgoing stage attached to the network. Stages
//! are stateless singletons registered on the [`Http`](crate::Http) runtime;
//! all per-exchange state lives on the stream and its queues.

use crate::{
    net::connection::NetChannel,
    pipeline::{
        packet::{Packet, PacketKind},
        stream::{Stream, StreamEvent, StreamState},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Handler,
    Filter,
    Connector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageMatch {
    Accept,
    Omit,
}

pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> StageKind;

    /// Whether this stage should be installed for the given direction.
    fn matches(&self, _stream: &Stream, _dir: Direction) -> StageMatch {
        StageMatch::Accept
    }

    /// Called once when the stage's queues are created for a stream.
    fn open(&self, _stream: &mut Stream, _dir: Direction) {}

    /// Called when request processing starts (headers parsed).
    fn start(&self, _stream: &mut Stream) {}

    /// Called when the stream reaches READY and the application may respond.
    fn ready(&self, _stream: &mut Stream) {}

    /// Accepts a packet travelling towards the handler.
    fn incoming(&self, stream: &mut Stream, at: usize, packet: Packet) {
        default_incoming(stream, at, packet);
    }

    /// Accepts a packet travelling towards the network.
    fn outgoing(&self, stream: &mut Stream, at: usize, packet: Packet) {
        default_outgoing(stream, at, packet);
    }

    /// Drains this stage's service queue towards the network.
    fn outgoing_service(&self, stream: &mut Stream, at: usize, net: &mut NetChannel) {
        default_outgoing_service(stream, at, net);
    }

    fn close(&self, _stream: &mut Stream) {}
}

/// Default outgoing behaviour: enqueue for service. Handler queues are only
/// auto-scheduled once the stream has reached READY.
pub(crate) fn default_outgoing(stream: &mut Stream, at: usize, packet: Packet) {
    let enable =
        stream.tx_stage(at).kind() != StageKind::Handler || stream.state() >= StreamState::Ready;
    let q = stream.tx_queue_mut(at);
    q.put(packet);
    if enable {
        q.schedule();
    }
}

/// Default incoming behaviour: forward towards the handler; the last queue
/// holds data as a joined buffer (forms) or as solo packets (opaque bodies)
/// and notifies the stream of readable data.
pub(crate) fn default_incoming(stream: &mut Stream, at: usize, packet: Packet) {
    if at + 1 < stream.rx_stage_count() {
        put_to_next_rx(stream, at, packet);
        return;
    }
    let q = stream.rx_queue_mut(at);
    if packet.len() > 0 {
        if packet.kind() == PacketKind::Solo {
            q.put(packet);
        } else {
            q.join(packet);
        }
    } else {
        // Zero length means end of input.
        q.put(packet);
    }
    stream.notify(StreamEvent::Readable);
}

/// Default outgoing service: drain to the next queue, honouring admission and
/// putting packets back on refusal.
pub(crate) fn default_outgoing_service(stream: &mut Stream, at: usize, net: &mut NetChannel) {
    while let Some(packet) = stream.tx_queue_mut(at).get() {
        if at + 1 < stream.tx_stage_count() {
            if !stream.tx_queue(at + 1).will_accept(&packet) {
                stream.tx_queue_mut(at).put_back(packet);
                return;
            }
            put_to_next_tx(stream, at, packet);
        } else {
            if !net.outputq.will_accept(&packet) {
                stream.tx_queue_mut(at).put_back(packet);
                return;
            }
            net.outputq.put(packet);
            net.outputq.schedule();
        }
    }
}

#[inline]
pub(crate) fn put_to_next_tx(stream: &mut Stream, at: usize, packet: Packet) {
    let next = stream.tx_stage(at + 1);
    next.outgoing(stream, at + 1, packet);
}

#[inline]
pub(crate) fn put_to_next_rx(stream: &mut Stream, at: usize, packet: Packet) {
    let next = stream.rx_stage(at + 1);
    next.incoming(stream, at + 1, packet);
}
