//! Bounded packet queues sitting between pipeline stages.
//!
//! A queue buffers packets for its owning stage's service routine. `count`
//! tracks buffered content bytes (prefixes excluded) against the `max`
//! high-water mark; `packet_size` is the largest packet the downstream side
//! will take in one piece.

use crate::pipeline::packet::{Packet, PacketKind};
use std::collections::VecDeque;

#[derive(Debug)]
pub struct Queue {
    pub(crate) name: &'static str,
    packets: VecDeque<Packet>,
    pub(crate) count: usize,
    pub(crate) max: usize,
    pub(crate) packet_size: usize,
    /// HTTP/2 flow-control credit for the network output queue, replenished
    /// from peer WINDOW_UPDATEs.
    pub(crate) window: i64,
    suspended: bool,
    pub(crate) serviced: bool,
    pub(crate) disabled: bool,
    scheduled: bool,
}

impl Queue {
    pub(crate) fn new(name: &'static str, max: usize, packet_size: usize) -> Self {
        Queue {
            name,
            packets: VecDeque::new(),
            count: 0,
            max,
            packet_size,
            window: 0,
            suspended: false,
            serviced: false,
            disabled: false,
            scheduled: false,
        }
    }

    #[inline(always)]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    #[inline(always)]
    pub fn first(&self) -> Option<&Packet> {
        self.packets.front()
    }

    #[inline(always)]
    pub fn last(&self) -> Option<&Packet> {
        self.packets.back()
    }

    pub(crate) fn first_mut(&mut self) -> Option<&mut Packet> {
        self.packets.front_mut()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.packets.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Packet> {
        self.packets.iter_mut()
    }

    /// Enqueues a packet at the tail.
    pub fn put(&mut self, packet: Packet) {
        self.count += packet.len();
        self.packets.push_back(packet);
    }

    /// Pushes a packet back onto the head for retry after a refusal.
    pub fn put_back(&mut self, packet: Packet) {
        self.count += packet.len();
        self.packets.push_front(packet);
    }

    /// Dequeues the head packet.
    pub fn get(&mut self) -> Option<Packet> {
        let packet = self.packets.pop_front()?;
        self.count -= packet.len();
        Some(packet)
    }

    /// Whether this queue will admit `packet` without breaching `max`.
    ///
    /// An empty queue always admits one packet so progress is never wedged on
    /// a single oversized write.
    pub fn will_accept(&self, packet: &Packet) -> bool {
        let size = packet.len();
        size == 0 || self.count == 0 || self.count + size <= self.max
    }

    /// Shrinks `packet` in place to at most `max` content bytes, pushing the
    /// remainder back onto the head of this queue.
    pub fn resize(&mut self, packet: &mut Packet, max: usize) {
        if packet.len() > max {
            let tail = packet.split(max);
            self.put_back(tail);
        }
    }

    /// Coalesces a data packet onto the queue tail when contiguous, otherwise
    /// enqueues it. Solo packets are never joined.
    pub fn join(&mut self, packet: Packet) {
        if packet.kind() == PacketKind::Data {
            if let Some(last) = self.packets.back_mut() {
                if last.kind() == PacketKind::Data {
                    self.count += packet.len();
                    last.join(packet);
                    return;
                }
            }
        }
        self.put(packet);
    }

    /// Removes an empty packet at position `at`, keeping END packets.
    pub(crate) fn remove_empty_at(&mut self, at: usize) {
        if let Some(p) = self.packets.get(at) {
            if p.total_len() == 0 && !p.is_end() {
                self.packets.remove(at);
            }
        }
    }

    #[inline(always)]
    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    #[inline(always)]
    pub fn resume(&mut self) {
        self.suspended = false;
        if !self.packets.is_empty() {
            self.scheduled = true;
        }
    }

    #[inline(always)]
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Marks the queue for service. Suspended queues stay unscheduled even
    /// when non-empty.
    #[inline(always)]
    pub fn schedule(&mut self) {
        if !self.suspended {
            self.scheduled = true;
        }
    }

    #[inline(always)]
    pub(crate) fn take_scheduled(&mut self) -> bool {
        let was = self.scheduled && !self.suspended;
        if was {
            self.scheduled = false;
        }
        was
    }

    #[inline(always)]
    pub(crate) fn is_scheduled(&self) -> bool {
        self.scheduled && !self.suspended
    }
}

#[cfg(test)]
mod queue {
    use super::*;

    fn q() -> Queue {
        Queue::new("test", 100, 50)
    }

    #[test]
    fn count_tracks_content_only() {
        let mut q = q();
        let mut p = Packet::data(b"0123456789");
        p.set_prefix(b"a\r\n");

        q.put(p);
        q.put(Packet::end());
        assert_eq!(q.count(), 10);

        let got = q.get().unwrap();
        assert_eq!(got.len(), 10);
        assert_eq!(q.count(), 0);
        assert!(q.get().unwrap().is_end());
    }

    #[test]
    fn put_back_restores_order_and_count() {
        let mut q = q();
        q.put(Packet::data(b"second"));

        q.put_back(Packet::data(b"first!"));
        assert_eq!(q.count(), 12);
        assert_eq!(q.get().unwrap().content(), b"first!");
        assert_eq!(q.get().unwrap().content(), b"second");
    }

    #[test]
    fn admission() {
        let mut q = q();
        assert!(q.will_accept(&Packet::data(&[0u8; 100])));
        assert!(q.will_accept(&Packet::data(&[0u8; 1000])));

        q.put(Packet::data(&[0u8; 60]));
        assert!(q.will_accept(&Packet::data(&[0u8; 40])));
        assert!(!q.will_accept(&Packet::data(&[0u8; 41])));
        assert!(q.will_accept(&Packet::end()));
    }

    #[test]
    fn resize_puts_tail_back() {
        let mut q = q();
        let mut p = Packet::data(b"0123456789");

        q.resize(&mut p, 4);
        assert_eq!(p.content(), b"0123");
        assert_eq!(q.first().unwrap().content(), b"456789");
        assert_eq!(q.count(), 6);
    }

    #[test]
    fn join_coalesces_data() {
        let mut q = q();
        q.join(Packet::data(b"abc"));
        q.join(Packet::data(b"def"));
        q.join(Packet::solo(b"ghi"));
        q.join(Packet::data(b"jkl"));

        assert_eq!(q.count(), 12);
        assert_eq!(q.get().unwrap().content(), b"abcdef");
        assert_eq!(q.get().unwrap().content(), b"ghi");
        assert_eq!(q.get().unwrap().content(), b"jkl");
    }

    #[test]
    fn suspended_queue_is_not_scheduled() {
        let mut q = q();
        q.put(Packet::data(b"x"));

        q.suspend();
        q.schedule();
        assert!(!q.take_scheduled());

        q.resume();
        assert!(q.take_scheduled());
        assert!(!q.take_scheduled());
    }
}
