//! Packets are the unit of data flowing through pipeline queues.
//!
//! A packet carries an optional framing `prefix` (e.g. a chunk header) and an
//! optional `content` buffer. Once a packet has been consumed by a queue its
//! buffers may only be advanced from the front, never rewritten.

use bytes::{Buf, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Response or request header block. Materialised exactly once by the
    /// header writer on its way to the wire.
    Header,
    /// Entity data.
    Data,
    /// Synthetic multipart range boundary. Behaves as data on the wire.
    Range,
    /// Opaque body fragment that must not be coalesced with its neighbours.
    Solo,
    /// Terminates the stream. Carries no payload and is never written.
    End,
}

#[derive(Debug)]
pub struct Packet {
    pub(crate) kind: PacketKind,
    pub(crate) prefix: Option<BytesMut>,
    pub(crate) content: Option<BytesMut>,
}

impl Packet {
    #[inline]
    pub fn header() -> Self {
        Packet {
            kind: PacketKind::Header,
            prefix: None,
            content: None,
        }
    }

    #[inline]
    pub fn data(content: &[u8]) -> Self {
        Packet {
            kind: PacketKind::Data,
            prefix: None,
            content: Some(BytesMut::from(content)),
        }
    }

    #[inline]
    pub fn solo(content: &[u8]) -> Self {
        Packet {
            kind: PacketKind::Solo,
            prefix: None,
            content: Some(BytesMut::from(content)),
        }
    }

    #[inline]
    pub(crate) fn range(content: &[u8]) -> Self {
        Packet {
            kind: PacketKind::Range,
            prefix: None,
            content: Some(BytesMut::from(content)),
        }
    }

    #[inline]
    pub fn end() -> Self {
        Packet {
            kind: PacketKind::End,
            prefix: None,
            content: None,
        }
    }

    #[inline(always)]
    pub const fn kind(&self) -> PacketKind {
        self.kind
    }

    /// Content length. Framing prefixes are not included.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.content.as_ref().map_or(0, |c| c.len())
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    pub fn prefix_len(&self) -> usize {
        self.prefix.as_ref().map_or(0, |p| p.len())
    }

    #[inline(always)]
    pub fn total_len(&self) -> usize {
        self.prefix_len() + self.len()
    }

    /// Data-bearing packets: plain data, range boundaries and solo bodies.
    #[inline(always)]
    pub fn is_data(&self) -> bool {
        matches!(
            self.kind,
            PacketKind::Data | PacketKind::Range | PacketKind::Solo
        )
    }

    #[inline(always)]
    pub fn is_end(&self) -> bool {
        self.kind == PacketKind::End
    }

    #[inline]
    pub fn set_prefix(&mut self, prefix: &[u8]) {
        self.prefix = Some(BytesMut::from(prefix));
    }

    /// Appends bytes to the content buffer, allocating it on first use.
    #[inline]
    pub fn write(&mut self, data: &[u8]) {
        match &mut self.content {
            Some(buf) => buf.extend_from_slice(data),
            None => self.content = Some(BytesMut::from(data)),
        }
    }

    pub(crate) fn content(&self) -> &[u8] {
        self.content.as_deref().unwrap_or(&[])
    }

    pub(crate) fn prefix_bytes(&self) -> &[u8] {
        self.prefix.as_deref().unwrap_or(&[])
    }

    /// Splits this packet at `at` content bytes, returning the tail.
    ///
    /// The head keeps its prefix and kind; the tail carries only content.
    pub fn split(&mut self, at: usize) -> Packet {
        debug_assert!(at <= self.len());
        let tail = self
            .content
            .as_mut()
            .map(|c| c.split_off(at))
            .unwrap_or_default();
        Packet {
            kind: self.kind,
            prefix: None,
            content: Some(tail),
        }
    }

    /// Discards `n` bytes from the front of the content.
    pub fn adjust_start(&mut self, n: usize) {
        if let Some(content) = &mut self.content {
            let n = n.min(content.len());
            content.advance(n);
        }
    }

    /// Consumes up to `n` prefix bytes; returns how many were consumed.
    pub(crate) fn consume_prefix(&mut self, n: usize) -> usize {
        match &mut self.prefix {
            Some(prefix) => {
                let take = n.min(prefix.len());
                prefix.advance(take);
                if prefix.is_empty() {
                    self.prefix = None;
                }
                take
            }
            None => 0,
        }
    }

    /// Consumes up to `n` content bytes; returns how many were consumed.
    pub(crate) fn consume_content(&mut self, n: usize) -> usize {
        match &mut self.content {
            Some(content) => {
                let take = n.min(content.len());
                content.advance(take);
                take
            }
            None => 0,
        }
    }

    /// Coalesces `other`'s content onto this packet.
    pub fn join(&mut self, other: Packet) {
        if let Some(content) = other.content {
            match &mut self.content {
                Some(buf) => buf.extend_from_slice(&content),
                None => self.content = Some(content),
            }
        }
    }
}
