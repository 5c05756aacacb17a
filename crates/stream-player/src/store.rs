//! Append-only log of received packets.
//!
//! The network path appends packets as the demuxer delimits them while the
//! output path copies windows of packets into hardware buffers.
//!
//! ## Design
//! - **Append-only**: packets are never removed or reordered, so an index stays
//!   valid for the lifetime of the store.
//! - The published length is an atomic written with `Release` after each append
//!   and read with `Acquire`, so `count()` never takes a lock.
//! - Copies hold a read lock only for a bounded memcpy into a fixed buffer.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::packet::{Packet, PacketDescriptor};

/// Result of [`PacketStore::copy_range`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CopiedRange {
    /// Packets written to the destination.
    pub packets: usize,
    /// Bytes written to the destination.
    pub bytes: usize,
}

#[derive(Debug, Default)]
pub struct PacketStore {
    packets: RwLock<Vec<Packet>>,
    published: AtomicUsize,
    total_bytes: AtomicU64,
    max_packet_size: AtomicUsize,
}

impl PacketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one packet at the end of the log.
    pub fn append(&self, packet: Packet) {
        self.append_batch(std::iter::once(packet));
    }

    /// Append packets in order under a single write lock.
    pub fn append_batch(&self, packets: impl IntoIterator<Item = Packet>) {
        let mut g = self.packets.write().unwrap_or_else(PoisonError::into_inner);
        let mut added_bytes = 0u64;
        let mut largest = 0usize;
        for packet in packets {
            added_bytes += packet.size() as u64;
            largest = largest.max(packet.size());
            g.push(packet);
        }
        let len = g.len();
        drop(g);

        self.total_bytes.fetch_add(added_bytes, Ordering::Relaxed);
        self.max_packet_size.fetch_max(largest, Ordering::Relaxed);
        self.published.store(len, Ordering::Release);
    }

    /// Number of packets appended so far.
    pub fn count(&self) -> usize {
        self.published.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Total compressed bytes appended so far.
    pub fn total_appended_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Largest packet observed so far.
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size.load(Ordering::Relaxed)
    }

    /// Clone of the packet at `index`, if it has been appended.
    pub fn packet(&self, index: usize) -> Option<Packet> {
        let g = self.packets.read().unwrap_or_else(PoisonError::into_inner);
        g.get(index).cloned()
    }

    /// Sum of packet sizes in the half-open `range`, clamped to the published length.
    pub fn total_bytes(&self, range: Range<usize>) -> usize {
        let available = self.count();
        let end = range.end.min(available);
        if range.start >= end {
            return 0;
        }
        let g = self.packets.read().unwrap_or_else(PoisonError::into_inner);
        g[range.start..end].iter().map(Packet::size).sum()
    }

    /// Copy up to `count` packets starting at `start` into `dest`.
    ///
    /// `count` is clamped to the packets available after `start`, and copying stops
    /// before the first packet that would overflow `dest`. `descriptors` is cleared
    /// and receives one `(offset, size)` entry per copied packet.
    ///
    /// Never blocks waiting for data; returns zero packets when none are available.
    pub fn copy_range(
        &self,
        start: usize,
        count: usize,
        dest: &mut [u8],
        descriptors: &mut Vec<PacketDescriptor>,
    ) -> CopiedRange {
        descriptors.clear();
        let available = self.count();
        if start >= available {
            return CopiedRange::default();
        }
        let count = count.min(available - start);

        let g = self.packets.read().unwrap_or_else(PoisonError::into_inner);
        let mut offset = 0usize;
        for packet in &g[start..start + count] {
            let size = packet.size();
            if offset + size > dest.len() {
                break;
            }
            dest[offset..offset + size].copy_from_slice(packet.bytes());
            descriptors.push(PacketDescriptor {
                start_offset: offset,
                byte_size: size,
            });
            offset += size;
        }

        CopiedRange {
            packets: descriptors.len(),
            bytes: offset,
        }
    }
}
