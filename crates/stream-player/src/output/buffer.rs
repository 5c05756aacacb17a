//! Fixed-capacity hardware buffers and the slot-indexed pool that tracks them.
//!
//! A [`HardwareBuffer`] is a plain owned value. Moving it into
//! [`OutputDevice::enqueue`](super::OutputDevice::enqueue) hands it to the device;
//! it comes back through the consumed notification. [`BufferPool`] mirrors that
//! ownership per slot so a buffer can never be submitted twice.

use std::collections::VecDeque;

use crate::error::{PlayerError, Result};
use crate::packet::PacketDescriptor;
use crate::store::{CopiedRange, PacketStore};

/// Index of a buffer within its session's pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferSlot(usize);

impl BufferSlot {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

/// Current owner of a pool slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferOwner {
    Application,
    Hardware,
}

/// Fixed-size byte region plus the descriptors of the packets it holds.
#[derive(Debug)]
pub struct HardwareBuffer {
    slot: BufferSlot,
    data: Box<[u8]>,
    len: usize,
    descriptors: Vec<PacketDescriptor>,
}

impl HardwareBuffer {
    /// Allocate a zeroed buffer, reporting allocation failure instead of aborting.
    pub fn try_new(slot: BufferSlot, capacity: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity).map_err(|err| {
            PlayerError::BufferAllocation(format!("{capacity} bytes for slot {}: {err}", slot.0))
        })?;
        data.resize(capacity, 0);
        Ok(Self {
            slot,
            data: data.into_boxed_slice(),
            len: 0,
            descriptors: Vec::new(),
        })
    }

    pub fn slot(&self) -> BufferSlot {
        self.slot
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Filled byte length.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Filled bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn descriptors(&self) -> &[PacketDescriptor] {
        &self.descriptors
    }

    pub fn packet_count(&self) -> usize {
        self.descriptors.len()
    }

    /// Iterate the packets held by the buffer in order.
    pub fn packets(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.descriptors.iter().map(|d| &self.data[d.range()])
    }

    /// Replace the contents with up to `count` packets from `store` starting at `start`.
    pub fn fill_from(&mut self, store: &PacketStore, start: usize, count: usize) -> CopiedRange {
        let copied = store.copy_range(start, count, &mut self.data, &mut self.descriptors);
        self.len = copied.bytes;
        copied
    }

    /// Replace the contents with the given packets, stopping at the first that does not fit.
    ///
    /// Returns the number of packets written.
    pub fn fill_with<'a>(&mut self, packets: impl IntoIterator<Item = &'a [u8]>) -> usize {
        self.clear();
        for packet in packets {
            if !self.push_packet(packet) {
                break;
            }
        }
        self.descriptors.len()
    }

    /// Append one packet after the current contents. Returns `false` if it does not fit.
    pub fn push_packet(&mut self, packet: &[u8]) -> bool {
        let end = self.len + packet.len();
        if end > self.data.len() {
            return false;
        }
        self.data[self.len..end].copy_from_slice(packet);
        self.descriptors.push(PacketDescriptor {
            start_offset: self.len,
            byte_size: packet.len(),
        });
        self.len = end;
        true
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.descriptors.clear();
    }
}

/// Per-slot ownership ledger plus the buffers currently parked with the application.
#[derive(Debug)]
pub struct BufferPool {
    owners: Vec<BufferOwner>,
    parked: VecDeque<HardwareBuffer>,
    released: bool,
}

impl BufferPool {
    pub fn new(slots: usize) -> Self {
        Self {
            owners: vec![BufferOwner::Application; slots],
            parked: VecDeque::with_capacity(slots),
            released: false,
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn owner(&self, slot: BufferSlot) -> Option<BufferOwner> {
        self.owners.get(slot.0).copied()
    }

    /// Buffers currently held by the device.
    pub fn in_flight(&self) -> usize {
        self.owners
            .iter()
            .filter(|o| **o == BufferOwner::Hardware)
            .count()
    }

    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    /// `true` when every slot is parked with the application.
    pub fn all_parked(&self) -> bool {
        self.parked.len() == self.owners.len()
    }

    /// Keep an application-owned buffer idle until data is available.
    pub fn park(&mut self, buffer: HardwareBuffer) -> Result<()> {
        let slot = buffer.slot();
        match self.owner(slot) {
            None => Err(PlayerError::Internal(format!("unknown buffer slot {}", slot.0))),
            Some(BufferOwner::Hardware) => Err(PlayerError::Internal(format!(
                "slot {} parked while owned by hardware",
                slot.0
            ))),
            Some(BufferOwner::Application) => {
                if self.parked.iter().any(|b| b.slot() == slot) {
                    return Err(PlayerError::Internal(format!("slot {} parked twice", slot.0)));
                }
                if !self.released {
                    self.parked.push_back(buffer);
                }
                Ok(())
            }
        }
    }

    pub fn take_parked(&mut self) -> Option<HardwareBuffer> {
        self.parked.pop_front()
    }

    /// Record that `slot` is being handed to the device.
    pub fn mark_submitted(&mut self, slot: BufferSlot) -> Result<()> {
        if self.released {
            return Err(PlayerError::Internal("buffer submitted after release".into()));
        }
        match self.owners.get_mut(slot.0) {
            None => Err(PlayerError::Internal(format!("unknown buffer slot {}", slot.0))),
            Some(BufferOwner::Hardware) => Err(PlayerError::Internal(format!(
                "slot {} enqueued twice",
                slot.0
            ))),
            Some(owner) => {
                *owner = BufferOwner::Hardware;
                Ok(())
            }
        }
    }

    /// Record that the device returned `slot`.
    pub fn reclaim(&mut self, slot: BufferSlot) -> Result<()> {
        match self.owners.get_mut(slot.0) {
            Some(owner) if *owner == BufferOwner::Hardware => {
                *owner = BufferOwner::Application;
                Ok(())
            }
            Some(_) => Err(PlayerError::Internal(format!(
                "slot {} returned but not owned by hardware",
                slot.0
            ))),
            None => Err(PlayerError::Internal(format!("unknown buffer slot {}", slot.0))),
        }
    }

    /// Drop parked buffers and forget hardware ownership.
    ///
    /// Returns the number of buffers freed here; later calls free nothing.
    pub fn release_all(&mut self) -> usize {
        if self.released {
            return 0;
        }
        self.released = true;
        let freed = self.parked.len();
        self.parked.clear();
        self.owners.fill(BufferOwner::Application);
        freed
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}
