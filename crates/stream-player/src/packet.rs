/// One compressed packet as delimited by the demuxer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    data: Box<[u8]>,
}

impl Packet {
    pub fn new(data: impl Into<Box<[u8]>>) -> Self {
        Self { data: data.into() }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self { data: data.into() }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Position of one packet inside a hardware buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketDescriptor {
    /// Byte offset of the packet from the start of the buffer.
    pub start_offset: usize,
    /// Packet length in bytes.
    pub byte_size: usize,
}

impl PacketDescriptor {
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start_offset..self.start_offset + self.byte_size
    }
}
