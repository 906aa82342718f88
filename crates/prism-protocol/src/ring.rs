//! Shared ring layouts.
//!
//! Each of the three rings (command, cursor, release) lives in the shared
//! device region as a fixed header followed by a contiguous array of
//! fixed-stride entry slots. The guest writes `producer` and entry bodies;
//! the device writes `consumer`. No field is written by both sides.
//!
//! Cursors are free-running `u32` counters interpreted modulo the (power of
//! two) capacity; `producer - consumer` is the number of unconsumed entries
//! and never exceeds `capacity`.

use core::mem::offset_of;

use crate::abi::{parse_and_validate_abi_version_u32, AbiError};

pub const PRISM_RING_MAGIC: u32 = 0x474E_5250; // "PRNG" LE

/// Release-ring entries are bare release ids.
pub const RELEASE_ENTRY_SIZE_BYTES: usize = 8;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingHeader {
    pub magic: u32,
    pub abi_version: u32,
    /// Entry slot count. Must be a non-zero power of two.
    pub capacity: u32,
    pub entry_stride_bytes: u32,
    pub producer: u32,
    pub consumer: u32,
    pub reserved0: u32,
    pub reserved1: u32,
}

pub const RING_MAGIC_OFFSET: u64 = offset_of!(RingHeader, magic) as u64;
pub const RING_ABI_VERSION_OFFSET: u64 = offset_of!(RingHeader, abi_version) as u64;
pub const RING_CAPACITY_OFFSET: u64 = offset_of!(RingHeader, capacity) as u64;
pub const RING_ENTRY_STRIDE_BYTES_OFFSET: u64 = offset_of!(RingHeader, entry_stride_bytes) as u64;
pub const RING_PRODUCER_OFFSET: u64 = offset_of!(RingHeader, producer) as u64;
pub const RING_CONSUMER_OFFSET: u64 = offset_of!(RingHeader, consumer) as u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingDecodeError {
    BufferTooSmall { found: usize, need: usize },
    BadMagic { found: u32 },
    Abi(AbiError),
    BadCapacity { found: u32 },
    BadStrideField { found: u32, min: u32 },
}

impl From<AbiError> for RingDecodeError {
    fn from(value: AbiError) -> Self {
        Self::Abi(value)
    }
}

impl RingHeader {
    pub const SIZE_BYTES: usize = 32;

    pub fn encode_to_le_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.abi_version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.capacity.to_le_bytes());
        buf[12..16].copy_from_slice(&self.entry_stride_bytes.to_le_bytes());
        buf[16..20].copy_from_slice(&self.producer.to_le_bytes());
        buf[20..24].copy_from_slice(&self.consumer.to_le_bytes());
        buf[24..28].copy_from_slice(&self.reserved0.to_le_bytes());
        buf[28..32].copy_from_slice(&self.reserved1.to_le_bytes());
        buf
    }

    pub fn decode_from_le_bytes(buf: &[u8]) -> Result<Self, RingDecodeError> {
        if buf.len() < Self::SIZE_BYTES {
            return Err(RingDecodeError::BufferTooSmall {
                found: buf.len(),
                need: Self::SIZE_BYTES,
            });
        }
        let u32_at = |off: usize| {
            u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
        };
        Ok(Self {
            magic: u32_at(0),
            abi_version: u32_at(4),
            capacity: u32_at(8),
            entry_stride_bytes: u32_at(12),
            producer: u32_at(16),
            consumer: u32_at(20),
            reserved0: u32_at(24),
            reserved1: u32_at(28),
        })
    }

    /// Validate everything except the cursor fields (which are live state,
    /// not configuration).
    ///
    /// `min_entry_stride_bytes` is the size of the entry type the caller
    /// expects; a larger stride is accepted for forward compatibility.
    pub fn validate(&self, min_entry_stride_bytes: u32) -> Result<(), RingDecodeError> {
        if self.magic != PRISM_RING_MAGIC {
            return Err(RingDecodeError::BadMagic { found: self.magic });
        }
        parse_and_validate_abi_version_u32(self.abi_version)?;
        if self.capacity == 0 || !self.capacity.is_power_of_two() {
            return Err(RingDecodeError::BadCapacity {
                found: self.capacity,
            });
        }
        if self.entry_stride_bytes < min_entry_stride_bytes {
            return Err(RingDecodeError::BadStrideField {
                found: self.entry_stride_bytes,
                min: min_entry_stride_bytes,
            });
        }
        Ok(())
    }

    /// Map a free-running cursor value to an entry slot index.
    pub fn slot_index(&self, cursor: u32) -> u32 {
        // capacity is validated as a power of two.
        cursor & (self.capacity - 1)
    }
}

/// Command-ring entry. `addr` is a device-visible (slot-encoded) address of
/// the command payload in guest memory.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandDesc {
    pub addr: u64,
    pub kind: u32,
    pub reserved0: u32,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    Nop = 0,
    Draw = 1,
    Update = 2,
    Surface = 3,
}

impl CommandKind {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Nop),
            1 => Some(Self::Draw),
            2 => Some(Self::Update),
            3 => Some(Self::Surface),
            _ => None,
        }
    }
}

impl CommandDesc {
    pub const SIZE_BYTES: usize = 16;

    pub fn encode_to_le_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..8].copy_from_slice(&self.addr.to_le_bytes());
        buf[8..12].copy_from_slice(&self.kind.to_le_bytes());
        buf[12..16].copy_from_slice(&self.reserved0.to_le_bytes());
        buf
    }

    pub fn decode_from_le_bytes(buf: &[u8]) -> Result<Self, RingDecodeError> {
        if buf.len() < Self::SIZE_BYTES {
            return Err(RingDecodeError::BufferTooSmall {
                found: buf.len(),
                need: Self::SIZE_BYTES,
            });
        }
        Ok(Self {
            addr: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            kind: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            reserved0: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        })
    }
}

/// Cursor-ring entry. Kept on a separate ring so pointer updates are never
/// queued behind bulk drawing.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CursorDesc {
    pub addr: u64,
    pub kind: u32,
    pub reserved0: u32,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CursorKind {
    Set = 0,
    Move = 1,
    Hide = 2,
    Trail = 3,
}

impl CursorKind {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Set),
            1 => Some(Self::Move),
            2 => Some(Self::Hide),
            3 => Some(Self::Trail),
            _ => None,
        }
    }
}

impl CursorDesc {
    pub const SIZE_BYTES: usize = 16;

    pub fn encode_to_le_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..8].copy_from_slice(&self.addr.to_le_bytes());
        buf[8..12].copy_from_slice(&self.kind.to_le_bytes());
        buf[12..16].copy_from_slice(&self.reserved0.to_le_bytes());
        buf
    }

    pub fn decode_from_le_bytes(buf: &[u8]) -> Result<Self, RingDecodeError> {
        if buf.len() < Self::SIZE_BYTES {
            return Err(RingDecodeError::BufferTooSmall {
                found: buf.len(),
                need: Self::SIZE_BYTES,
            });
        }
        Ok(Self {
            addr: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            kind: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            reserved0: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        })
    }
}
