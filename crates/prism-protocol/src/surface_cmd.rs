//! Primary-surface create block.
//!
//! The primary surface is not created through the command ring: the guest
//! fills this block at a fixed offset in the shared region and rings the
//! `CREATE_PRIMARY` doorbell. `mem` is the device-visible (slot-encoded)
//! address of the first scanline.

use crate::ring::RingDecodeError;

pub const SURFACE_KIND_PRIMARY: u32 = 0;

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceFormat {
    R5G6B5 = 16,
    B8G8R8X8 = 32,
    B8G8R8A8 = 36,
}

impl SurfaceFormat {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            16 => Some(Self::R5G6B5),
            32 => Some(Self::B8G8R8X8),
            36 => Some(Self::B8G8R8A8),
            _ => None,
        }
    }

    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::R5G6B5 => 2,
            Self::B8G8R8X8 | Self::B8G8R8A8 => 4,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrimarySurfaceCreate {
    pub format: u32,
    pub width: u32,
    pub height: u32,
    /// Negative stride: `mem` points at the top scanline of a bottom-up
    /// framebuffer.
    pub stride: i32,
    pub mem: u64,
    pub flags: u32,
    pub kind: u32,
}

impl PrimarySurfaceCreate {
    pub const SIZE_BYTES: usize = 32;

    pub fn encode_to_le_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&self.format.to_le_bytes());
        buf[4..8].copy_from_slice(&self.width.to_le_bytes());
        buf[8..12].copy_from_slice(&self.height.to_le_bytes());
        buf[12..16].copy_from_slice(&self.stride.to_le_bytes());
        buf[16..24].copy_from_slice(&self.mem.to_le_bytes());
        buf[24..28].copy_from_slice(&self.flags.to_le_bytes());
        buf[28..32].copy_from_slice(&self.kind.to_le_bytes());
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
            format: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            width: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            height: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            stride: i32::from_le_bytes(buf[12..16].try_into().unwrap()),
            mem: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            kind: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
        })
    }
}
