//! Attach-time device descriptor.
//!
//! The device model hands the guest one of these at initialization. It names
//! where in the shared region each ring and interrupt word lives, which port
//! block to ring, and the slot-addressing geometry. A `version` mismatch is a
//! fatal attach error; nothing about the descriptor is renegotiable later.

use thiserror::Error;

pub const PRISM_DEVICE_INFO_VERSION: u32 = 3;

/// The main memory slot as pre-registered by the device at reset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MainSlotInfo {
    pub generation: u32,
    pub phys_start: u64,
    pub phys_end: u64,
    pub virt_start: u64,
    pub virt_end: u64,
}

#[derive(Clone, Debug)]
pub struct DeviceInfoDesc {
    pub version: u32,

    /// Base of the doorbell port block (see [`crate::ports`]).
    pub io_base: u16,

    // Offsets into the shared region, all relative to its base.
    pub cmd_ring_offset: u64,
    pub cursor_ring_offset: u64,
    pub release_ring_offset: u64,
    pub int_pending_offset: u64,
    pub int_mask_offset: u64,
    pub slots_generation_offset: u64,
    pub slot_range_start_offset: u64,
    pub slot_range_end_offset: u64,
    pub primary_create_offset: u64,

    // Slot addressing geometry.
    pub slot_id_bits: u32,
    pub slot_gen_bits: u32,
    pub num_slots: u32,
    pub main_slot_id: u8,
    pub main_slot: MainSlotInfo,

    // Surfaces.
    pub n_surfaces: u32,
    pub primary_area_offset: u64,
    pub primary_area_size: u64,

    // VRAM aperture backing off-screen surfaces.
    pub vram_phys_start: u64,
    pub vram_phys_end: u64,
    pub vram_virt_start: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum DeviceInfoError {
    #[error("descriptor version mismatch: device {found}, driver {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("bad slot address geometry: {id_bits} id bits + {gen_bits} generation bits")]
    BadSlotBits { id_bits: u32, gen_bits: u32 },
    #[error("bad slot count {num_slots} (main slot {main_slot_id}, {id_bits} id bits)")]
    BadSlotCount {
        num_slots: u32,
        main_slot_id: u8,
        id_bits: u32,
    },
    #[error("surface count {found} outside 1..=256")]
    BadSurfaceCount { found: u32 },
    #[error("VRAM physical range is inverted: {start:#x}..{end:#x}")]
    BadVramRange { start: u64, end: u64 },
}

impl DeviceInfoDesc {
    pub fn validate(&self) -> Result<(), DeviceInfoError> {
        if self.version != PRISM_DEVICE_INFO_VERSION {
            return Err(DeviceInfoError::VersionMismatch {
                found: self.version,
                expected: PRISM_DEVICE_INFO_VERSION,
            });
        }
        // Offsets need at least one low bit left over to address into a slot.
        if self.slot_id_bits == 0
            || self.slot_gen_bits == 0
            || self.slot_id_bits + self.slot_gen_bits >= 64
        {
            return Err(DeviceInfoError::BadSlotBits {
                id_bits: self.slot_id_bits,
                gen_bits: self.slot_gen_bits,
            });
        }
        // Slot ids travel in the memslot doorbells' value byte.
        let max_slots = (1u64 << self.slot_id_bits.min(32)).min(256);
        if self.num_slots == 0
            || u64::from(self.num_slots) > max_slots
            || u32::from(self.main_slot_id) >= self.num_slots
        {
            return Err(DeviceInfoError::BadSlotCount {
                num_slots: self.num_slots,
                main_slot_id: self.main_slot_id,
                id_bits: self.slot_id_bits,
            });
        }
        // Surface ids travel in the destroy doorbell's value byte.
        if self.n_surfaces == 0 || self.n_surfaces > 256 {
            return Err(DeviceInfoError::BadSurfaceCount {
                found: self.n_surfaces,
            });
        }
        if self.vram_phys_end < self.vram_phys_start {
            return Err(DeviceInfoError::BadVramRange {
                start: self.vram_phys_start,
                end: self.vram_phys_end,
            });
        }
        Ok(())
    }
}
