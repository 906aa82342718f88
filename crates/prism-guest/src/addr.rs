//! Device-visible address codec.
//!
//! A device-visible address packs the memory-slot identity into the pointer
//! itself: `(slot_id || generation)` in the high bits, the byte offset into
//! the slot in the rest. The device resolves guest memory from the id without
//! a page-table walk, and the generation lets stale addresses (encoded before
//! a device reset) be rejected without scanning outstanding commands.
//!
//! Bit widths come from the attach descriptor and are fixed for the lifetime
//! of a session. Everything here is a pure function of `(layout, inputs)`.

use thiserror::Error;

/// Opaque device-visible pointer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DeviceAddress(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodedAddress {
    pub slot_id: u8,
    pub generation: u32,
    pub offset: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("slot id/generation widths {id_bits}+{gen_bits} exceed 64 bits")]
    BadLayout { id_bits: u32, gen_bits: u32 },
    #[error("slot id {slot_id} does not fit in {id_bits} bits")]
    InvalidSlotId { slot_id: u8, id_bits: u32 },
    #[error("offset {offset:#x} exceeds the {offset_bits}-bit slot address space")]
    InvalidOffset { offset: u64, offset_bits: u32 },
}

/// Slot-address bit widths. `slot_id_bits + slot_gen_bits <= 64`; zero widths
/// are legal (a zero-width field can only hold the value 0).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressLayout {
    slot_id_bits: u32,
    slot_gen_bits: u32,
}

impl AddressLayout {
    pub fn new(slot_id_bits: u32, slot_gen_bits: u32) -> Result<Self, AddressError> {
        if slot_id_bits.checked_add(slot_gen_bits).map_or(true, |s| s > 64) {
            return Err(AddressError::BadLayout {
                id_bits: slot_id_bits,
                gen_bits: slot_gen_bits,
            });
        }
        Ok(Self {
            slot_id_bits,
            slot_gen_bits,
        })
    }

    pub fn slot_id_bits(&self) -> u32 {
        self.slot_id_bits
    }

    pub fn slot_gen_bits(&self) -> u32 {
        self.slot_gen_bits
    }

    pub fn offset_bits(&self) -> u32 {
        64 - self.slot_id_bits - self.slot_gen_bits
    }

    /// Mask covering the offset portion of an address.
    pub fn offset_mask(&self) -> u64 {
        mask(self.offset_bits())
    }

    /// Mask covering the generation field's width.
    pub fn generation_mask(&self) -> u64 {
        mask(self.slot_gen_bits)
    }

    /// The fully-shifted `(slot_id || generation)` prefix. OR-ing this with an
    /// in-range offset yields the encoded address, so a slot's prefix can be
    /// computed once per (re)registration.
    pub fn high_bits(&self, slot_id: u8, generation: u32) -> Result<u64, AddressError> {
        if u64::from(slot_id) > mask(self.slot_id_bits) {
            return Err(AddressError::InvalidSlotId {
                slot_id,
                id_bits: self.slot_id_bits,
            });
        }
        let packed =
            (u64::from(slot_id) << self.slot_gen_bits) | (u64::from(generation) & self.generation_mask());
        Ok(shl64(packed, self.offset_bits()))
    }

    pub fn encode(
        &self,
        slot_id: u8,
        generation: u32,
        offset: u64,
    ) -> Result<DeviceAddress, AddressError> {
        if offset > self.offset_mask() {
            return Err(AddressError::InvalidOffset {
                offset,
                offset_bits: self.offset_bits(),
            });
        }
        Ok(DeviceAddress(self.high_bits(slot_id, generation)? | offset))
    }

    /// Pure bit extraction; total. The returned generation is truncated to
    /// `slot_gen_bits`, matching what `encode` stored.
    pub fn decode(&self, addr: DeviceAddress) -> DecodedAddress {
        let packed = shr64(addr.0, self.offset_bits());
        let slot_id = (shr64(packed, self.slot_gen_bits) & mask(self.slot_id_bits)) as u8;
        let generation = (packed & self.generation_mask()) as u32;
        DecodedAddress {
            slot_id,
            generation,
            offset: addr.0 & self.offset_mask(),
        }
    }
}

fn mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

// Shifts by the full word width appear when one side of the layout has zero
// bits; Rust's `<<`/`>>` panic there, so saturate to 0 instead.
fn shl64(v: u64, by: u32) -> u64 {
    if by >= 64 {
        0
    } else {
        v << by
    }
}

fn shr64(v: u64, by: u32) -> u64 {
    if by >= 64 {
        0
    } else {
        v >> by
    }
}
