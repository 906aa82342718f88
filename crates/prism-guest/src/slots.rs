//! Memory-slot table.
//!
//! A slot is a registered region of guest memory the device may dereference.
//! The table owns slot state on the driver side; the device learns about
//! slots through the range-writeback words in the shared region plus the
//! `MEMSLOT_ADD`/`MEMSLOT_DEL` doorbells, and assigns the generation that
//! every address encoded against the slot must carry.
//!
//! Ordering contract: the device and driver must agree on a slot's existence
//! before any address referencing it is submitted, so `create_slot` rings the
//! doorbell before returning and `remove_slot` rings it before deactivating
//! local state.

use tracing::{debug, warn};

use prism_protocol::info::{DeviceInfoDesc, MainSlotInfo};
use prism_protocol::ports;
use thiserror::Error;

use crate::addr::{AddressError, AddressLayout, DeviceAddress};
use crate::shmem::{Doorbell, SharedMemory};

pub type SlotId = u8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemorySlot {
    pub generation: u32,
    pub phys_start: u64,
    pub phys_end: u64,
    pub virt_start: u64,
    pub virt_end: u64,
    high_bits: u64,
}

impl MemorySlot {
    pub fn byte_len(&self) -> u64 {
        self.virt_end - self.virt_start
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("no free memory-slot id below the device-declared maximum")]
    SlotTableFull,
    #[error("slot {id} is not active")]
    UnknownSlot { id: SlotId },
    #[error("the main slot cannot be removed")]
    RemoveMain,
    #[error("stale reference to slot {slot_id} generation {generation}")]
    StaleSlotReference { slot_id: SlotId, generation: u32 },
    #[error("offset {offset:#x} is outside the {len:#x}-byte slot")]
    OffsetOutOfSlot { offset: u64, len: u64 },
    #[error(transparent)]
    Address(#[from] AddressError),
}

#[derive(Debug)]
pub struct MemorySlotTable {
    layout: AddressLayout,
    slots: Vec<Option<MemorySlot>>,
    main_slot_id: SlotId,
    slots_generation_offset: u64,
    slot_range_start_offset: u64,
    slot_range_end_offset: u64,
}

impl MemorySlotTable {
    pub fn new(info: &DeviceInfoDesc) -> Result<Self, SlotError> {
        let layout = AddressLayout::new(info.slot_id_bits, info.slot_gen_bits)?;
        let mut table = Self {
            layout,
            slots: vec![None; info.num_slots as usize],
            main_slot_id: info.main_slot_id,
            slots_generation_offset: info.slots_generation_offset,
            slot_range_start_offset: info.slot_range_start_offset,
            slot_range_end_offset: info.slot_range_end_offset,
        };
        table.update_main_slot(info.main_slot)?;
        Ok(table)
    }

    pub fn layout(&self) -> AddressLayout {
        self.layout
    }

    pub fn main_slot_id(&self) -> SlotId {
        self.main_slot_id
    }

    pub fn slot(&self, id: SlotId) -> Result<&MemorySlot, SlotError> {
        self.slots
            .get(usize::from(id))
            .and_then(Option::as_ref)
            .ok_or(SlotError::UnknownSlot { id })
    }

    /// Install or reconfigure the reserved main slot (general guest RAM).
    /// The device pre-registers this slot, so no doorbell is involved; the
    /// encoded prefix is recomputed from the current layout.
    pub fn update_main_slot(&mut self, main: MainSlotInfo) -> Result<(), SlotError> {
        let high_bits = self.layout.high_bits(self.main_slot_id, main.generation)?;
        self.slots[usize::from(self.main_slot_id)] = Some(MemorySlot {
            generation: main.generation,
            phys_start: main.phys_start,
            phys_end: main.phys_end,
            virt_start: main.virt_start,
            virt_end: main.virt_end,
            high_bits,
        });
        Ok(())
    }

    /// Register a new slot with the device and return its id.
    ///
    /// The range is written to the shared writeback words, the `MEMSLOT_ADD`
    /// doorbell is rung, and the device-assigned generation is read back
    /// before the slot is considered live.
    pub fn create_slot(
        &mut self,
        mem: &mut dyn SharedMemory,
        bell: &mut dyn Doorbell,
        phys: (u64, u64),
        virt: (u64, u64),
    ) -> Result<SlotId, SlotError> {
        let start = usize::from(self.main_slot_id) + 1;
        let id = (start..self.slots.len())
            .find(|&i| self.slots[i].is_none())
            .ok_or(SlotError::SlotTableFull)? as SlotId;

        mem.write_u64(self.slot_range_start_offset, phys.0);
        mem.write_u64(self.slot_range_end_offset, phys.1);
        bell.ring(ports::MEMSLOT_ADD, id);

        let generation = mem.read_u32(self.slots_generation_offset);
        let high_bits = self.layout.high_bits(id, generation)?;
        self.slots[usize::from(id)] = Some(MemorySlot {
            generation,
            phys_start: phys.0,
            phys_end: phys.1,
            virt_start: virt.0,
            virt_end: virt.1,
            high_bits,
        });
        debug!(id, generation, "memory slot registered");
        Ok(id)
    }

    /// Remove a slot. The device is notified first; afterwards any address
    /// decoding to this id is a stale reference.
    pub fn remove_slot(&mut self, bell: &mut dyn Doorbell, id: SlotId) -> Result<(), SlotError> {
        if id == self.main_slot_id {
            return Err(SlotError::RemoveMain);
        }
        self.slot(id)?;
        bell.ring(ports::MEMSLOT_DEL, id);
        self.slots[usize::from(id)] = None;
        debug!(id, "memory slot removed");
        Ok(())
    }

    /// Encode an in-slot byte offset as a device-visible address.
    pub fn encode(&self, id: SlotId, offset: u64) -> Result<DeviceAddress, SlotError> {
        let slot = self.slot(id)?;
        let len = slot.byte_len();
        if offset >= len {
            return Err(SlotError::OffsetOutOfSlot { offset, len });
        }
        if offset > self.layout.offset_mask() {
            return Err(SlotError::Address(AddressError::InvalidOffset {
                offset,
                offset_bits: self.layout.offset_bits(),
            }));
        }
        Ok(DeviceAddress(slot.high_bits | offset))
    }

    /// Resolve a device-visible address back to `(slot id, offset)`,
    /// rejecting addresses whose slot is gone or whose generation predates
    /// the slot's current registration.
    pub fn resolve(&self, addr: DeviceAddress) -> Result<(SlotId, u64), SlotError> {
        let decoded = self.layout.decode(addr);
        let slot = self.slot(decoded.slot_id).map_err(|_| {
            warn!(
                slot_id = decoded.slot_id,
                generation = decoded.generation,
                "address references an inactive slot"
            );
            SlotError::StaleSlotReference {
                slot_id: decoded.slot_id,
                generation: decoded.generation,
            }
        })?;
        let current = (u64::from(slot.generation) & self.layout.generation_mask()) as u32;
        if current != decoded.generation {
            warn!(
                slot_id = decoded.slot_id,
                stale = decoded.generation,
                current,
                "address carries a stale generation"
            );
            return Err(SlotError::StaleSlotReference {
                slot_id: decoded.slot_id,
                generation: decoded.generation,
            });
        }
        if decoded.offset >= slot.byte_len() {
            return Err(SlotError::OffsetOutOfSlot {
                offset: decoded.offset,
                len: slot.byte_len(),
            });
        }
        Ok((decoded.slot_id, decoded.offset))
    }

    /// Re-synchronize with the device after a reset: the device has dropped
    /// every slot and bumped the generation counter, so non-main slots are
    /// forgotten and the main slot is re-registered under the new generation.
    pub fn on_device_reset(
        &mut self,
        mem: &mut dyn SharedMemory,
        bell: &mut dyn Doorbell,
    ) -> Result<(), SlotError> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if i != usize::from(self.main_slot_id) {
                *slot = None;
            }
        }

        let main = self
            .slots[usize::from(self.main_slot_id)]
            .ok_or(SlotError::UnknownSlot {
                id: self.main_slot_id,
            })?;
        mem.write_u64(self.slot_range_start_offset, main.phys_start);
        mem.write_u64(self.slot_range_end_offset, main.phys_end);
        bell.ring(ports::MEMSLOT_ADD, self.main_slot_id);

        let generation = mem.read_u32(self.slots_generation_offset);
        self.update_main_slot(MainSlotInfo {
            generation,
            phys_start: main.phys_start,
            phys_end: main.phys_end,
            virt_start: main.virt_start,
            virt_end: main.virt_end,
        })?;
        debug!(generation, "main slot re-registered after device reset");
        Ok(())
    }
}
