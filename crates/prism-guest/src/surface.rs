//! Surface registry.
//!
//! Surface 0 is the singleton primary (the scanout target); ids in
//! `[1, n_surfaces)` form a bounded pool for off-screen surfaces backed by
//! the VRAM slot.
//!
//! Destroying a pooled surface is a two-phase barrier: `begin_destroy` moves
//! the surface to `Destroying` and notifies the device, and only
//! `complete_destroy` (legal once the destroy-completion signal has been
//! observed) returns the id to the pool. Without the barrier a fresh
//! allocation could reuse an id the device is still tearing down.

use thiserror::Error;
use tracing::debug;

use prism_protocol::ports;
use prism_protocol::surface_cmd::{PrimarySurfaceCreate, SurfaceFormat, SURFACE_KIND_PRIMARY};

use crate::addr::DeviceAddress;
use crate::shmem::{Doorbell, SharedMemory};
use crate::slots::{MemorySlotTable, SlotError, SlotId};

pub type SurfaceId = u32;

pub const PRIMARY_SURFACE_ID: SurfaceId = 0;

/// Surfaces are allocated on 64-byte boundaries in VRAM.
const SURFACE_ALIGN: u64 = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceState {
    Creating,
    Active,
    Destroying,
}

#[derive(Clone, Copy, Debug)]
pub struct Surface {
    pub id: SurfaceId,
    pub format: SurfaceFormat,
    pub width: u32,
    pub height: u32,
    pub stride: i32,
    pub phys_address: DeviceAddress,
    pub state: SurfaceState,
    /// Offset of the backing block within its slot.
    base_offset: u64,
    size_bytes: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum SurfaceError {
    #[error("no free surface id in the pool")]
    SurfaceIdPoolExhausted,
    #[error("VRAM cannot fit a {need:#x}-byte surface")]
    VramExhausted { need: u64 },
    #[error("no VRAM slot is attached")]
    VramSlotMissing,
    #[error("surface {id} does not exist")]
    UnknownSurface { id: SurfaceId },
    #[error("surface {id} is {state:?}, not {expected:?}")]
    WrongState {
        id: SurfaceId,
        state: SurfaceState,
        expected: SurfaceState,
    },
    #[error("the primary surface is already active")]
    PrimaryAlreadyActive,
    #[error("primary area cannot fit {need:#x} bytes (have {have:#x})")]
    PrimaryAreaTooSmall { need: u64, have: u64 },
    #[error(transparent)]
    Slot(#[from] SlotError),
}

/// First-fit allocator over the VRAM slot's byte range. Frees coalesce with
/// both neighbours so a destroy/create cycle does not fragment forever.
#[derive(Debug)]
struct VramAllocator {
    /// Free extents as `(offset, len)`, sorted by offset, non-adjacent.
    free: Vec<(u64, u64)>,
}

impl VramAllocator {
    fn new(len: u64) -> Self {
        Self {
            free: if len == 0 { Vec::new() } else { vec![(0, len)] },
        }
    }

    fn alloc(&mut self, size: u64, align: u64) -> Option<u64> {
        for i in 0..self.free.len() {
            let (off, len) = self.free[i];
            let aligned = off.checked_add(align - 1)? & !(align - 1);
            let pad = aligned - off;
            if pad.checked_add(size)? > len {
                continue;
            }
            self.free.remove(i);
            if pad > 0 {
                self.free.insert(i, (off, pad));
            }
            let tail = len - pad - size;
            if tail > 0 {
                let at = self.free.partition_point(|&(o, _)| o < aligned + size);
                self.free.insert(at, (aligned + size, tail));
            }
            return Some(aligned);
        }
        None
    }

    fn free(&mut self, offset: u64, size: u64) {
        let at = self.free.partition_point(|&(o, _)| o < offset);
        self.free.insert(at, (offset, size));
        // Coalesce with the next extent, then the previous one.
        if at + 1 < self.free.len() && self.free[at].0 + self.free[at].1 == self.free[at + 1].0 {
            self.free[at].1 += self.free[at + 1].1;
            self.free.remove(at + 1);
        }
        if at > 0 && self.free[at - 1].0 + self.free[at - 1].1 == self.free[at].0 {
            self.free[at - 1].1 += self.free[at].1;
            self.free.remove(at);
        }
    }
}

#[derive(Debug)]
pub struct SurfaceRegistry {
    n_surfaces: u32,
    primary_create_offset: u64,
    primary_area_offset: u64,
    primary_area_size: u64,
    main_slot_id: SlotId,
    surfaces: Vec<Option<Surface>>,
    vram_slot: Option<SlotId>,
    vram: VramAllocator,
}

impl SurfaceRegistry {
    pub fn new(
        n_surfaces: u32,
        primary_create_offset: u64,
        primary_area_offset: u64,
        primary_area_size: u64,
        main_slot_id: SlotId,
    ) -> Self {
        Self {
            n_surfaces,
            primary_create_offset,
            primary_area_offset,
            primary_area_size,
            main_slot_id,
            surfaces: vec![None; n_surfaces as usize],
            vram_slot: None,
            vram: VramAllocator::new(0),
        }
    }

    /// Attach the VRAM slot that backs off-screen surfaces. Until this is
    /// called only the primary surface can exist.
    pub fn set_vram_slot(&mut self, slot_id: SlotId, byte_len: u64) {
        self.vram_slot = Some(slot_id);
        self.vram = VramAllocator::new(byte_len);
    }

    pub fn vram_slot(&self) -> Option<SlotId> {
        self.vram_slot
    }

    /// Detach the VRAM slot (surface support goes away with it). Callers
    /// destroy all off-screen surfaces first.
    pub fn clear_vram_slot(&mut self) {
        self.vram_slot = None;
        self.vram = VramAllocator::new(0);
    }

    pub fn surface(&self, id: SurfaceId) -> Result<&Surface, SurfaceError> {
        self.surfaces
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or(SurfaceError::UnknownSurface { id })
    }

    /// Create the singleton primary surface in the primary area of the main
    /// slot. Synchronous: the doorbell is rung before returning and the
    /// surface lands directly in `Active` (no allocation id is involved).
    pub fn create_primary(
        &mut self,
        mem: &mut dyn SharedMemory,
        bell: &mut dyn Doorbell,
        slots: &MemorySlotTable,
        format: SurfaceFormat,
        width: u32,
        height: u32,
    ) -> Result<(), SurfaceError> {
        if self.surfaces[PRIMARY_SURFACE_ID as usize].is_some() {
            return Err(SurfaceError::PrimaryAlreadyActive);
        }
        let stride = u64::from(width) * u64::from(format.bytes_per_pixel());
        let need = stride * u64::from(height);
        if need > self.primary_area_size {
            return Err(SurfaceError::PrimaryAreaTooSmall {
                need,
                have: self.primary_area_size,
            });
        }

        // Bottom-up framebuffer: negative stride, `mem` points at the top
        // scanline (the last one in memory).
        let top_scanline = self.primary_area_offset + stride * u64::from(height.saturating_sub(1));
        let phys_address = slots.encode(self.main_slot_id, top_scanline)?;

        let block = PrimarySurfaceCreate {
            format: format as u32,
            width,
            height,
            stride: -(stride as i32),
            mem: phys_address.0,
            flags: 0,
            kind: SURFACE_KIND_PRIMARY,
        };
        self.surfaces[PRIMARY_SURFACE_ID as usize] = Some(Surface {
            id: PRIMARY_SURFACE_ID,
            format,
            width,
            height,
            stride: -(stride as i32),
            phys_address,
            state: SurfaceState::Creating,
            base_offset: self.primary_area_offset,
            size_bytes: need,
        });
        mem.write_at(self.primary_create_offset, &block.encode_to_le_bytes());
        bell.ring(ports::CREATE_PRIMARY, 0);
        if let Some(primary) = &mut self.surfaces[PRIMARY_SURFACE_ID as usize] {
            primary.state = SurfaceState::Active;
        }
        debug!(width, height, "primary surface created");
        Ok(())
    }

    /// Tear down the primary. The caller must retract the pointer overlay
    /// first (it implicitly references the primary); no id-reuse barrier is
    /// needed for a singleton.
    pub fn destroy_primary(&mut self, bell: &mut dyn Doorbell) -> Result<(), SurfaceError> {
        if self.surfaces[PRIMARY_SURFACE_ID as usize].take().is_none() {
            return Err(SurfaceError::UnknownSurface {
                id: PRIMARY_SURFACE_ID,
            });
        }
        bell.ring(ports::DESTROY_PRIMARY, 0);
        debug!("primary surface destroyed");
        Ok(())
    }

    /// Allocate an off-screen surface: an id from the pool plus VRAM backing.
    pub fn allocate_surface(
        &mut self,
        slots: &MemorySlotTable,
        format: SurfaceFormat,
        width: u32,
        height: u32,
    ) -> Result<SurfaceId, SurfaceError> {
        let vram_slot = self.vram_slot.ok_or(SurfaceError::VramSlotMissing)?;
        let id = (1..self.n_surfaces as usize)
            .find(|&i| self.surfaces[i].is_none())
            .ok_or(SurfaceError::SurfaceIdPoolExhausted)? as SurfaceId;

        // Scanlines padded to 4 bytes.
        let stride = (u64::from(width) * u64::from(format.bytes_per_pixel()) + 3) & !3;
        let size_bytes = stride * u64::from(height);
        let base_offset = self
            .vram
            .alloc(size_bytes, SURFACE_ALIGN)
            .ok_or(SurfaceError::VramExhausted { need: size_bytes })?;
        let phys_address = match slots.encode(vram_slot, base_offset) {
            Ok(addr) => addr,
            Err(err) => {
                self.vram.free(base_offset, size_bytes);
                return Err(err.into());
            }
        };

        self.surfaces[id as usize] = Some(Surface {
            id,
            format,
            width,
            height,
            stride: stride as i32,
            phys_address,
            state: SurfaceState::Active,
            base_offset,
            size_bytes,
        });
        debug!(id, width, height, "off-screen surface allocated");
        Ok(id)
    }

    /// Phase one of the destroy barrier: mark the surface `Destroying` and
    /// notify the device. The id stays out of the pool until
    /// [`complete_destroy`](Self::complete_destroy).
    pub fn begin_destroy(
        &mut self,
        bell: &mut dyn Doorbell,
        id: SurfaceId,
    ) -> Result<(), SurfaceError> {
        if id == PRIMARY_SURFACE_ID {
            return Err(SurfaceError::UnknownSurface { id });
        }
        let surface = self
            .surfaces
            .get_mut(id as usize)
            .and_then(Option::as_mut)
            .ok_or(SurfaceError::UnknownSurface { id })?;
        if surface.state != SurfaceState::Active {
            return Err(SurfaceError::WrongState {
                id,
                state: surface.state,
                expected: SurfaceState::Active,
            });
        }
        surface.state = SurfaceState::Destroying;
        bell.ring(ports::DESTROY_SURFACE_WAIT, id as u8);
        Ok(())
    }

    /// Phase two: free the id and the VRAM backing. Only legal once the
    /// destroy-completion signal has been observed.
    pub fn complete_destroy(&mut self, id: SurfaceId) -> Result<(), SurfaceError> {
        let taken = self
            .surfaces
            .get_mut(id as usize)
            .ok_or(SurfaceError::UnknownSurface { id })?
            .take();
        match taken {
            None => Err(SurfaceError::UnknownSurface { id }),
            Some(surface) if surface.state != SurfaceState::Destroying => {
                self.surfaces[id as usize] = Some(surface);
                Err(SurfaceError::WrongState {
                    id,
                    state: surface.state,
                    expected: SurfaceState::Destroying,
                })
            }
            Some(surface) => {
                self.vram.free(surface.base_offset, surface.size_bytes);
                debug!(id, "surface id returned to the pool");
                Ok(())
            }
        }
    }

    /// Destroy every surface, primary included, with one doorbell. The
    /// caller hides the pointer overlay first, as for `destroy_primary`.
    pub fn destroy_all(&mut self, bell: &mut dyn Doorbell) {
        bell.ring(ports::DESTROY_ALL_SURFACES, 0);
        self.clear_local();
    }

    /// Drop all local surface state without doorbells; the device already
    /// forgot everything (reset path).
    pub fn on_device_reset(&mut self) {
        self.clear_local();
    }

    fn clear_local(&mut self) {
        for slot in &mut self.surfaces {
            if let Some(surface) = slot.take() {
                if surface.id != PRIMARY_SURFACE_ID {
                    self.vram.free(surface.base_offset, surface.size_bytes);
                }
            }
        }
    }
}
