//! Device session: attach-time validation and the serialized submit paths.
//!
//! One session object owns every piece of driver-side state for one device;
//! there is no ambient global context. Callers serialize access themselves
//! (one logical producer per ring), typically by holding their own lock
//! around a submit sequence; the device stays an independent concurrent
//! consumer reachable only through ring cursors and doorbells.
//!
//! Blocking: `submit_*` may wait once on a device notification under
//! backpressure, `destroy_surface` waits for the destroy-completion signal,
//! and `reclaim_device_memory` waits for the device to flush. All of these
//! waits are unbounded by design; see [`crate::notify::Event`].

use std::sync::{Arc, Weak};

use thiserror::Error;
use tracing::{debug, info, warn};

use prism_protocol::info::{DeviceInfoDesc, DeviceInfoError};
use prism_protocol::ports;
use prism_protocol::ring::{CommandDesc, CursorDesc, CursorKind};
use prism_protocol::surface_cmd::SurfaceFormat;

use crate::notify::{Event, NotificationBridge};
use crate::release::{Reclaimable, ReleaseError, ResourceReleaseTracker};
use crate::ring::{RingChannel, RingError};
use crate::shmem::{Doorbell, SharedMemory};
use crate::slots::{MemorySlotTable, SlotError, SlotId};
use crate::surface::{SurfaceError, SurfaceId, SurfaceRegistry};

#[derive(Debug, Error)]
pub enum AttachError {
    #[error(transparent)]
    Info(#[from] DeviceInfoError),
    #[error("slot table setup failed: {0}")]
    Slot(#[from] SlotError),
    #[error("{ring} ring rejected: {source}")]
    Ring {
        ring: &'static str,
        source: RingError,
    },
}

#[derive(Debug, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("ring still full after waiting for device progress")]
    RingFull,
    #[error(transparent)]
    Release(#[from] ReleaseError),
    #[error(transparent)]
    Ring(#[from] RingError),
}

#[derive(Debug, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error(transparent)]
    Release(#[from] ReleaseError),
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error(transparent)]
    Ring(#[from] RingError),
}

#[derive(Debug)]
pub struct DeviceSession<M: SharedMemory, D: Doorbell> {
    mem: M,
    bell: D,
    info: DeviceInfoDesc,
    slots: MemorySlotTable,
    cmd_ring: RingChannel<CommandDesc>,
    cursor_ring: RingChannel<CursorDesc>,
    release_ring: RingChannel<u64>,
    releases: ResourceReleaseTracker,
    surfaces: SurfaceRegistry,
    bridge: NotificationBridge,
    display_event: Arc<Event>,
    cursor_event: Arc<Event>,
    io_cmd_event: Arc<Event>,
}

impl<M: SharedMemory, D: Doorbell> DeviceSession<M, D> {
    /// Validate the descriptor and build the session. Fails without partial
    /// state: either everything attaches or nothing does.
    pub fn attach(info: DeviceInfoDesc, mut mem: M, bell: D) -> Result<Self, AttachError> {
        info.validate()?;

        let slots = MemorySlotTable::new(&info)?;
        let cmd_ring = RingChannel::attach(&mut mem, info.cmd_ring_offset)
            .map_err(|source| AttachError::Ring {
                ring: "command",
                source,
            })?;
        let cursor_ring = RingChannel::attach(&mut mem, info.cursor_ring_offset)
            .map_err(|source| AttachError::Ring {
                ring: "cursor",
                source,
            })?;
        let release_ring = RingChannel::attach(&mut mem, info.release_ring_offset)
            .map_err(|source| AttachError::Ring {
                ring: "release",
                source,
            })?;

        let surfaces = SurfaceRegistry::new(
            info.n_surfaces,
            info.primary_create_offset,
            info.primary_area_offset,
            info.primary_area_size,
            info.main_slot_id,
        );
        let bridge = NotificationBridge::new(&info);
        bridge.arm(&mut mem);

        let display_event = bridge.display_event();
        let cursor_event = bridge.cursor_event();
        let io_cmd_event = bridge.io_cmd_event();

        info!(
            version = info.version,
            num_slots = info.num_slots,
            n_surfaces = info.n_surfaces,
            "device session attached"
        );
        Ok(Self {
            mem,
            bell,
            info,
            slots,
            cmd_ring,
            cursor_ring,
            release_ring,
            releases: ResourceReleaseTracker::new(),
            surfaces,
            bridge,
            display_event,
            cursor_event,
            io_cmd_event,
        })
    }

    pub fn info(&self) -> &DeviceInfoDesc {
        &self.info
    }

    pub fn slots(&self) -> &MemorySlotTable {
        &self.slots
    }

    pub fn surfaces(&self) -> &SurfaceRegistry {
        &self.surfaces
    }

    pub fn pending_releases(&self) -> usize {
        self.releases.pending_len()
    }

    pub fn display_event(&self) -> Arc<Event> {
        Arc::clone(&self.display_event)
    }

    pub fn cursor_event(&self) -> Arc<Event> {
        Arc::clone(&self.cursor_event)
    }

    pub fn io_cmd_event(&self) -> Arc<Event> {
        Arc::clone(&self.io_cmd_event)
    }

    /// Register the VRAM aperture as a memory slot so off-screen surfaces
    /// can be addressed. Idempotent.
    pub fn attach_vram_slot(&mut self) -> Result<SlotId, SlotError> {
        if let Some(id) = self.surfaces.vram_slot() {
            return Ok(id);
        }
        let len = self.info.vram_phys_end - self.info.vram_phys_start;
        let id = self.slots.create_slot(
            &mut self.mem,
            &mut self.bell,
            (self.info.vram_phys_start, self.info.vram_phys_end),
            (self.info.vram_virt_start, self.info.vram_virt_start + len),
        )?;
        self.surfaces.set_vram_slot(id, len);
        Ok(id)
    }

    /// Remove the VRAM slot. Off-screen surfaces must be gone first.
    pub fn detach_vram_slot(&mut self) -> Result<(), SlotError> {
        if let Some(id) = self.surfaces.vram_slot() {
            self.slots.remove_slot(&mut self.bell, id)?;
            self.surfaces.clear_vram_slot();
        }
        Ok(())
    }

    /// Submit one command. When the command references releasable memory the
    /// caller passes its release id and a weak reference to the owner; the
    /// registration happens before anything becomes device-visible.
    ///
    /// Backpressure: a full ring waits once for the device-progress
    /// notification, then retries once. A second failure is surfaced, never
    /// silently retried, and the command is not partially published.
    pub fn submit_command(
        &mut self,
        desc: CommandDesc,
        release: Option<(u64, Weak<dyn Reclaimable>)>,
    ) -> Result<(), SubmitError> {
        let release_id = release.as_ref().map(|(id, _)| *id);
        if let Some((id, resource)) = release {
            self.releases.register_pending(id, resource)?;
        }

        let outcome = Self::push_with_one_wait(
            &mut self.cmd_ring,
            &mut self.mem,
            &self.display_event,
            &desc,
        );
        match outcome {
            Ok(true) => {}
            Ok(false) => {
                if let Some(id) = release_id {
                    self.releases.cancel_pending(id);
                }
                warn!("command ring full after device wakeup");
                return Err(SubmitError::RingFull);
            }
            Err(err) => {
                if let Some(id) = release_id {
                    self.releases.cancel_pending(id);
                }
                return Err(err.into());
            }
        }

        self.cmd_ring.publish(&mut self.mem);
        self.bell.ring(ports::NOTIFY_CMD, 0);
        Ok(())
    }

    /// Submit one cursor op. Same shape as [`submit_command`](Self::submit_command)
    /// but on the dedicated cursor ring, so pointer updates are never stuck
    /// behind bulk drawing backpressure.
    pub fn submit_cursor(&mut self, desc: CursorDesc) -> Result<(), SubmitError> {
        let pushed = Self::push_with_one_wait(
            &mut self.cursor_ring,
            &mut self.mem,
            &self.cursor_event,
            &desc,
        )?;
        if !pushed {
            warn!("cursor ring full after device wakeup");
            return Err(SubmitError::RingFull);
        }
        self.cursor_ring.publish(&mut self.mem);
        self.bell.ring(ports::NOTIFY_CURSOR, 0);
        Ok(())
    }

    /// Retract the pointer overlay.
    pub fn hide_cursor(&mut self) -> Result<(), SubmitError> {
        self.submit_cursor(CursorDesc {
            addr: 0,
            kind: CursorKind::Hide as u32,
            reserved0: 0,
        })
    }

    fn push_with_one_wait<T: crate::ring::RingEntry>(
        ring: &mut RingChannel<T>,
        mem: &mut M,
        progress: &Event,
        entry: &T,
    ) -> Result<bool, RingError> {
        if ring.try_push(mem, entry)? {
            return Ok(true);
        }
        debug!("ring full, waiting for device progress");
        progress.wait();
        ring.try_push(mem, entry)
    }

    /// Drain the release ring, reclaiming completed resources.
    pub fn drain_releases(&mut self) -> Result<usize, ReleaseError> {
        self.releases
            .drain_releases(&mut self.mem, &mut self.release_ring)
    }

    /// Tell the device we are starving for device memory, wait for it to
    /// flush, then collect whatever it released. One cycle; the caller
    /// decides whether the yield was enough.
    pub fn reclaim_device_memory(&mut self) -> Result<usize, ReleaseError> {
        self.bell.ring(ports::NOTIFY_OOM, 0);
        self.display_event.wait();
        self.drain_releases()
    }

    pub fn create_primary(
        &mut self,
        format: SurfaceFormat,
        width: u32,
        height: u32,
    ) -> Result<(), SurfaceError> {
        self.surfaces.create_primary(
            &mut self.mem,
            &mut self.bell,
            &self.slots,
            format,
            width,
            height,
        )
    }

    /// Destroy the primary surface. The pointer overlay implicitly
    /// references the primary, so it is hidden first.
    pub fn destroy_primary(&mut self) -> Result<(), SessionError> {
        self.hide_cursor()?;
        self.surfaces.destroy_primary(&mut self.bell)?;
        Ok(())
    }

    /// Allocate an off-screen surface. On device-memory exhaustion, runs one
    /// reclaim cycle and retries once; id-pool exhaustion is surfaced
    /// immediately.
    pub fn allocate_surface(
        &mut self,
        format: SurfaceFormat,
        width: u32,
        height: u32,
    ) -> Result<SurfaceId, SessionError> {
        match self
            .surfaces
            .allocate_surface(&self.slots, format, width, height)
        {
            Err(SurfaceError::VramExhausted { .. }) => {
                let freed = self.reclaim_device_memory()?;
                debug!(freed, "retrying surface allocation after reclaim");
                Ok(self
                    .surfaces
                    .allocate_surface(&self.slots, format, width, height)?)
            }
            other => Ok(other?),
        }
    }

    /// Two-phase destroy, blocking form: notify, wait for the
    /// destroy-completion signal, then free the id. Never returns before the
    /// signal has been observed.
    pub fn destroy_surface(&mut self, id: SurfaceId) -> Result<(), SurfaceError> {
        self.begin_destroy_surface(id)?;
        self.io_cmd_event.wait();
        self.complete_destroy_surface(id)
    }

    /// Phase one of the destroy barrier, for callers integrating with their
    /// own scheduler instead of blocking here.
    pub fn begin_destroy_surface(&mut self, id: SurfaceId) -> Result<(), SurfaceError> {
        self.surfaces.begin_destroy(&mut self.bell, id)
    }

    /// Phase two; only legal after the destroy-completion signal.
    pub fn complete_destroy_surface(&mut self, id: SurfaceId) -> Result<(), SurfaceError> {
        self.surfaces.complete_destroy(id)
    }

    /// Destroy every surface with a single doorbell (teardown path).
    pub fn destroy_all_surfaces(&mut self) -> Result<(), SessionError> {
        self.hide_cursor()?;
        self.surfaces.destroy_all(&mut self.bell);
        Ok(())
    }

    /// Interrupt entry point: claim the interrupt and dispatch pending
    /// reasons to their events. Returns true if the interrupt was ours.
    ///
    /// Real integrations split the two halves across interrupt and deferred
    /// context; see [`NotificationBridge`].
    pub fn service_interrupt(&mut self) -> bool {
        if !self.bridge.isr_check(&mut self.mem, &mut self.bell) {
            return false;
        }
        self.bridge.dispatch(&mut self.mem, &mut self.bell);
        true
    }

    /// Full device reset: every outstanding command and surface is dropped,
    /// the generation counter advances, and the main slot is re-registered.
    /// Addresses encoded before the reset become stale.
    pub fn reset(&mut self) -> Result<(), SessionError> {
        self.bell.ring(ports::RESET, 0);
        self.bridge.arm(&mut self.mem);

        self.releases.clear();
        self.surfaces.on_device_reset();
        self.surfaces.clear_vram_slot();
        self.slots.on_device_reset(&mut self.mem, &mut self.bell)?;

        // The device re-initialized the ring headers; re-attach our cursor
        // mirrors to them.
        self.cmd_ring = RingChannel::attach(&mut self.mem, self.info.cmd_ring_offset)?;
        self.cursor_ring = RingChannel::attach(&mut self.mem, self.info.cursor_ring_offset)?;
        self.release_ring = RingChannel::attach(&mut self.mem, self.info.release_ring_offset)?;

        info!("device reset complete");
        Ok(())
    }

    /// Orderly teardown: retract the cursor, drop every surface, release the
    /// VRAM slot. The session is unusable for surfaces afterwards but the
    /// rings stay attached (mode switches re-enable via `attach_vram_slot` /
    /// `create_primary`).
    pub fn detach_surfaces(&mut self) -> Result<(), SessionError> {
        self.destroy_all_surfaces()?;
        self.detach_vram_slot()?;
        Ok(())
    }
}
