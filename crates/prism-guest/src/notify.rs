//! Interrupt-to-event dispatch.
//!
//! The device posts reasons into the shared `int_pending` word and raises its
//! line while `int_pending & int_mask` is non-zero. The guest handles this in
//! two halves, as the original interrupt/DPC split:
//!
//! - [`NotificationBridge::isr_check`]: cheap check in interrupt context;
//!   claims the interrupt by masking everything so a burst raises one
//!   interrupt, not one per item.
//! - [`NotificationBridge::dispatch`]: deferred work; atomically takes the
//!   pending word, signals each corresponding event exactly once, then
//!   re-arms the mask.
//!
//! Waiting producers/consumers block on the [`Event`]s, never on shared
//! memory.

use std::sync::{Arc, Condvar, Mutex};

use prism_protocol::info::DeviceInfoDesc;
use prism_protocol::irq::PendingBits;
use prism_protocol::ports;

use crate::shmem::{Doorbell, SharedMemory};

/// Auto-reset event: `wait` blocks until a signal arrives and consumes it.
///
/// `wait` deliberately has no timeout: backpressure waits are bounded by
/// device responsiveness, not wall-clock time.
#[derive(Debug, Default)]
pub struct Event {
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.cv.notify_all();
    }

    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.cv.wait(signaled).unwrap();
        }
        *signaled = false;
    }

    /// Consume a pending signal without blocking.
    pub fn try_consume(&self) -> bool {
        let mut signaled = self.signaled.lock().unwrap();
        std::mem::take(&mut *signaled)
    }
}

#[derive(Debug)]
pub struct NotificationBridge {
    int_pending_offset: u64,
    int_mask_offset: u64,
    display: Arc<Event>,
    cursor: Arc<Event>,
    io_cmd: Arc<Event>,
}

impl NotificationBridge {
    pub fn new(info: &DeviceInfoDesc) -> Self {
        Self {
            int_pending_offset: info.int_pending_offset,
            int_mask_offset: info.int_mask_offset,
            display: Arc::new(Event::new()),
            cursor: Arc::new(Event::new()),
            io_cmd: Arc::new(Event::new()),
        }
    }

    /// Command-ring progress / display work event.
    pub fn display_event(&self) -> Arc<Event> {
        Arc::clone(&self.display)
    }

    /// Cursor-ring progress event.
    pub fn cursor_event(&self) -> Arc<Event> {
        Arc::clone(&self.cursor)
    }

    /// Synchronous-io completion event (surface destroy barrier).
    pub fn io_cmd_event(&self) -> Arc<Event> {
        Arc::clone(&self.io_cmd)
    }

    /// Arm the mask so the device can raise interrupts at all. Run once at
    /// attach and after every reset.
    pub fn arm(&self, mem: &mut dyn SharedMemory) {
        mem.write_u32(self.int_mask_offset, !0);
    }

    /// Interrupt-context half: returns false if the interrupt is not ours.
    /// Otherwise masks further interrupts until [`dispatch`](Self::dispatch)
    /// has drained the pending word, and tells the device the mask changed.
    pub fn isr_check(&self, mem: &mut dyn SharedMemory, bell: &mut dyn Doorbell) -> bool {
        let pending = mem.read_u32(self.int_pending_offset);
        let mask = mem.read_u32(self.int_mask_offset);
        if pending & mask == 0 {
            return false;
        }
        mem.write_u32(self.int_mask_offset, 0);
        bell.ring(ports::UPDATE_IRQ, 0);
        true
    }

    /// Deferred half: take the pending word, signal each reason's event
    /// exactly once, re-arm the mask.
    pub fn dispatch(&self, mem: &mut dyn SharedMemory, bell: &mut dyn Doorbell) -> PendingBits {
        let pending = PendingBits::from_bits_truncate(mem.read_u32(self.int_pending_offset));
        mem.write_u32(self.int_pending_offset, 0);

        if pending.contains(PendingBits::DISPLAY) {
            self.display.signal();
        }
        if pending.contains(PendingBits::CURSOR) {
            self.cursor.signal();
        }
        if pending.contains(PendingBits::IO_CMD) {
            self.io_cmd.signal();
        }

        mem.write_u32(self.int_mask_offset, !0);
        bell.ring(ports::UPDATE_IRQ, 0);
        pending
    }
}
