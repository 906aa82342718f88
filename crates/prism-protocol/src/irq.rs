//! Interrupt pending/mask bits.
//!
//! The device raises its line when `int_pending & int_mask` is non-zero. The
//! guest's ISR masks everything, a deferred dispatch swaps `int_pending` to
//! zero, signals the matching events, then re-arms the mask. Both words live
//! in the shared region at offsets published by the attach descriptor.

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PendingBits: u32 {
        /// Command-ring progress: space freed, or display work finished.
        const DISPLAY = 1 << 0;
        /// Cursor-ring progress.
        const CURSOR = 1 << 1;
        /// A synchronous io completed (surface destroy barrier).
        const IO_CMD = 1 << 2;
    }
}
