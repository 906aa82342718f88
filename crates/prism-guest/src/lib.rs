//! Guest-side core of the Prism para-virtual display protocol.
//!
//! The drawing glue above this crate turns drawing primitives into command
//! payloads; this crate turns those into device-visible work:
//!
//! - [`addr`]: pure codec packing `(slot id, generation, offset)` into
//!   device-visible 64-bit addresses.
//! - [`slots`]: lifecycle of registered guest-memory slots and their
//!   generations.
//! - [`ring`]: the single-producer/single-consumer ring channel used by the
//!   command, cursor and release rings.
//! - [`release`]: matches device completion ids back to driver resources so
//!   memory is never reused while the device may still read it.
//! - [`surface`]: primary and pooled off-screen surfaces, including the
//!   synchronous destroy barrier.
//! - [`notify`]: interrupt pending-bit dispatch onto waitable events.
//! - [`session`]: the owned per-device object tying it all together.
//!
//! The device side is reached only through the [`shmem::SharedMemory`] and
//! [`shmem::Doorbell`] seams; there is no real I/O in this crate.

#![forbid(unsafe_code)]

pub mod addr;
pub mod notify;
pub mod release;
pub mod ring;
pub mod session;
pub mod shmem;
pub mod slots;
pub mod surface;

pub use addr::{AddressError, AddressLayout, DecodedAddress, DeviceAddress};
pub use notify::{Event, NotificationBridge};
pub use release::{Reclaimable, ReleaseError, ResourceReleaseTracker};
pub use ring::{RingChannel, RingEntry, RingError};
pub use session::{AttachError, DeviceSession, SessionError, SubmitError};
pub use shmem::{Doorbell, RamRegion, RecordingDoorbell, SharedMemory, SharedRam};
pub use slots::{MemorySlot, MemorySlotTable, SlotError, SlotId};
pub use surface::{
    Surface, SurfaceError, SurfaceId, SurfaceRegistry, SurfaceState, PRIMARY_SURFACE_ID,
};
