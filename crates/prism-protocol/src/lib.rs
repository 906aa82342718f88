//! Wire ABI for the Prism para-virtual display device.
//!
//! This crate defines the byte-level contract shared between the guest driver
//! (`prism-guest`) and the device model: ring header and entry layouts, the
//! doorbell port block, interrupt bits, the primary-surface create block, and
//! the versioned attach descriptor.
//!
//! Everything here is plain data: `#[repr(C)]` layout structs with explicit
//! little-endian encode/decode and no I/O.

#![forbid(unsafe_code)]

pub mod abi;
pub mod info;
pub mod irq;
pub mod ports;
pub mod ring;
pub mod surface_cmd;

pub use abi::{
    abi_major, abi_minor, abi_version_u32, parse_and_validate_abi_version_u32, AbiError,
    PRISM_ABI_MAJOR, PRISM_ABI_MINOR, PRISM_ABI_VERSION_U32,
};
pub use info::{DeviceInfoDesc, DeviceInfoError, MainSlotInfo, PRISM_DEVICE_INFO_VERSION};
pub use irq::PendingBits;
pub use ring::{
    CommandDesc, CommandKind, CursorDesc, CursorKind, RingDecodeError, RingHeader,
    PRISM_RING_MAGIC, RELEASE_ENTRY_SIZE_BYTES,
};
pub use surface_cmd::{PrimarySurfaceCreate, SurfaceFormat, SURFACE_KIND_PRIMARY};
