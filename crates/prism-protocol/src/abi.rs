//! ABI version packing and validation.
//!
//! The ABI version travels as a single `u32`: major in the high 16 bits,
//! minor in the low 16. Minor bumps are additive; a consumer accepts any
//! minor under a major it knows, and rejects an unknown major outright.

use thiserror::Error;

pub const PRISM_ABI_MAJOR: u32 = 1;
pub const PRISM_ABI_MINOR: u32 = 2;

pub const PRISM_ABI_VERSION_U32: u32 = (PRISM_ABI_MAJOR << 16) | PRISM_ABI_MINOR;

pub const fn abi_version_u32(major: u32, minor: u32) -> u32 {
    (major << 16) | (minor & 0xFFFF)
}

pub const fn abi_major(version: u32) -> u32 {
    version >> 16
}

pub const fn abi_minor(version: u32) -> u32 {
    version & 0xFFFF
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum AbiError {
    #[error("ABI version is zero")]
    ZeroVersion,
    #[error("unsupported ABI major {found} (supported: {supported})")]
    UnsupportedMajor { found: u32, supported: u32 },
}

/// Validate a packed ABI version, returning `(major, minor)`.
pub fn parse_and_validate_abi_version_u32(version: u32) -> Result<(u32, u32), AbiError> {
    if version == 0 {
        return Err(AbiError::ZeroVersion);
    }
    let major = abi_major(version);
    if major != PRISM_ABI_MAJOR {
        return Err(AbiError::UnsupportedMajor {
            found: major,
            supported: PRISM_ABI_MAJOR,
        });
    }
    Ok((major, abi_minor(version)))
}
