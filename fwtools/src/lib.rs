// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware image tooling for signed bootloader updates: Intel HEX
//! parsing and merging, update-message signing, and attestation
//! patching. File and device I/O belong to the callers; everything here
//! operates on in-memory byte buffers.

use thiserror::Error;

pub mod attest;
pub mod image;
pub mod keys;
pub mod merge;
pub mod sign;

pub use attest::{patch, patched_extent, AttestationPair};
pub use image::{HexImage, RecordType, StartAddress};
pub use keys::{KeyPair, PublicKeyExport};
pub use merge::{merge_and_patch, MergeOptions};
pub use sign::{
    build_message, SignedUpdateDescriptor, DEFAULT_APPLICATION_END_PAGE,
};

/// Base address of device flash.
pub const FLASH_BASE: u32 = 0x0800_0000;

/// Size of one flash page in bytes.
pub const PAGE_SIZE: u32 = 2048;

/// Number of flash pages on the target device.
pub const FLASH_PAGES: u32 = 128;

/// Absolute address of the start of flash page `page`.
pub const fn page_addr(page: u32) -> u32 {
    FLASH_BASE + page * PAGE_SIZE
}

/// One past the last valid flash address.
pub const fn flash_end() -> u32 {
    page_addr(FLASH_PAGES)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("seed cannot drive the deterministic generator: {0}")]
    InvalidSeed(String),

    #[error("malformed hex record at line {line}: {reason}")]
    MalformedRecord { line: usize, reason: String },

    #[error(
        "write of {len} bytes at {addr:#010x} exceeds image bounds \
         (end {end:#010x})"
    )]
    OutOfRange { addr: u32, len: usize, end: u32 },

    #[error("signing backend failure: {0}")]
    SigningError(String),

    #[error("incompatible input images: {0}")]
    IncompatibleImages(String),

    #[error("invalid attestation material: {0}")]
    InvalidAttestation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
