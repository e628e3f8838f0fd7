// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Merging bootloader and application hex files into one flashable
//! image, with the attestation block patched in.
//!
//! The whole run is fail-fast: any parse, bounds, or patch error aborts
//! before any output exists, so a half-patched image can never escape.

use crate::attest::{self, AttestationPair};
use crate::image::HexImage;
use crate::sign::DEFAULT_APPLICATION_END_PAGE;
use crate::{flash_end, page_addr, Error, Result, FLASH_BASE, FLASH_PAGES};

/// Marker the bootloader expects at the end of the application region.
const APPLICATION_END_MARKER: [u8; 2] = [0x41, 0x41];

/// Fill byte for padding up to the attestation block.
const ERASED: u8 = 0xFF;

#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// Attestation material to patch in; `None` substitutes the
    /// built-in hacker pair (logged).
    pub attestation: Option<AttestationPair>,
    /// Write the lock sentinel, preventing further unsigned changes.
    pub lock: bool,
    pub application_end_page: u32,
}

impl Default for MergeOptions {
    fn default() -> Self {
        MergeOptions {
            attestation: None,
            lock: false,
            application_end_page: DEFAULT_APPLICATION_END_PAGE,
        }
    }
}

/// Parses and merges `inputs` in order (later inputs replace data of
/// earlier ones where they overlap), patches the attestation block,
/// and returns the serialized result.
pub fn merge_and_patch(
    inputs: &[impl AsRef<[u8]>],
    options: &MergeOptions,
) -> Result<Vec<u8>> {
    if inputs.is_empty() {
        return Err(Error::IncompatibleImages(
            "no input images given".to_string(),
        ));
    }
    if options.application_end_page >= FLASH_PAGES {
        return Err(Error::IncompatibleImages(format!(
            "application end page {} exceeds the {FLASH_PAGES}-page device",
            options.application_end_page
        )));
    }

    let mut images = Vec::with_capacity(inputs.len());
    for (index, raw) in inputs.iter().enumerate() {
        let image = HexImage::parse(raw.as_ref())?;
        if let (Some(start), Some(end)) = (image.start(), image.end_exclusive())
        {
            if start < FLASH_BASE || end > flash_end() {
                return Err(Error::IncompatibleImages(format!(
                    "input {index} spans {start:#010x}..{end:#010x}, \
                     outside device flash {FLASH_BASE:#010x}..{:#010x}",
                    flash_end()
                )));
            }
        }
        images.push(image);
    }

    let mut merged = HexImage::merge(images);
    if merged.is_empty() {
        return Err(Error::IncompatibleImages(
            "inputs contain no data".to_string(),
        ));
    }
    log::info!(
        "merged {} inputs into {} bytes across {} segments",
        inputs.len(),
        merged.len(),
        merged.segments().len()
    );

    let boundary =
        page_addr(FLASH_PAGES - options.application_end_page);
    merged.write_region(boundary - 2, &APPLICATION_END_MARKER)?;

    let attestation = match &options.attestation {
        Some(pair) => pair.clone(),
        None => {
            log::warn!(
                "no attestation material supplied; substituting the \
                 built-in hacker key and certificate"
            );
            AttestationPair::hacker()?
        }
    };

    merged.pad_to(attest::patched_extent(&attestation, options.lock), ERASED);
    attest::patch(&mut merged, &attestation, options.lock)?;
    Ok(merged.serialize())
}
