// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Building and signing the firmware update message.
//!
//! The message layout is the contract with the device-side verifier:
//! both sides must reconstruct the exact same bytes from the same image
//! and metadata, or every signature is invalid. Layout (version 1):
//!
//! ```text
//! [format: u8 = 1][start: u32 LE][application_end_page: u32 LE][payload]
//! ```
//!
//! where `payload` is the image's bytes from its first covered address
//! up to the application boundary page, gaps filled with erased-flash
//! 0xFF.

use p256::ecdsa::signature::SignatureEncoding;
use p256::ecdsa::Signature;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::keys::KeyPair;
use crate::{flash_end, image::HexImage, page_addr, Error, Result};
use crate::{FLASH_BASE, FLASH_PAGES};

/// First byte of every version-1 update message.
pub const MESSAGE_FORMAT_V1: u8 = 0x01;

/// Size of the metadata prefix preceding the payload.
const MESSAGE_HEADER_LEN: usize = 9;

/// Pages reserved past the application region unless the caller says
/// otherwise. Must stay in sync with the bootloader build.
pub const DEFAULT_APPLICATION_END_PAGE: u32 = 20;

/// Fill byte for flash addresses the image does not cover.
const ERASED: u8 = 0xFF;

/// The signed-update document consumed by the bootloader-side tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedUpdateDescriptor {
    pub format_version: u32,
    /// SHA-256 of the update message, hex encoded.
    pub firmware_digest: String,
    /// DER-encoded ECDSA signature over the digest, hex encoded.
    pub signature: String,
    pub application_end_page: u32,
}

impl SignedUpdateDescriptor {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Absolute address of the application boundary for `end_page`.
fn application_boundary(application_end_page: u32) -> Result<u32> {
    if application_end_page >= FLASH_PAGES {
        return Err(Error::IncompatibleImages(format!(
            "application end page {application_end_page} exceeds the \
             {FLASH_PAGES}-page device"
        )));
    }
    Ok(page_addr(FLASH_PAGES - application_end_page))
}

/// Serializes the signable subset of `image` plus its metadata.
///
/// Deterministic: identical image and end page always produce identical
/// bytes.
pub fn build_message(
    image: &HexImage,
    application_end_page: u32,
) -> Result<Vec<u8>> {
    let boundary = application_boundary(application_end_page)?;
    let start = image.start().ok_or_else(|| {
        Error::IncompatibleImages("image contains no data".to_string())
    })?;
    if start < FLASH_BASE {
        return Err(Error::IncompatibleImages(format!(
            "image begins at {start:#010x}, below flash base \
             {FLASH_BASE:#010x}"
        )));
    }
    let end = image.end_exclusive().unwrap_or(start);
    if end > boundary {
        return Err(Error::IncompatibleImages(format!(
            "image extends to {end:#010x}, past the application boundary \
             {boundary:#010x} (flash ends at {:#010x})",
            flash_end()
        )));
    }

    let payload =
        image.read_region_padded(start, (boundary - start) as usize, ERASED);
    let mut message = Vec::with_capacity(MESSAGE_HEADER_LEN + payload.len());
    message.push(MESSAGE_FORMAT_V1);
    message.extend_from_slice(&start.to_le_bytes());
    message.extend_from_slice(&application_end_page.to_le_bytes());
    message.extend_from_slice(&payload);
    Ok(message)
}

/// Signs an update message, returning the descriptor document.
///
/// The signature is RFC 6979 deterministic ECDSA over the SHA-256 of
/// the message, DER encoded.
pub fn sign(message: &[u8], keypair: &KeyPair) -> Result<SignedUpdateDescriptor> {
    let application_end_page = message_end_page(message)?;
    let digest: [u8; 32] = Sha256::digest(message).into();
    let signature = keypair.sign_prehash(&digest)?;
    Ok(SignedUpdateDescriptor {
        format_version: MESSAGE_FORMAT_V1 as u32,
        firmware_digest: hex::encode(digest),
        signature: hex::encode(signature.to_der().to_vec()),
        application_end_page,
    })
}

/// Host-side check of a descriptor against the message it claims to
/// cover; mirrors the device-side verification.
pub fn verify(
    message: &[u8],
    descriptor: &SignedUpdateDescriptor,
    keypair: &KeyPair,
) -> Result<()> {
    let digest: [u8; 32] = Sha256::digest(message).into();
    if hex::encode(digest) != descriptor.firmware_digest {
        return Err(Error::SigningError(
            "descriptor digest does not match message".to_string(),
        ));
    }
    let der = hex::decode(&descriptor.signature).map_err(|_| {
        Error::SigningError("descriptor signature is not valid hex".to_string())
    })?;
    let signature = Signature::from_der(&der)
        .map_err(|e| Error::SigningError(e.to_string()))?;
    keypair.verify_prehash(&digest, &signature)
}

/// Reads the end-page field back out of a version-1 message.
fn message_end_page(message: &[u8]) -> Result<u32> {
    if message.len() < MESSAGE_HEADER_LEN {
        return Err(Error::SigningError(
            "message shorter than its header".to_string(),
        ));
    }
    if message[0] != MESSAGE_FORMAT_V1 {
        return Err(Error::SigningError(format!(
            "unknown message format {:#04x}",
            message[0]
        )));
    }
    Ok(u32::from_le_bytes([
        message[5], message[6], message[7], message[8],
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_addr;

    const PAGE_LEN: usize = crate::PAGE_SIZE as usize;

    fn test_pair() -> KeyPair {
        KeyPair::generate(Some(b"signer tests")).unwrap()
    }

    fn app_image(len: usize, fill: u8) -> HexImage {
        let mut image = HexImage::default();
        image.write_region(FLASH_BASE, &vec![fill; len]).unwrap();
        image
    }

    #[test]
    fn message_layout_is_versioned() {
        let image = app_image(4, 0x42);
        let end_page = FLASH_PAGES - 1;
        let message = build_message(&image, end_page).unwrap();
        assert_eq!(message[0], MESSAGE_FORMAT_V1);
        assert_eq!(
            u32::from_le_bytes(message[1..5].try_into().unwrap()),
            FLASH_BASE
        );
        assert_eq!(
            u32::from_le_bytes(message[5..9].try_into().unwrap()),
            end_page
        );
        // Payload runs to the boundary page, gaps erased.
        assert_eq!(message.len(), 9 + PAGE_LEN);
        assert_eq!(&message[9..13], &[0x42; 4]);
        assert_eq!(message[13], 0xFF);
    }

    #[test]
    fn build_message_is_deterministic() {
        let image = app_image(1024, 0x00);
        let a = build_message(&image, DEFAULT_APPLICATION_END_PAGE).unwrap();
        let b = build_message(&image, DEFAULT_APPLICATION_END_PAGE).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_image_rejected() {
        let image = HexImage::default();
        assert!(matches!(
            build_message(&image, DEFAULT_APPLICATION_END_PAGE),
            Err(Error::IncompatibleImages(_))
        ));
    }

    #[test]
    fn image_below_flash_base_rejected() {
        let mut image = HexImage::default();
        image.write_region(0x1000, &[0x00]).unwrap();
        assert!(matches!(
            build_message(&image, DEFAULT_APPLICATION_END_PAGE),
            Err(Error::IncompatibleImages(_))
        ));
    }

    #[test]
    fn image_past_boundary_rejected() {
        let boundary = page_addr(FLASH_PAGES - DEFAULT_APPLICATION_END_PAGE);
        let mut image = HexImage::default();
        image.write_region(boundary - 1, &[0x00, 0x00]).unwrap();
        assert!(matches!(
            build_message(&image, DEFAULT_APPLICATION_END_PAGE),
            Err(Error::IncompatibleImages(_))
        ));
    }

    #[test]
    fn end_page_larger_than_device_rejected() {
        let image = app_image(16, 0x00);
        assert!(matches!(
            build_message(&image, FLASH_PAGES),
            Err(Error::IncompatibleImages(_))
        ));
    }

    #[test]
    fn signing_same_input_twice_is_identical() {
        // 1 KiB zero-filled application, same key, deterministic nonce.
        let image = app_image(1024, 0x00);
        let pair = test_pair();
        let message =
            build_message(&image, DEFAULT_APPLICATION_END_PAGE).unwrap();
        let a = sign(&message, &pair).unwrap();
        let b = sign(&message, &pair).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn one_byte_change_changes_signature() {
        let pair = test_pair();
        let base = app_image(1024, 0x00);
        let mut tweaked = base.clone();
        tweaked.write_region(FLASH_BASE + 100, &[0x01]).unwrap();

        let msg_a =
            build_message(&base, DEFAULT_APPLICATION_END_PAGE).unwrap();
        let msg_b =
            build_message(&tweaked, DEFAULT_APPLICATION_END_PAGE).unwrap();
        let a = sign(&msg_a, &pair).unwrap();
        let b = sign(&msg_b, &pair).unwrap();
        assert_ne!(a.signature, b.signature);
        assert_ne!(a.firmware_digest, b.firmware_digest);
    }

    #[test]
    fn descriptor_carries_end_page_from_message() {
        let image = app_image(16, 0x55);
        let message = build_message(&image, 33).unwrap();
        let descriptor = sign(&message, &test_pair()).unwrap();
        assert_eq!(descriptor.application_end_page, 33);
    }

    #[test]
    fn verify_accepts_good_and_rejects_tampered() {
        let image = app_image(64, 0xA5);
        let pair = test_pair();
        let message =
            build_message(&image, DEFAULT_APPLICATION_END_PAGE).unwrap();
        let descriptor = sign(&message, &pair).unwrap();
        verify(&message, &descriptor, &pair).unwrap();

        let mut tampered = message.clone();
        tampered[20] ^= 0xFF;
        assert!(verify(&tampered, &descriptor, &pair).is_err());

        // A DER ECDSA signature always opens with a 0x30 sequence tag.
        let mut bad = descriptor.clone();
        bad.signature = format!("00{}", &bad.signature[2..]);
        assert!(verify(&message, &bad, &pair).is_err());
    }

    #[test]
    fn descriptor_json_round_trips() {
        let image = app_image(16, 0x01);
        let message =
            build_message(&image, DEFAULT_APPLICATION_END_PAGE).unwrap();
        let descriptor = sign(&message, &test_pair()).unwrap();
        let json = descriptor.to_json().unwrap();
        assert!(json.contains("\"signature\""));
        assert!(json.contains("\"application_end_page\""));
        let loaded = SignedUpdateDescriptor::from_json(&json).unwrap();
        assert_eq!(loaded, descriptor);
    }

    #[test]
    fn malformed_message_rejected_by_sign() {
        let pair = test_pair();
        assert!(matches!(
            sign(&[MESSAGE_FORMAT_V1, 0, 0], &pair),
            Err(Error::SigningError(_))
        ));
        assert!(matches!(
            sign(&[0x7F; 16], &pair),
            Err(Error::SigningError(_))
        ));
    }
}
