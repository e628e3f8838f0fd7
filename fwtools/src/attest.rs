// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Patching device attestation material into a merged image.
//!
//! The bootloader reserves a block in the upper flash pages for the
//! attestation private key and certificate, plus a lock word in the
//! very last flash word. These offsets are baked into the bootloader
//! build and must not drift.

use std::fmt;
use std::str::FromStr;

use p256::ecdsa::{DerSignature, SigningKey};
use p256::pkcs8::EncodePublicKey;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::der::asn1::{GeneralizedTime, UtcTime};
use x509_cert::der::{DateTime, Decode, Encode};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::{Time, Validity};
use x509_cert::Certificate;

use crate::image::HexImage;
use crate::{flash_end, page_addr, Error, Result, FLASH_PAGES};

/// Start of the attestation block: a 32-byte P-256 private scalar.
pub const ATTESTATION_KEY_ADDR: u32 = page_addr(FLASH_PAGES - 15);

pub const ATTESTATION_KEY_LEN: usize = 32;

/// Certificate block: `[len: u16 LE][reserved: u16 = 0][DER bytes]`.
pub const ATTESTATION_CERT_ADDR: u32 =
    ATTESTATION_KEY_ADDR + ATTESTATION_KEY_LEN as u32;

const ATTESTATION_CERT_HEADER: usize = 4;

/// The certificate must leave room for the rest of the block.
pub const MAX_CERT_LEN: usize = 4096 - 64;

/// Lock word: the last word of flash.
pub const LOCK_ADDR: u32 = flash_end() - 4;

pub const LOCK_SENTINEL: u32 = 0x4C4F_434B;

/// The well-known "hacker" attestation scalar shipped with devices that
/// anyone may re-flash. Deliberately public, deliberately insecure.
pub const HACKER_ATTESTATION_KEY: [u8; 32] = [
    0x1b, 0x26, 0x26, 0xec, 0xc8, 0xf6, 0x9b, 0x0f, 0x69, 0xe3, 0x4f, 0xb2,
    0x36, 0xd7, 0x64, 0x66, 0xba, 0x12, 0xac, 0x16, 0xc3, 0xab, 0x57, 0x50,
    0xba, 0x06, 0x4e, 0x8b, 0x90, 0xe0, 0x24, 0x48,
];

const HACKER_SUBJECT: &str = "CN=Hacker Attestation,O=fwtools";

/// Device-identity material destined for the attestation block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationPair {
    pub key: [u8; 32],
    pub certificate: Vec<u8>,
}

fn invalid<E: fmt::Display>(e: E) -> Error {
    Error::InvalidAttestation(e.to_string())
}

impl AttestationPair {
    /// Validates and wraps caller-supplied attestation material: the
    /// key must load as a P-256 signing key and the certificate must
    /// parse as DER X.509.
    pub fn new(key: [u8; 32], certificate: Vec<u8>) -> Result<AttestationPair> {
        if certificate.len() > MAX_CERT_LEN {
            return Err(Error::InvalidAttestation(format!(
                "certificate is {} bytes, the block holds {MAX_CERT_LEN}",
                certificate.len()
            )));
        }
        SigningKey::from_slice(&key).map_err(|e| {
            Error::InvalidAttestation(format!(
                "key is not a valid P-256 scalar: {e}"
            ))
        })?;
        Certificate::from_der(&certificate).map_err(|e| {
            Error::InvalidAttestation(format!(
                "certificate is not valid DER: {e}"
            ))
        })?;
        Ok(AttestationPair { key, certificate })
    }

    /// As [`AttestationPair::new`], with the key given as a hex string.
    pub fn from_hex_key(key_hex: &str, certificate: Vec<u8>) -> Result<AttestationPair> {
        let bytes = hex::decode(key_hex).map_err(|_| {
            Error::InvalidAttestation(
                "key is not a valid hex string".to_string(),
            )
        })?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| {
            Error::InvalidAttestation("key must be 32 bytes".to_string())
        })?;
        Self::new(key, certificate)
    }

    /// The default insecure pair: the well-known hacker scalar and a
    /// deterministic self-signed certificate for it. Callers
    /// substituting this default are expected to log the fact loudly.
    pub fn hacker() -> Result<AttestationPair> {
        let signing =
            SigningKey::from_slice(&HACKER_ATTESTATION_KEY).map_err(invalid)?;
        let certificate = self_signed_certificate(&signing, HACKER_SUBJECT)?;
        Self::new(HACKER_ATTESTATION_KEY, certificate)
    }
}

/// Builds a minimal self-signed certificate for `signing`. Fixed serial
/// and validity keep the output deterministic for a given key.
fn self_signed_certificate(signing: &SigningKey, subject: &str) -> Result<Vec<u8>> {
    let serial = SerialNumber::new(&[0x01]).map_err(invalid)?;
    let not_before = Time::UtcTime(
        UtcTime::from_date_time(
            DateTime::new(2019, 1, 1, 0, 0, 0).map_err(invalid)?,
        )
        .map_err(invalid)?,
    );
    let not_after = Time::GeneralTime(GeneralizedTime::from_date_time(
        DateTime::new(2099, 1, 1, 0, 0, 0).map_err(invalid)?,
    ));
    let validity = Validity {
        not_before,
        not_after,
    };
    let subject = Name::from_str(subject).map_err(invalid)?;
    let spki_der = signing
        .verifying_key()
        .to_public_key_der()
        .map_err(invalid)?;
    let spki =
        SubjectPublicKeyInfoOwned::try_from(spki_der.as_bytes()).map_err(invalid)?;
    let builder = CertificateBuilder::new(
        Profile::Root,
        serial,
        validity,
        subject,
        spki,
        signing,
    )
    .map_err(invalid)?;
    let certificate = builder.build::<DerSignature>().map_err(invalid)?;
    certificate.to_der().map_err(invalid)
}

/// Exclusive end address a caller must pad the image to before
/// [`patch`] will accept it.
pub fn patched_extent(attestation: &AttestationPair, lock: bool) -> u32 {
    if lock {
        flash_end()
    } else {
        ATTESTATION_CERT_ADDR
            + (ATTESTATION_CERT_HEADER + attestation.certificate.len()) as u32
    }
}

/// Writes the attestation block (and, if `lock`, the lock sentinel)
/// into `image`.
///
/// The image must already cover every targeted offset; no byte outside
/// the targeted offsets is touched.
pub fn patch(
    image: &mut HexImage,
    attestation: &AttestationPair,
    lock: bool,
) -> Result<()> {
    let required = patched_extent(attestation, lock);
    let end = image.end_exclusive().unwrap_or(0);
    if end < required {
        return Err(Error::OutOfRange {
            addr: ATTESTATION_KEY_ADDR,
            len: (required - ATTESTATION_KEY_ADDR) as usize,
            end,
        });
    }

    image.write_region(ATTESTATION_KEY_ADDR, &attestation.key)?;

    let mut header = [0u8; ATTESTATION_CERT_HEADER];
    header[..2]
        .copy_from_slice(&(attestation.certificate.len() as u16).to_le_bytes());
    image.write_region(ATTESTATION_CERT_ADDR, &header)?;
    image.write_region(
        ATTESTATION_CERT_ADDR + ATTESTATION_CERT_HEADER as u32,
        &attestation.certificate,
    )?;

    if lock {
        image.write_region(LOCK_ADDR, &LOCK_SENTINEL.to_le_bytes())?;
    }
    Ok(())
}
