// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! NIST P-256 signing key pairs for firmware updates.
//!
//! The public key gets compiled into the device bootloader; the private
//! key signs update messages on the host. Key generation is either
//! backed by the OS RNG or, for reproducible fixtures, by a ChaCha20
//! stream seeded from caller-supplied bytes.

use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::LineEnding;
use p256::SecretKey;
use rand::rngs::OsRng;
use rand_chacha::ChaCha20Rng;
use rand_core::SeedableRng;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// A P-256 key pair. The private scalar never leaves this type except
/// through [`KeyPair::to_pem`].
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
}

/// Three renderings of the same 64 public-key bytes (x then y), for
/// humans and for pasting into bootloader source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyExport {
    pub raw: [u8; 64],
    pub hex: String,
    pub escaped: String,
}

impl KeyPair {
    /// Generates a key pair.
    ///
    /// With `seed`, the generator is deterministically keyed from
    /// SHA-256 of the seed bytes, so the same seed always yields the
    /// same pair. Without one, the OS secure source is used.
    pub fn generate(seed: Option<&[u8]>) -> Result<KeyPair> {
        let secret = match seed {
            Some(seed) => {
                if seed.is_empty() {
                    return Err(Error::InvalidSeed(
                        "seed must not be empty".to_string(),
                    ));
                }
                let digest: [u8; 32] = Sha256::digest(seed).into();
                let mut rng = ChaCha20Rng::from_seed(digest);
                SecretKey::random(&mut rng)
            }
            None => SecretKey::random(&mut OsRng),
        };
        Ok(KeyPair { secret })
    }

    /// Loads a key pair from a SEC1 PEM private key.
    pub fn from_pem(pem: &str) -> Result<KeyPair> {
        let secret = SecretKey::from_sec1_pem(pem).map_err(|e| {
            Error::SigningError(format!("cannot load signing key: {e}"))
        })?;
        Ok(KeyPair { secret })
    }

    /// Serializes the private key as SEC1 PEM.
    pub fn to_pem(&self) -> Result<String> {
        self.secret
            .to_sec1_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|e| {
                Error::SigningError(format!("cannot encode signing key: {e}"))
            })
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from(&self.secret)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey::from(&self.signing_key())
    }

    /// The uncompressed public point without its 0x04 tag: x then y.
    pub fn public_point_bytes(&self) -> [u8; 64] {
        let point = self.secret.public_key().to_encoded_point(false);
        let mut out = [0u8; 64];
        out[..32]
            .copy_from_slice(point.x().expect("uncompressed point").as_slice());
        out[32..]
            .copy_from_slice(point.y().expect("uncompressed point").as_slice());
        out
    }

    pub fn export_public(&self) -> PublicKeyExport {
        let raw = self.public_point_bytes();
        let hex = hex::encode(raw);
        let escaped: String =
            raw.iter().map(|b| format!("\\x{b:02x}")).collect();
        PublicKeyExport {
            raw,
            hex,
            escaped: format!("\"{escaped}\""),
        }
    }

    /// RFC 6979 deterministic ECDSA over a precomputed SHA-256 digest.
    pub fn sign_prehash(&self, digest: &[u8]) -> Result<Signature> {
        self.signing_key()
            .sign_prehash(digest)
            .map_err(|e| Error::SigningError(e.to_string()))
    }

    pub fn verify_prehash(&self, digest: &[u8], signature: &Signature) -> Result<()> {
        self.verifying_key()
            .verify_prehash(digest, signature)
            .map_err(|e| Error::SigningError(e.to_string()))
    }
}
