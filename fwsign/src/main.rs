// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use fwtools::{
    build_message, merge_and_patch, AttestationPair, HexImage, KeyPair,
    MergeOptions, DEFAULT_APPLICATION_END_PAGE,
};

#[derive(Parser, Debug)]
#[clap(name = "fwsign", max_term_width = 80)]
pub struct Args {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Parser, Debug)]
pub enum Command {
    /// Generates a P-256 key pair for signed firmware updates.
    ///
    /// The public key must be compiled into the device bootloader; the
    /// private key signs updates. Supplying a seed file makes the pair
    /// reproducible, which is only appropriate for test fixtures.
    Genkey {
        /// Seed the generator from this file for reproducible keys
        #[clap(long)]
        input_seed_file: Option<PathBuf>,

        /// Where to write the private key (SEC1 PEM)
        output_pem_file: PathBuf,
    },
    /// Signs a firmware hex file, producing a signed-update JSON
    /// descriptor.
    Sign {
        /// Last reserved page count; must match the bootloader build
        #[clap(long, default_value_t = DEFAULT_APPLICATION_END_PAGE)]
        end_page: u32,

        /// Private key PEM written by genkey
        key_pem_file: PathBuf,

        /// Application firmware (Intel HEX)
        app_hex_file: PathBuf,

        output_json_file: PathBuf,
    },
    /// Merges hex files and patches in the attestation key and
    /// certificate.
    ///
    /// Later hex files replace data of earlier ones, if they overlap.
    /// Without --attestation-key/--attestation-cert the well-known
    /// hacker pair is patched in, which any host software will flag as
    /// non-genuine.
    Mergehex {
        /// Attestation private key as a 64-digit hex string
        #[clap(long)]
        attestation_key: Option<String>,

        /// Attestation certificate file (DER)
        #[clap(long)]
        attestation_cert: Option<PathBuf>,

        /// Lock the device against unsigned changes permanently
        #[clap(long)]
        lock: bool,

        /// Last reserved page count; must match the bootloader build
        #[clap(long, default_value_t = DEFAULT_APPLICATION_END_PAGE)]
        end_page: u32,

        #[clap(short = 'o', long = "out")]
        output_hex_file: PathBuf,

        /// Input hex files, merged in the order given
        #[clap(required = true)]
        input_hex_files: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    match args.cmd {
        Command::Genkey {
            input_seed_file,
            output_pem_file,
        } => {
            let seed = match &input_seed_file {
                Some(path) => Some(std::fs::read(path).with_context(|| {
                    format!("reading seed file {}", path.display())
                })?),
                None => None,
            };
            let pair = KeyPair::generate(seed.as_deref())?;
            std::fs::write(&output_pem_file, pair.to_pem()?).with_context(
                || format!("writing {}", output_pem_file.display()),
            )?;
            log::info!("wrote private key to {}", output_pem_file.display());

            let export = pair.export_public();
            println!("Public key in various formats:");
            println!();
            println!("{:?}", export.raw);
            println!();
            println!("{}", export.hex);
            println!();
            println!("{}", export.escaped);
        }
        Command::Sign {
            end_page,
            key_pem_file,
            app_hex_file,
            output_json_file,
        } => {
            let pem = std::fs::read_to_string(&key_pem_file).with_context(
                || format!("reading key file {}", key_pem_file.display()),
            )?;
            let pair = KeyPair::from_pem(&pem)?;
            let raw = std::fs::read(&app_hex_file).with_context(|| {
                format!("reading hex file {}", app_hex_file.display())
            })?;
            let image = HexImage::parse(&raw)?;

            let message = build_message(&image, end_page)?;
            let descriptor = fwtools::sign::sign(&message, &pair)?;
            // Catch a bad key or a descriptor bug before anything is
            // written; the device will not be as forgiving.
            fwtools::sign::verify(&message, &descriptor, &pair)?;

            println!(
                "Saving signed firmware to {}",
                output_json_file.display()
            );
            std::fs::write(&output_json_file, descriptor.to_json()?)
                .with_context(|| {
                    format!("writing {}", output_json_file.display())
                })?;
        }
        Command::Mergehex {
            attestation_key,
            attestation_cert,
            lock,
            end_page,
            output_hex_file,
            input_hex_files,
        } => {
            let attestation = match (attestation_key, attestation_cert) {
                (Some(key_hex), Some(cert_path)) => {
                    let cert =
                        std::fs::read(&cert_path).with_context(|| {
                            format!(
                                "reading certificate {}",
                                cert_path.display()
                            )
                        })?;
                    Some(AttestationPair::from_hex_key(&key_hex, cert)?)
                }
                (None, None) => None,
                _ => bail!(
                    "--attestation-key and --attestation-cert must be \
                     supplied together"
                ),
            };

            let mut inputs = Vec::with_capacity(input_hex_files.len());
            for path in &input_hex_files {
                inputs.push(std::fs::read(path).with_context(|| {
                    format!("reading hex file {}", path.display())
                })?);
            }

            let options = MergeOptions {
                attestation,
                lock,
                application_end_page: end_page,
            };
            let merged = merge_and_patch(&inputs, &options)?;
            std::fs::write(&output_hex_file, merged).with_context(|| {
                format!("writing {}", output_hex_file.display())
            })?;
            println!("Saving merged hex to {}", output_hex_file.display());
        }
    }

    Ok(())
}
