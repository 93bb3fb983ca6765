//! HD key tree shared between the user, Muun's cosigner and the swap server.
//!
//! Keys always remember the absolute path they were derived at, so a key rooted at one
//! branch can never be used to derive keys of another.

mod pair;
mod path;
mod private;
mod public;
mod schema;

pub use pair::{PublicKeyPair, PublicKeyTriple};
pub use path::{ChildNumber, DerivationPath, HARDENED_OFFSET};
pub use private::PrivateKey;
pub use public::PublicKey;
pub use schema::Schema;

use crate::error::{Error, Result};
use bitcoin::bip32;

/// Try `start, start + 1, ...` until `attempt` stops failing with a retryable
/// derivation error.
///
/// Returns the value together with the index that produced it. Any other error ends the
/// search immediately.
pub(crate) fn try_children<T>(
    start: u32,
    mut attempt: impl FnMut(u32) -> Result<T>,
) -> Result<(T, u32)> {
    let mut index = start;
    loop {
        if index >= HARDENED_OFFSET {
            return Err(Error::KeyDerivation(format!(
                "no valid child found starting at {}",
                start
            )));
        }

        match attempt(index) {
            Ok(value) => return Ok((value, index)),
            Err(err) if err.is_retryable_derivation() => {
                log::debug!("Child {} is invalid, trying next index: {}", index, err);
                index += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Map a bip32 failure into our derivation taxonomy.
pub(crate) fn map_bip32_error(err: bip32::Error, path: &DerivationPath) -> Error {
    match err {
        bip32::Error::CannotDeriveFromHardenedKey => Error::HardenedDerivation(path.to_string()),
        bip32::Error::InvalidChildNumber(index) => {
            Error::InvalidDerivationPath(format!("{}: invalid child number {}", path, index))
        }
        other => Error::KeyDerivation(format!("{}: {}", path, other)),
    }
}
