use super::path::{ChildNumber, DerivationPath};
use super::{map_bip32_error, try_children};
use crate::error::{Error, Result};
use crate::types::Network;
use bitcoin::bip32::Xpub;
use bitcoin::secp256k1::{self, Secp256k1};
use std::fmt;
use std::str::FromStr;

/// An extended public key that knows its absolute derivation path.
///
/// Holds no secret material, so it can only derive non-hardened children.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    xpub: Xpub,
    path: DerivationPath,
    network: Network,
}

impl PublicKey {
    pub(crate) fn from_parts(xpub: Xpub, path: DerivationPath, network: Network) -> Self {
        Self {
            xpub,
            path,
            network,
        }
    }

    /// Wrap an existing extended public key that lives at `path`.
    pub fn from_xpub(xpub: Xpub, path: DerivationPath, network: Network) -> Result<Self> {
        if !network.is_compatible_with(xpub.network) {
            return Err(Error::KeyDerivation(format!(
                "extended key does not belong to {}",
                network
            )));
        }
        Ok(Self::from_parts(xpub, path, network))
    }

    /// Parse a base58 `xpub`/`tpub` string stored for `path`.
    pub fn from_base58(encoded: &str, path: &str, network: Network) -> Result<Self> {
        let xpub = Xpub::from_str(encoded)
            .map_err(|e| Error::Parse(format!("Invalid extended public key: {}", e)))?;
        Self::from_xpub(xpub, DerivationPath::from_str(path)?, network)
    }

    pub fn path(&self) -> &DerivationPath {
        &self.path
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn xpub(&self) -> &Xpub {
        &self.xpub
    }

    /// The raw curve point.
    pub fn point(&self) -> secp256k1::PublicKey {
        self.xpub.public_key
    }

    /// 33-byte compressed encoding.
    pub fn serialize(&self) -> [u8; 33] {
        self.xpub.public_key.serialize()
    }

    pub fn last_level_index(&self) -> u32 {
        self.path.last_index()
    }

    pub fn fingerprint(&self) -> bitcoin::bip32::Fingerprint {
        self.xpub.fingerprint()
    }

    /// Derive the key at absolute path `target`.
    ///
    /// Fails with [`Error::HardenedDerivation`] if any segment below this key is hardened.
    pub fn derive_to(&self, target: &DerivationPath) -> Result<Self> {
        let relative = target.indexes_from(&self.path).ok_or_else(|| {
            Error::InvalidDerivationBranch(format!("{} is not below {}", target, self.path))
        })?;

        if relative.iter().any(ChildNumber::is_hardened) {
            return Err(Error::HardenedDerivation(target.to_string()));
        }

        if relative.is_empty() {
            return Ok(Self::from_parts(self.xpub, target.clone(), self.network));
        }

        let secp = Secp256k1::verification_only();
        let steps: Vec<_> = relative.iter().map(ChildNumber::to_bip32).collect();
        let xpub = self
            .xpub
            .derive_pub(&secp, &steps)
            .map_err(|e| map_bip32_error(e, target))?;

        Ok(Self::from_parts(xpub, target.clone(), self.network))
    }

    pub fn derive_path(&self, target: &str) -> Result<Self> {
        self.derive_to(&DerivationPath::from_str(target)?)
    }

    pub fn derive_relative(&self, relative: &str) -> Result<Self> {
        self.derive_to(&self.path.join(relative)?)
    }

    pub fn derive_child(&self, child: ChildNumber) -> Result<Self> {
        self.derive_to(&self.path.child(child))
    }

    /// Derive the first valid child at or after `start`.
    pub fn derive_next_valid_child(&self, start: u32) -> Result<(Self, u32)> {
        try_children(start, |index| self.derive_child(ChildNumber::normal(index)?))
    }

    /// Base58 `xpub`/`tpub` serialization.
    pub fn to_base58(&self) -> String {
        self.xpub.to_string()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("path", &self.path.to_string())
            .field("network", &self.network)
            .field("key", &hex::encode(self.serialize()))
            .finish()
    }
}
