use super::path::{ChildNumber, DerivationPath};
use super::public::PublicKey;
use super::{map_bip32_error, try_children};
use crate::error::{Error, Result};
use crate::types::Network;
use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::secp256k1::{self, Message, Secp256k1, SecretKey, ecdsa};
use std::fmt;
use std::str::FromStr;

const COMPACT_SERIALIZATION_LEN: usize = 64;

/// An extended private key that knows its absolute derivation path.
#[derive(Clone)]
pub struct PrivateKey {
    xpriv: Xpriv,
    path: DerivationPath,
    network: Network,
}

impl PrivateKey {
    /// Root key (`m`) for a BIP39 seed.
    pub fn from_seed(seed: &[u8], network: Network) -> Result<Self> {
        let xpriv = Xpriv::new_master(network.to_bitcoin_network(), seed)
            .map_err(|e| Error::KeyDerivation(format!("Failed to derive master key: {}", e)))?;

        Ok(Self {
            xpriv,
            path: DerivationPath::master(),
            network,
        })
    }

    /// Root key for a mnemonic, without passphrase.
    pub fn from_mnemonic(mnemonic: &bip39::Mnemonic, network: Network) -> Result<Self> {
        Self::from_seed(&mnemonic.to_seed(""), network)
    }

    /// Wrap an existing extended key that lives at `path`.
    pub fn from_xpriv(xpriv: Xpriv, path: DerivationPath, network: Network) -> Result<Self> {
        if !network.is_compatible_with(xpriv.network) {
            return Err(Error::KeyDerivation(format!(
                "extended key does not belong to {}",
                network
            )));
        }
        Ok(Self {
            xpriv,
            path,
            network,
        })
    }

    /// Parse a base58 `xprv`/`tprv` string stored for `path`.
    pub fn from_base58(encoded: &str, path: &str, network: Network) -> Result<Self> {
        let xpriv = Xpriv::from_str(encoded)
            .map_err(|e| Error::Parse(format!("Invalid extended private key: {}", e)))?;
        Self::from_xpriv(xpriv, DerivationPath::from_str(path)?, network)
    }

    /// Rebuild a root key from `secret || chain_code`.
    pub fn from_compact_bytes(bytes: &[u8], network: Network) -> Result<Self> {
        if bytes.len() != COMPACT_SERIALIZATION_LEN {
            return Err(Error::Parse(format!(
                "compact private key must be {} bytes, got {}",
                COMPACT_SERIALIZATION_LEN,
                bytes.len()
            )));
        }

        let private_key = SecretKey::from_slice(&bytes[..32])
            .map_err(|e| Error::Parse(format!("Invalid secret key: {}", e)))?;
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&bytes[32..]);

        let xpriv = Xpriv {
            network: network.to_bitcoin_network().into(),
            depth: 0,
            parent_fingerprint: Default::default(),
            child_number: bitcoin::bip32::ChildNumber::Normal { index: 0 },
            private_key,
            chain_code: chain_code.into(),
        };

        Ok(Self {
            xpriv,
            path: DerivationPath::master(),
            network,
        })
    }

    pub fn path(&self) -> &DerivationPath {
        &self.path
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn xpriv(&self) -> &Xpriv {
        &self.xpriv
    }

    pub fn secret_key(&self) -> SecretKey {
        self.xpriv.private_key
    }

    /// The public half, at the same path.
    pub fn public_key(&self) -> PublicKey {
        let secp = Secp256k1::new();
        PublicKey::from_parts(
            Xpub::from_priv(&secp, &self.xpriv),
            self.path.clone(),
            self.network,
        )
    }

    /// Index of the last path segment.
    pub fn last_level_index(&self) -> u32 {
        self.path.last_index()
    }

    /// The same key material with its path reset to `m`.
    pub fn as_root(&self) -> Self {
        Self {
            xpriv: self.xpriv,
            path: DerivationPath::master(),
            network: self.network,
        }
    }

    /// Derive the key at absolute path `target`.
    ///
    /// `target` must start with this key's own path. Asking for the key's own path returns
    /// a copy carrying `target`'s labels.
    pub fn derive_to(&self, target: &DerivationPath) -> Result<Self> {
        let relative = target.indexes_from(&self.path).ok_or_else(|| {
            Error::InvalidDerivationBranch(format!("{} is not below {}", target, self.path))
        })?;

        if relative.is_empty() {
            return Ok(Self {
                xpriv: self.xpriv,
                path: target.clone(),
                network: self.network,
            });
        }

        let secp = Secp256k1::new();
        let steps: Vec<_> = relative.iter().map(ChildNumber::to_bip32).collect();
        let xpriv = self
            .xpriv
            .derive_priv(&secp, &steps)
            .map_err(|e| map_bip32_error(e, target))?;

        Ok(Self {
            xpriv,
            path: target.clone(),
            network: self.network,
        })
    }

    /// Parse `target` and derive it.
    pub fn derive_path(&self, target: &str) -> Result<Self> {
        self.derive_to(&DerivationPath::from_str(target)?)
    }

    /// Derive a textual path relative to this key, e.g. `external:1/4`.
    pub fn derive_relative(&self, relative: &str) -> Result<Self> {
        self.derive_to(&self.path.join(relative)?)
    }

    pub fn derive_child(&self, child: ChildNumber) -> Result<Self> {
        self.derive_to(&self.path.child(child))
    }

    /// Derive the first valid non-hardened child at or after `start`.
    pub fn derive_next_valid_child(&self, start: u32) -> Result<(Self, u32)> {
        try_children(start, |index| self.derive_child(ChildNumber::normal(index)?))
    }

    /// Derive the first valid hardened child at or after `start`.
    pub fn derive_next_valid_hardened_child(&self, start: u32) -> Result<(Self, u32)> {
        try_children(start, |index| self.derive_child(ChildNumber::hardened(index)?))
    }

    /// Sign a 32-byte digest with low-R ECDSA.
    pub fn sign_ecdsa(&self, digest: [u8; 32]) -> ecdsa::Signature {
        let secp = Secp256k1::signing_only();
        secp.sign_ecdsa(&Message::from_digest(digest), &self.xpriv.private_key)
    }

    /// Sign a 32-byte digest with a recoverable ECDSA signature.
    pub fn sign_recoverable(&self, digest: [u8; 32]) -> ecdsa::RecoverableSignature {
        let secp = Secp256k1::signing_only();
        secp.sign_ecdsa_recoverable(&Message::from_digest(digest), &self.xpriv.private_key)
    }

    pub fn keypair(&self) -> secp256k1::Keypair {
        let secp = Secp256k1::new();
        secp256k1::Keypair::from_secret_key(&secp, &self.xpriv.private_key)
    }

    /// Base58 `xprv`/`tprv` serialization.
    pub fn to_base58(&self) -> String {
        self.xpriv.to_string()
    }

    /// `secret || chain_code`, 64 bytes.
    pub fn to_compact_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(COMPACT_SERIALIZATION_LEN);
        out.extend_from_slice(&self.xpriv.private_key.secret_bytes());
        out.extend_from_slice(self.xpriv.chain_code.as_bytes());
        out
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.xpriv == other.xpriv && self.path == other.path && self.network == other.network
    }
}

impl Eq for PrivateKey {}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("path", &self.path.to_string())
            .field("network", &self.network)
            .field("fingerprint", &self.xpriv.fingerprint(&Secp256k1::new()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::HARDENED_OFFSET;

    const MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn root() -> PrivateKey {
        let mnemonic = bip39::Mnemonic::from_str(MNEMONIC).unwrap();
        PrivateKey::from_mnemonic(&mnemonic, Network::Bitcoin).unwrap()
    }

    #[test]
    fn test_root_matches_known_fingerprint() {
        let secp = Secp256k1::new();
        assert_eq!(root().xpriv().fingerprint(&secp).to_string(), "73c5da0a");
        assert!(root().path().is_empty());
    }

    #[test]
    fn test_derive_to_keeps_requested_path() {
        let key = root().derive_path("m/schema:1'/recovery:1'").unwrap();
        assert_eq!(key.path().to_string(), "m/schema:1'/recovery:1'");

        let leaf = key.derive_path("m/1'/1'/external:1/3").unwrap();
        assert_eq!(leaf.path().to_string(), "m/1'/1'/external:1/3");
        assert_eq!(leaf.last_level_index(), 3);

        // Same path from the root gives identical material.
        let again = root().derive_path("m/1'/1'/1/3").unwrap();
        assert_eq!(again.xpriv(), leaf.xpriv());
        assert_eq!(again, leaf);
    }

    #[test]
    fn test_derive_is_idempotent() {
        let key = root();
        let a = key.derive_path("m/1'/2/3").unwrap();
        let b = key.derive_path("m/1'/2/3").unwrap();
        assert_eq!(a.to_compact_bytes(), b.to_compact_bytes());
    }

    #[test]
    fn test_derive_outside_branch_fails() {
        let key = root().derive_path("m/1'/1'").unwrap();
        let err = key.derive_path("m/1'/2'/0").unwrap_err();
        assert!(matches!(err, Error::InvalidDerivationBranch(_)));

        let err = key.derive_path("m/1'").unwrap_err();
        assert!(matches!(err, Error::InvalidDerivationBranch(_)));
    }

    #[test]
    fn test_derive_own_path_returns_same_key() {
        let key = root().derive_path("m/1'/1'").unwrap();
        let same = key.derive_path("m/schema:1'/recovery:1'").unwrap();
        assert_eq!(same.xpriv(), key.xpriv());
        assert_eq!(same.path().to_string(), "m/schema:1'/recovery:1'");
    }

    #[test]
    fn test_relative_and_next_valid_children() {
        let key = root().derive_path("m/1'").unwrap();
        let relative = key.derive_relative("contacts:2/5").unwrap();
        assert_eq!(relative.path().canonical(), "m/1'/2/5");

        let (child, index) = key.derive_next_valid_child(10).unwrap();
        assert_eq!(index, 10);
        assert_eq!(child.path().canonical(), "m/1'/10");

        let (hardened, index) = key.derive_next_valid_hardened_child(HARDENED_OFFSET - 1).unwrap();
        assert_eq!(index, HARDENED_OFFSET - 1);
        assert!(hardened.path().has_hardened());
    }

    #[test]
    fn test_public_key_matches_private_derivation() {
        let base = root().derive_path("m/1'/1'").unwrap();
        let via_private = base.derive_path("m/1'/1'/0/4").unwrap().public_key();
        let via_public = base.public_key().derive_path("m/1'/1'/0/4").unwrap();
        assert_eq!(via_private, via_public);
    }

    #[test]
    fn test_serialization_round_trips() {
        let key = root().derive_path("m/1'/1'").unwrap();

        let base58 = key.to_base58();
        let parsed = PrivateKey::from_base58(&base58, "m/1'/1'", Network::Bitcoin).unwrap();
        assert_eq!(parsed, key);

        let compact = PrivateKey::from_compact_bytes(&key.to_compact_bytes(), Network::Bitcoin)
            .unwrap();
        assert_eq!(compact.secret_key(), key.secret_key());
        assert!(compact.path().is_empty());
        assert_eq!(key.as_root().path().to_string(), "m");

        assert!(PrivateKey::from_base58(&base58, "m/1'/1'", Network::Regtest).is_err());
    }
}
