use super::path::{ChildNumber, DerivationPath};
use super::try_children;
use super::public::PublicKey;
use crate::error::{Error, Result};
use crate::types::Network;
use std::str::FromStr;

/// The user's and Muun's public keys at the same path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyPair {
    user: PublicKey,
    muun: PublicKey,
}

impl PublicKeyPair {
    /// Both keys must share path and network.
    pub fn new(user: PublicKey, muun: PublicKey) -> Result<Self> {
        ensure_aligned(&[&user, &muun])?;
        Ok(Self { user, muun })
    }

    pub fn user(&self) -> &PublicKey {
        &self.user
    }

    pub fn muun(&self) -> &PublicKey {
        &self.muun
    }

    pub fn path(&self) -> &DerivationPath {
        self.user.path()
    }

    pub fn network(&self) -> Network {
        self.user.network()
    }

    pub fn last_level_index(&self) -> u32 {
        self.user.last_level_index()
    }

    pub fn derive_to(&self, target: &DerivationPath) -> Result<Self> {
        Ok(Self {
            user: self.user.derive_to(target)?,
            muun: self.muun.derive_to(target)?,
        })
    }

    pub fn derive_path(&self, target: &str) -> Result<Self> {
        self.derive_to(&DerivationPath::from_str(target)?)
    }

    pub fn derive_child(&self, index: u32) -> Result<Self> {
        self.derive_to(&self.path().child(ChildNumber::normal(index)?))
    }

    /// Derive both keys at the first index valid for *both* of them.
    pub fn derive_next_valid_child(&self, start: u32) -> Result<(Self, u32)> {
        try_children(start, |index| self.derive_child(index))
    }
}

/// User, Muun and swap server public keys at the same path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyTriple {
    user: PublicKey,
    muun: PublicKey,
    swap_server: PublicKey,
}

impl PublicKeyTriple {
    pub fn new(user: PublicKey, muun: PublicKey, swap_server: PublicKey) -> Result<Self> {
        ensure_aligned(&[&user, &muun, &swap_server])?;
        Ok(Self {
            user,
            muun,
            swap_server,
        })
    }

    pub fn user(&self) -> &PublicKey {
        &self.user
    }

    pub fn muun(&self) -> &PublicKey {
        &self.muun
    }

    pub fn swap_server(&self) -> &PublicKey {
        &self.swap_server
    }

    /// The user/Muun half of the triple.
    pub fn pair(&self) -> PublicKeyPair {
        PublicKeyPair {
            user: self.user.clone(),
            muun: self.muun.clone(),
        }
    }

    pub fn path(&self) -> &DerivationPath {
        self.user.path()
    }

    pub fn network(&self) -> Network {
        self.user.network()
    }

    pub fn last_level_index(&self) -> u32 {
        self.user.last_level_index()
    }

    pub fn derive_to(&self, target: &DerivationPath) -> Result<Self> {
        Ok(Self {
            user: self.user.derive_to(target)?,
            muun: self.muun.derive_to(target)?,
            swap_server: self.swap_server.derive_to(target)?,
        })
    }

    pub fn derive_child(&self, index: u32) -> Result<Self> {
        self.derive_to(&self.path().child(ChildNumber::normal(index)?))
    }

    pub fn derive_next_valid_child(&self, start: u32) -> Result<(Self, u32)> {
        try_children(start, |index| self.derive_child(index))
    }
}

fn ensure_aligned(keys: &[&PublicKey]) -> Result<()> {
    let Some((first, rest)) = keys.split_first() else {
        return Ok(());
    };

    for key in rest {
        if key.path() != first.path() {
            return Err(Error::InvalidDerivationBranch(format!(
                "co-derived keys disagree on path: {} vs {}",
                first.path(),
                key.path()
            )));
        }
        if key.network() != first.network() {
            return Err(Error::KeyDerivation(format!(
                "co-derived keys disagree on network: {} vs {}",
                first.network(),
                key.network()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{PrivateKey, Schema};

    fn key(seed: u8, network: Network) -> PublicKey {
        PrivateKey::from_seed(&[seed; 32], network)
            .unwrap()
            .derive_to(&Schema::base_path())
            .unwrap()
            .public_key()
    }

    fn pair() -> PublicKeyPair {
        PublicKeyPair::new(key(1, Network::Regtest), key(2, Network::Regtest)).unwrap()
    }

    #[test]
    fn test_pair_requires_same_path_and_network() {
        let user = key(1, Network::Regtest);
        let moved = key(2, Network::Regtest).derive_child(ChildNumber::normal(0).unwrap()).unwrap();
        assert!(matches!(
            PublicKeyPair::new(user.clone(), moved),
            Err(Error::InvalidDerivationBranch(_))
        ));

        let mainnet = key(2, Network::Bitcoin);
        assert!(PublicKeyPair::new(user, mainnet).is_err());
    }

    #[test]
    fn test_pair_members_stay_in_sync() {
        let (derived, index) = pair()
            .derive_to(&Schema::external_path())
            .unwrap()
            .derive_next_valid_child(17)
            .unwrap();

        assert_eq!(index, 17);
        assert_eq!(derived.user().path(), derived.muun().path());
        assert_eq!(derived.last_level_index(), 17);
        assert_eq!(derived.user().last_level_index(), derived.muun().last_level_index());
        assert_eq!(derived.path().to_string(), "m/schema:1'/recovery:1'/external:1/17");
    }

    #[test]
    fn test_triple_members_stay_in_sync() {
        let triple = PublicKeyTriple::new(
            key(1, Network::Regtest),
            key(2, Network::Regtest),
            key(3, Network::Regtest),
        )
        .unwrap();

        let child = triple.derive_child(5).unwrap();
        assert_eq!(child.user().path(), child.swap_server().path());
        assert_eq!(child.muun().path(), child.swap_server().path());
        assert_eq!(child.pair().path(), child.path());
        assert_eq!(child.last_level_index(), 5);
    }

    #[test]
    fn test_pair_rejects_hardened_child() {
        let err = pair().derive_path("m/1'/1'/0'").unwrap_err();
        assert!(matches!(err, Error::HardenedDerivation(_)));
    }
}
