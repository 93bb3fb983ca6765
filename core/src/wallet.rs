//! Key custody over injected storage.
//!
//! The wallet turns the stored mnemonic into the base keys everything else derives from,
//! and keeps Muun's cosigning key next to it.

use crate::error::{Error, Result};
use crate::keys::{PrivateKey, PublicKey, PublicKeyPair, Schema};
use crate::storage::{StoredPublicKey, WalletStorage};
use crate::types::Network;
use bip39::{Language, Mnemonic};
use std::str::FromStr;

const MNEMONIC_WORD_COUNT: usize = 12;

/// Main wallet struct with injected storage.
///
/// The wallet is generic over the storage implementation, so hosts can keep the mnemonic
/// in whatever secure store they have.
pub struct Wallet<S: WalletStorage> {
    storage: S,
    network: Network,
}

impl<S: WalletStorage> Wallet<S> {
    /// Create a new wallet with the given storage provider.
    pub fn new(storage: S, network: Network) -> Self {
        Self { storage, network }
    }

    /// Get the network this wallet is configured for.
    pub fn network(&self) -> Network {
        self.network
    }

    /// Get a reference to the storage provider.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Generate a new mnemonic or return existing one from storage.
    ///
    /// If a mnemonic already exists in storage, it is returned.
    /// Otherwise, a new 12-word mnemonic is generated and stored.
    pub async fn generate_or_get_mnemonic(&self) -> Result<String> {
        if let Some(mnemonic) = self.storage.get_mnemonic().await? {
            return Ok(mnemonic);
        }

        let mnemonic =
            Mnemonic::generate_in_with(
                &mut rand::rngs::OsRng,
                Language::English,
                MNEMONIC_WORD_COUNT,
            )
                .map_err(|e| Error::KeyDerivation(format!("Failed to generate mnemonic: {}", e)))?;
        let phrase = mnemonic.to_string();
        self.storage.set_mnemonic(&phrase).await?;

        log::info!("Generated a new wallet mnemonic");
        Ok(phrase)
    }

    /// Get the stored mnemonic (for backup display).
    ///
    /// Returns `None` if no mnemonic has been generated or imported.
    pub async fn get_mnemonic(&self) -> Result<Option<String>> {
        self.storage.get_mnemonic().await
    }

    /// Import a mnemonic phrase (replaces existing).
    ///
    /// The mnemonic is validated before being stored.
    pub async fn import_mnemonic(&self, phrase: &str) -> Result<()> {
        parse_mnemonic(phrase)?;
        self.storage.set_mnemonic(phrase).await
    }

    /// The user's key at the schema root.
    pub async fn base_private_key(&self) -> Result<PrivateKey> {
        let phrase = self
            .storage
            .get_mnemonic()
            .await?
            .ok_or(Error::NoMnemonic)?;

        let root = PrivateKey::from_mnemonic(&parse_mnemonic(&phrase)?, self.network)?;
        root.derive_to(&Schema::base_path())
    }

    /// Store Muun's cosigning key, which must sit at the schema root.
    pub async fn set_muun_key(&self, base58: &str, path: &str) -> Result<()> {
        let key = PublicKey::from_base58(base58, path, self.network)?;
        if key.path() != &Schema::base_path() {
            return Err(Error::InvalidDerivationBranch(format!(
                "cosigning key at {} instead of {}",
                key.path(),
                Schema::base_path()
            )));
        }

        self.storage
            .set_muun_key(&StoredPublicKey {
                base58: base58.to_string(),
                path: path.to_string(),
            })
            .await
    }

    pub async fn base_muun_key(&self) -> Result<PublicKey> {
        let stored = self
            .storage
            .get_muun_key()
            .await?
            .ok_or_else(|| Error::NoCosigningKey("not set".to_string()))?;

        PublicKey::from_base58(&stored.base58, &stored.path, self.network)
    }

    /// The user's and Muun's base keys, as the pair addresses derive from.
    pub async fn base_key_pair(&self) -> Result<PublicKeyPair> {
        let user = self.base_private_key().await?.public_key();
        PublicKeyPair::new(user, self.base_muun_key().await?)
    }
}

fn parse_mnemonic(phrase: &str) -> Result<Mnemonic> {
    Mnemonic::from_str(phrase).map_err(|e| Error::InvalidMnemonic(format!("{}", e)))
}
