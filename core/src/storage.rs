//! Async storage abstraction for the engine's local state.
//!
//! The engine never owns a database. Hosts implement these traits over whatever they
//! persist to:
//! - `WalletStorage`: the mnemonic and Muun's cosigning key
//! - `OperationStorage`: the operation history
//! - `SizeVectorStorage`: the single next-transaction-size slot
//! - `InvoiceSecretsStorage`: secrets behind incoming-swap invoices
//!
//! Implementations only need single-row upsert semantics. Ordering between writers is
//! handled by the engine.

use crate::error::Result;
use crate::invoice::InvoiceSecrets;
use crate::operation::{Operation, OperationStatus};
use crate::size_vector::NextTransactionSize;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Type alias for storage futures.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// An extended public key together with the absolute path it sits at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredPublicKey {
    pub base58: String,
    pub path: String,
}

/// Secure key storage.
pub trait WalletStorage: Send + Sync {
    /// Get the mnemonic phrase from storage.
    ///
    /// Returns `Ok(None)` if no mnemonic has been stored.
    fn get_mnemonic(&self) -> StorageFuture<'_, Option<String>>;

    /// Store the mnemonic phrase.
    ///
    /// Overwrites any existing mnemonic.
    fn set_mnemonic(&self, mnemonic: &str) -> StorageFuture<'_, ()>;

    /// Muun's base cosigning key, if the backend has handed it out yet.
    fn get_muun_key(&self) -> StorageFuture<'_, Option<StoredPublicKey>>;

    fn set_muun_key(&self, key: &StoredPublicKey) -> StorageFuture<'_, ()>;
}

/// Local operation history, keyed by backend id.
pub trait OperationStorage: Send + Sync {
    fn fetch_by_hid(&self, hid: u64) -> StorageFuture<'_, Option<Operation>>;

    /// Insert or replace the operation with the same hid.
    ///
    /// Fails if the operation has no hid.
    fn store(&self, operation: &Operation) -> StorageFuture<'_, ()>;

    /// Fails with `OperationNotFound` for an unknown hid.
    fn update_status(
        &self,
        hid: u64,
        confirmations: u32,
        hash: Option<&str>,
        status: OperationStatus,
    ) -> StorageFuture<'_, ()>;

    fn list(&self) -> StorageFuture<'_, Vec<Operation>>;
}

/// The single slot holding the latest [`NextTransactionSize`].
///
/// Write through [`crate::size_vector::SizeVectorCell`], never directly.
pub trait SizeVectorStorage: Send + Sync {
    fn get_size_vector(&self) -> StorageFuture<'_, Option<NextTransactionSize>>;

    fn set_size_vector(&self, nts: &NextTransactionSize) -> StorageFuture<'_, ()>;
}

/// Incoming-swap invoice secrets.
pub trait InvoiceSecretsStorage: Send + Sync {
    /// Number of secrets registered but not yet encoded into an invoice.
    fn count_unused(&self) -> StorageFuture<'_, usize>;

    /// Persist freshly registered secrets.
    fn store(&self, secrets: &[InvoiceSecrets]) -> StorageFuture<'_, ()>;

    fn find_by_payment_hash(&self, payment_hash: &[u8; 32])
    -> StorageFuture<'_, Option<InvoiceSecrets>>;

    /// The oldest unused secrets, if any.
    fn find_first_unused(&self) -> StorageFuture<'_, Option<InvoiceSecrets>>;

    /// Replace the secrets with the same payment hash.
    fn save(&self, secrets: &InvoiceSecrets) -> StorageFuture<'_, ()>;
}
