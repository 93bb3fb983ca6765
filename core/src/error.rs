//! Error types for the wallet engine.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the wallet engine.
#[derive(Error, Debug)]
pub enum Error {
    /// No mnemonic found in storage.
    #[error("No mnemonic found in storage. Generate or import one first.")]
    NoMnemonic,

    /// Invalid mnemonic phrase.
    #[error("Invalid mnemonic phrase: {0}")]
    InvalidMnemonic(String),

    /// Muun's cosigning key has not been stored yet.
    #[error("No cosigning key found in storage: {0}")]
    NoCosigningKey(String),

    /// A child key could not be derived at the requested index.
    ///
    /// Retried at the next index by `derive_next_valid_child`.
    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    /// A hardened segment was requested from a public key.
    #[error("Key derivation error: hardened derivation requires the private key ({0})")]
    HardenedDerivation(String),

    /// The requested path does not descend from the key's own path.
    #[error("Invalid derivation branch: {0}")]
    InvalidDerivationBranch(String),

    /// The textual path could not be parsed.
    #[error("Invalid derivation path: {0}")]
    InvalidDerivationPath(String),

    /// A swap quote disagrees with the invoice it claims to pay.
    #[error("Invalid swap: {0}")]
    InvalidSwap(String),

    /// The invoice carries no amount.
    #[error("Invalid invoice amount: {0}")]
    InvalidInvoiceAmount(String),

    /// The invoice expired before it could be paid.
    #[error("Invoice expired: {0}")]
    InvoiceExpired(String),

    /// The invoice could not be decoded or is malformed.
    #[error("Invalid invoice: {0}")]
    InvalidInvoice(String),

    /// A transaction skeleton does not match the signing expectations.
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    /// An incoming swap failed verification and will not be fulfilled.
    #[error("Incoming swap error: {0}")]
    IncomingSwap(String),

    /// Signing failed.
    #[error("Signing error: {0}")]
    Signing(String),

    /// Metadata encryption or decryption failed.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Operation not found in storage.
    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Parse error.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Bitcoin-related error.
    #[error("Bitcoin error: {0}")]
    Bitcoin(String),

    /// Network/HTTP error.
    #[error("Network error: {0}")]
    Network(String),

    /// The push step did not answer in time.
    ///
    /// The operation is stored as `FAILED`, but the broadcast may still confirm.
    #[error("Push was slow, it may still confirm: {0}")]
    SlowPush(String),

    /// Generic error with context.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether `derive_next_valid_child` may move on to the next index.
    pub fn is_retryable_derivation(&self) -> bool {
        matches!(self, Error::KeyDerivation(_))
    }

    /// Whether the error is the "slow push" outcome rather than a definitive failure.
    pub fn is_slow_push(&self) -> bool {
        matches!(self, Error::SlowPush(_))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(format!("{:#}", err))
    }
}
