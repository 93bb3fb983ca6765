//! Muun-style wallet engine - Core Library
//!
//! Self-custodial wallet logic shared by every platform: the key tree, payment preparation,
//! transaction signing with a cosigner, submarine swaps and the size vector used for fee
//! estimation.
//!
//! Storage and the backend are abstracted through traits, so hosts bring their own secure
//! store, database and transport.
//!
//! # Example
//!
//! ```rust,ignore
//! use muun_wallet_core::{Client, EngineConfig, HoustonClient, Network};
//!
//! let config = EngineConfig::new(Network::Bitcoin, "https://houston.example.com");
//! let service = HoustonClient::from_config(&config);
//! let client = Client::new(config, keys, operations, size_vector, service);
//! client.init(None).await?;
//!
//! let prepared = client.prepare_payment(&request).await?;
//! let operation = client.submit_payment(&prepared).await?;
//! ```

pub mod address;
pub mod analyzer;
pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod exchange;
pub mod fees;
pub mod invoice;
pub mod keys;
pub mod metadata;
pub mod operation;
pub mod preparer;
pub mod signer;
pub mod size_vector;
pub mod storage;
pub mod swap;
pub mod types;
pub mod wallet;

pub use address::{AddressVersion, MuunAddress, create_address};
pub use analyzer::{AnalysisStatus, PaymentAnalysis, PaymentAnalyzer};
pub use api::{HoustonClient, PaymentService};
pub use client::Client;
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use exchange::{BitcoinAmount, ExchangeRateWindow, MonetaryAmount};
pub use keys::{DerivationPath, PrivateKey, PublicKey, PublicKeyPair, Schema};
pub use operation::{NotificationSink, Operation, OperationStatus};
pub use preparer::{PaymentIntent, PaymentRequest, PreparedPayment};
pub use size_vector::{NextTransactionSize, Reconciliation, SizeVectorCell, WriteSite};
pub use storage::{
    InvoiceSecretsStorage, OperationStorage, SizeVectorStorage, StorageFuture, StoredPublicKey,
    WalletStorage,
};
pub use types::Network;
pub use wallet::Wallet;
