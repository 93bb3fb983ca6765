//! API types for the wallet backend.
//!
//! These types match the backend API schema and are used for request/response serialization.

use crate::address::{AddressVersion, MuunAddress, create_address};
use crate::error::Result;
use crate::exchange::ExchangeRateWindow;
use crate::fees::{FeeBumpFunction, FeeWindow};
use crate::invoice::GeneratedSecrets;
use crate::keys::{PublicKey, PublicKeyPair};
use crate::operation::Operation;
use crate::signer::Input;
use crate::size_vector::NextTransactionSize;
use crate::storage::StoredPublicKey;
use crate::types::{Network, hex_bytes32};
use serde::{Deserialize, Serialize};

/// Market and chain data a payment is priced against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealTimeData {
    pub fee_window: FeeWindow,
    pub exchange_rate_window: ExchangeRateWindow,
    /// Indexed by number of unconfirmed outputs spent, minus one.
    #[serde(default)]
    pub fee_bump_functions: Vec<FeeBumpFunction>,
    #[serde(default)]
    pub min_mempool_fee_rate: f64,
    pub current_block_height: u32,
}

/// Another wallet user we can pay to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub hid: u64,
    pub public_key: StoredPublicKey,
    pub cosigning_public_key: StoredPublicKey,
    /// Last index the contact has seen derived below their keys.
    #[serde(default)]
    pub last_derivation_index: u32,
    pub max_address_version: AddressVersion,
}

impl Contact {
    pub fn public_key(&self, network: Network) -> Result<PublicKey> {
        PublicKey::from_base58(&self.public_key.base58, &self.public_key.path, network)
    }

    pub fn cosigning_public_key(&self, network: Network) -> Result<PublicKey> {
        PublicKey::from_base58(
            &self.cosigning_public_key.base58,
            &self.cosigning_public_key.path,
            network,
        )
    }

    /// A fresh address of the contact's, after the last index they know about.
    ///
    /// Taproot is not used for contacts: V4 is the highest version produced.
    pub fn next_address(&self, network: Network) -> Result<MuunAddress> {
        let pair = PublicKeyPair::new(
            self.public_key(network)?,
            self.cosigning_public_key(network)?,
        )?;
        let (pair, _) = pair.derive_next_valid_child(self.last_derivation_index + 1)?;
        let version = if self.max_address_version.code() > AddressVersion::V4.code() {
            AddressVersion::V4
        } else {
            self.max_address_version
        };
        create_address(version, &pair)
    }
}

/// Transaction skeleton built by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartiallySignedTransactionJson {
    pub hex_transaction: String,
    pub inputs: Vec<Input>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOperationRequest {
    pub operation: Operation,
    /// One public nonce per input of the primary transaction.
    pub user_public_nonces: Vec<String>,
    /// One nonce set per alternative transaction the backend may build.
    #[serde(default)]
    pub alternative_public_nonces: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationCreated {
    pub operation: Operation,
    pub partially_signed_transaction: PartiallySignedTransactionJson,
    pub next_transaction_size: NextTransactionSize,
    #[serde(default)]
    pub change_address: Option<MuunAddress>,
    #[serde(default)]
    pub alternative_transactions: Vec<PartiallySignedTransactionJson>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushTransactionsRequest {
    /// `None` for operations the backend settles without a transaction, like lend swaps.
    #[serde(default)]
    pub hex_transaction: Option<String>,
    #[serde(default)]
    pub alternative_transactions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPushed {
    #[serde(default)]
    pub hex_transaction: Option<String>,
    pub next_transaction_size: NextTransactionSize,
    pub updated_operation: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillmentPushRequest {
    pub fulfillment_tx_hex: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreimageRequest {
    #[serde(with = "hex_bytes32")]
    pub preimage: [u8; 32],
}

/// Public half of one set of invoice secrets, registered before the invoice is handed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceRegistration {
    #[serde(with = "hex_bytes32")]
    pub payment_hash: [u8; 32],
    pub short_channel_id: u64,
    pub user_htlc_key: StoredPublicKey,
    pub muun_htlc_key: StoredPublicKey,
    pub identity_key: StoredPublicKey,
}

impl From<&GeneratedSecrets> for InvoiceRegistration {
    fn from(generated: &GeneratedSecrets) -> Self {
        let stored = |key: &PublicKey| StoredPublicKey {
            base58: key.to_base58(),
            path: key.path().to_string(),
        };
        Self {
            payment_hash: generated.secrets.payment_hash,
            short_channel_id: generated.secrets.short_channel_id,
            user_htlc_key: stored(&generated.user_htlc_key),
            muun_htlc_key: stored(&generated.muun_htlc_key),
            identity_key: stored(&generated.identity_key),
        }
    }
}

/// API error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    #[serde(default)]
    pub error_code: Option<i64>,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{PrivateKey, Schema};

    fn stored(key: &PublicKey) -> StoredPublicKey {
        StoredPublicKey {
            base58: key.to_base58(),
            path: key.path().to_string(),
        }
    }

    fn contact(max_address_version: AddressVersion) -> Contact {
        let base = |seed: u8| {
            PrivateKey::from_seed(&[seed; 32], Network::Regtest)
                .unwrap()
                .derive_to(&Schema::contacts_path())
                .unwrap()
                .public_key()
        };
        Contact {
            hid: 9,
            public_key: stored(&base(5)),
            cosigning_public_key: stored(&base(6)),
            last_derivation_index: 3,
            max_address_version,
        }
    }

    #[test]
    fn test_contact_address_is_past_last_index() {
        let address = contact(AddressVersion::V5).next_address(Network::Regtest).unwrap();
        assert_eq!(address.version, AddressVersion::V4);
        assert!(address.derivation_path.last_index() >= 4);
        assert!(address.address.starts_with("bcrt1q"));

        let legacy = contact(AddressVersion::V3).next_address(Network::Regtest).unwrap();
        assert_eq!(legacy.version, AddressVersion::V3);
    }

    #[test]
    fn test_operation_created_parses_backend_json() {
        let json = serde_json::json!({
            "hexTransaction": "00",
            "inputs": [],
        });
        let pst: PartiallySignedTransactionJson = serde_json::from_value(json).unwrap();
        assert_eq!(pst.hex_transaction, "00");

        let error: ApiError =
            serde_json::from_str(r#"{"errorCode": 2005, "message": "bad"}"#).unwrap();
        assert_eq!(error.error_code, Some(2005));
    }
}
