//! Lightning invoices: decoding, the secrets behind incoming-swap invoices, and encoding.

use crate::error::{Error, Result};
use crate::keys::{ChildNumber, DerivationPath, PrivateKey, PublicKey, Schema};
use crate::types::{Network, hex_bytes32};
use bitcoin::hashes::{Hash, sha256};
use bitcoin::secp256k1::{self, Secp256k1};
use lightning_invoice::{
    Bolt11Invoice, Bolt11InvoiceDescription, Currency, InvoiceBuilder, PaymentSecret, RouteHint,
    RouteHintHop, RoutingFees,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

/// Unused secrets kept registered with the backend.
pub const MAX_UNUSED_SECRETS: usize = 5;

/// Child of an invoice key path holding the node identity key.
pub const IDENTITY_KEY_CHILD: u32 = 0;
/// Child of an invoice key path holding the HTLC keys.
pub const HTLC_KEY_CHILD: u32 = 1;

const INVOICE_CLTV_EXPIRY_DELTA: u64 = 72;
const INVOICE_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// The fields of a BOLT11 invoice the wallet cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInvoice {
    pub original: String,
    pub payment_hash: [u8; 32],
    pub amount_msat: Option<u64>,
    pub description: String,
    pub expiry: Duration,
    /// Creation time, in seconds since the epoch.
    pub timestamp: u64,
    pub cltv_delta: u64,
    /// Payee node.
    pub destination: secp256k1::PublicKey,
    pub payment_secret: [u8; 32],
}

impl DecodedInvoice {
    /// Amount in whole satoshis, rounded down.
    pub fn amount_sat(&self) -> Option<u64> {
        self.amount_msat.map(|msat| msat / 1000)
    }

    pub fn expires_at(&self) -> u64 {
        self.timestamp + self.expiry.as_secs()
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now.unix_timestamp() >= self.expires_at() as i64
    }
}

/// Decode `bolt11` and check it is meant for `network`.
///
/// A `lightning:` prefix is accepted.
pub fn decode_invoice(bolt11: &str, network: Network) -> Result<DecodedInvoice> {
    let trimmed = bolt11.trim();
    let raw = trimmed
        .strip_prefix("lightning:")
        .or_else(|| trimmed.strip_prefix("LIGHTNING:"))
        .unwrap_or(trimmed);

    let invoice = Bolt11Invoice::from_str(raw)
        .map_err(|e| Error::InvalidInvoice(format!("Failed to decode invoice: {}", e)))?;

    if invoice.currency() != Currency::from(network.to_bitcoin_network()) {
        return Err(Error::InvalidInvoice(format!(
            "Invoice is for {:?}, wallet is on {}",
            invoice.currency(),
            network
        )));
    }

    let description = match invoice.description() {
        Bolt11InvoiceDescription::Direct(description) => description.to_string(),
        Bolt11InvoiceDescription::Hash(hash) => hex::encode(hash.0.to_byte_array()),
    };

    Ok(DecodedInvoice {
        original: raw.to_string(),
        payment_hash: invoice.payment_hash().to_byte_array(),
        amount_msat: invoice.amount_milli_satoshis(),
        description,
        expiry: invoice.expiry_time(),
        timestamp: invoice.duration_since_epoch().as_secs(),
        cltv_delta: invoice.min_final_cltv_expiry_delta(),
        destination: invoice.get_payee_pub_key(),
        payment_secret: invoice.payment_secret().0,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceState {
    /// Registered with the backend, not yet handed out.
    Registered,
    /// Encoded into an invoice.
    Used,
}

/// Secrets behind one incoming-swap invoice, as persisted locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceSecrets {
    #[serde(with = "hex_bytes32")]
    pub preimage: [u8; 32],
    #[serde(with = "hex_bytes32")]
    pub payment_hash: [u8; 32],
    #[serde(with = "hex_bytes32")]
    pub payment_secret: [u8; 32],
    /// Parent path of the identity and HTLC keys.
    pub key_path: DerivationPath,
    pub short_channel_id: u64,
    pub state: InvoiceState,
    /// Amount the invoice was encoded with. 0 for amountless invoices.
    #[serde(default)]
    pub amount_sat: u64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub used_at: Option<OffsetDateTime>,
    /// Encrypted [`crate::metadata::OperationMetadata`] for the invoice.
    #[serde(default)]
    pub metadata: Option<String>,
}

impl InvoiceSecrets {
    pub fn identity_key_path(&self) -> DerivationPath {
        self.key_path
            .child(ChildNumber::labeled(IDENTITY_KEY_CHILD, false, "identity"))
    }

    pub fn htlc_key_path(&self) -> DerivationPath {
        self.key_path
            .child(ChildNumber::labeled(HTLC_KEY_CHILD, false, "htlc"))
    }
}

/// Freshly generated secrets plus the public keys to register with the backend.
#[derive(Debug, Clone)]
pub struct GeneratedSecrets {
    pub secrets: InvoiceSecrets,
    pub identity_key: PublicKey,
    pub user_htlc_key: PublicKey,
    pub muun_htlc_key: PublicKey,
}

/// Generate enough secrets to have [`MAX_UNUSED_SECRETS`] unused ones.
///
/// `user` and `muun` are the base public keys. The result must be registered with the
/// backend before it is persisted.
pub fn generate_invoice_secrets(
    user: &PublicKey,
    muun: &PublicKey,
    unused_count: usize,
) -> Result<Vec<GeneratedSecrets>> {
    let missing = MAX_UNUSED_SECRETS.saturating_sub(unused_count);
    let mut rng = rand::thread_rng();

    (0..missing)
        .map(|_| {
            let mut preimage = [0u8; 32];
            let mut payment_secret = [0u8; 32];
            rng.fill_bytes(&mut preimage);
            rng.fill_bytes(&mut payment_secret);

            let l1 = rng.next_u32() & 0x7FFF_FFFF;
            let l2 = rng.next_u32() & 0x7FFF_FFFF;
            let key_path = Schema::invoices_path()
                .child(ChildNumber::normal(l1)?)
                .child(ChildNumber::normal(l2)?);

            let secrets = InvoiceSecrets {
                preimage,
                payment_hash: sha256::Hash::hash(&preimage).to_byte_array(),
                payment_secret,
                key_path,
                short_channel_id: rng.next_u64() | (1 << 63),
                state: InvoiceState::Registered,
                amount_sat: 0,
                used_at: None,
                metadata: None,
            };

            let htlc_path = secrets.htlc_key_path();
            Ok(GeneratedSecrets {
                identity_key: user.derive_to(&secrets.identity_key_path())?,
                user_htlc_key: user.derive_to(&htlc_path)?,
                muun_htlc_key: muun.derive_to(&htlc_path)?,
                secrets,
            })
        })
        .collect()
}

/// Hop hint data handed out by the backend for locally built invoices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteHints {
    /// Hex-encoded node key of the hop into us.
    pub pubkey: String,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
    pub cltv_expiry_delta: u16,
}

#[derive(Debug, Clone, Default)]
pub struct InvoiceOptions {
    pub description: String,
    pub amount_msat: Option<u64>,
    pub route_hints: Vec<RouteHints>,
}

/// Encode and sign an invoice for `secrets` with the identity key below `user_key`.
pub fn build_invoice(
    secrets: &InvoiceSecrets,
    user_key: &PrivateKey,
    options: &InvoiceOptions,
    network: Network,
) -> Result<String> {
    let identity = user_key.derive_to(&secrets.identity_key_path())?;

    let mut builder = InvoiceBuilder::new(Currency::from(network.to_bitcoin_network()))
        .description(options.description.clone())
        .payment_hash(sha256::Hash::from_byte_array(secrets.payment_hash))
        .payment_secret(PaymentSecret(secrets.payment_secret))
        .current_timestamp()
        .min_final_cltv_expiry_delta(INVOICE_CLTV_EXPIRY_DELTA)
        .expiry_time(INVOICE_EXPIRY)
        .basic_mpp();

    for hint in &options.route_hints {
        let node = hex::decode(&hint.pubkey)
            .ok()
            .and_then(|bytes| secp256k1::PublicKey::from_slice(&bytes).ok())
            .ok_or_else(|| {
                Error::InvalidInvoice(format!("Invalid route hint pubkey: {}", hint.pubkey))
            })?;
        builder = builder.private_route(RouteHint(vec![RouteHintHop {
            src_node_id: node,
            short_channel_id: secrets.short_channel_id,
            fees: RoutingFees {
                base_msat: hint.fee_base_msat,
                proportional_millionths: hint.fee_proportional_millionths,
            },
            cltv_expiry_delta: hint.cltv_expiry_delta,
            htlc_minimum_msat: None,
            htlc_maximum_msat: None,
        }]));
    }

    if let Some(amount) = options.amount_msat {
        builder = builder.amount_milli_satoshis(amount);
    }

    let secp = Secp256k1::new();
    let invoice = builder
        .build_signed(|message| secp.sign_ecdsa_recoverable(message, &identity.secret_key()))
        .map_err(|e| Error::InvalidInvoice(format!("Failed to build invoice: {}", e)))?;

    Ok(invoice.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> PrivateKey {
        PrivateKey::from_seed(&[9u8; 32], Network::Regtest).unwrap()
    }

    fn base(key: &PrivateKey) -> PrivateKey {
        key.derive_to(&Schema::base_path()).unwrap()
    }

    #[test]
    fn test_generate_tops_up_to_max() {
        let user = base(&root()).public_key();
        let muun = base(&PrivateKey::from_seed(&[8u8; 32], Network::Regtest).unwrap()).public_key();

        assert_eq!(generate_invoice_secrets(&user, &muun, 0).unwrap().len(), 5);
        assert_eq!(generate_invoice_secrets(&user, &muun, 3).unwrap().len(), 2);
        assert!(generate_invoice_secrets(&user, &muun, 7).unwrap().is_empty());

        let generated = generate_invoice_secrets(&user, &muun, 4).unwrap().remove(0);
        let secrets = &generated.secrets;
        assert_eq!(
            secrets.payment_hash,
            sha256::Hash::hash(&secrets.preimage).to_byte_array()
        );
        assert!(secrets.short_channel_id >= 1 << 63);
        assert!(Schema::invoices_path().is_prefix_of(&secrets.key_path));
        assert_eq!(secrets.key_path.len(), Schema::invoices_path().len() + 2);
        assert_eq!(generated.identity_key.path(), &secrets.identity_key_path());
        assert_eq!(generated.user_htlc_key.path(), generated.muun_htlc_key.path());
    }

    #[test]
    fn test_build_then_decode() {
        let user_key = base(&root());
        let muun = base(&PrivateKey::from_seed(&[8u8; 32], Network::Regtest).unwrap()).public_key();
        let generated = generate_invoice_secrets(&user_key.public_key(), &muun, 4)
            .unwrap()
            .remove(0);

        let options = InvoiceOptions {
            description: "coffee".to_string(),
            amount_msat: Some(12_345_000),
            route_hints: vec![],
        };
        let bolt11 =
            build_invoice(&generated.secrets, &user_key, &options, Network::Regtest).unwrap();
        let decoded = decode_invoice(&bolt11, Network::Regtest).unwrap();

        assert_eq!(decoded.payment_hash, generated.secrets.payment_hash);
        assert_eq!(decoded.amount_sat(), Some(12_345));
        assert_eq!(decoded.cltv_delta, 72);
        assert_eq!(decoded.description, "coffee");
        assert_eq!(decoded.payment_secret, generated.secrets.payment_secret);
        assert_eq!(decoded.destination, generated.identity_key.point());
        assert_eq!(decoded.expiry, INVOICE_EXPIRY);

        let prefixed = format!("lightning:{}", bolt11);
        assert_eq!(decode_invoice(&prefixed, Network::Regtest).unwrap(), decoded);
        assert!(decode_invoice(&bolt11, Network::Bitcoin).is_err());
    }

    #[test]
    fn test_amountless_invoice() {
        let user_key = base(&root());
        let generated = generate_invoice_secrets(&user_key.public_key(), &user_key.public_key(), 4)
            .unwrap()
            .remove(0);
        let bolt11 = build_invoice(
            &generated.secrets,
            &user_key,
            &InvoiceOptions::default(),
            Network::Regtest,
        )
        .unwrap();
        assert_eq!(decode_invoice(&bolt11, Network::Regtest).unwrap().amount_sat(), None);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_invoice("lnbc1notaninvoice", Network::Bitcoin),
            Err(Error::InvalidInvoice(_))
        ));
    }

    #[test]
    fn test_secrets_serde() {
        let user = base(&root()).public_key();
        let generated = generate_invoice_secrets(&user, &user, 4).unwrap().remove(0);
        let json = serde_json::to_string(&generated.secrets).unwrap();
        let back: InvoiceSecrets = serde_json::from_str(&json).unwrap();
        assert_eq!(back, generated.secrets);
    }
}
