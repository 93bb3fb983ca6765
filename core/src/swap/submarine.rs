use crate::address::{AddressVersion, MuunAddress, parse_address};
use crate::error::{Error, Result};
use crate::fees::{BestRouteFees, DebtType, FundingOutputPolicies, SwapFees};
use crate::invoice::{DecodedInvoice, decode_invoice};
use crate::keys::{DerivationPath, PublicKey};
use crate::types::{Network, hex_bytes, hex_bytes32, hex_bytes_opt};
use bitcoin::hashes::{Hash, sha256};
use bitcoin::opcodes::all::{
    OP_CHECKSIG, OP_CHECKSIGVERIFY, OP_CSV, OP_DROP, OP_DUP, OP_ELSE, OP_ENDIF, OP_EQUAL,
    OP_EQUALVERIFY, OP_HASH160, OP_IF, OP_SWAP,
};
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::{Address, ScriptBuf};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Refund timelock requested for every swap: a week of blocks.
pub const SWAP_EXPIRATION_IN_BLOCKS: u32 = 144 * 7;

/// The Lightning node being paid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapReceiver {
    #[serde(default)]
    pub alias: Option<String>,
    /// Hex-encoded compressed node key.
    pub public_key: String,
}

/// The on-chain output that funds the swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapFundingOutput {
    pub output_address: String,
    pub output_amount_in_satoshis: u64,
    pub confirmations_needed: u32,
    #[serde(default)]
    pub user_lock_time: Option<u32>,
    #[serde(default)]
    pub user_refund_address: Option<MuunAddress>,
    #[serde(rename = "serverPaymentHashInHex", with = "hex_bytes32")]
    pub server_payment_hash: [u8; 32],
    #[serde(rename = "serverPublicKeyInHex", with = "hex_bytes")]
    pub server_public_key: Vec<u8>,
    pub script_version: AddressVersion,
    #[serde(default)]
    pub expiration_in_blocks: Option<u32>,
    /// Path of the user and Muun keys in the script.
    #[serde(default)]
    pub output_path: Option<DerivationPath>,
    /// Base58 xpub of the user key at `output_path`.
    #[serde(default)]
    pub user_public_key: Option<String>,
    /// Base58 xpub of the Muun key at `output_path`.
    #[serde(default)]
    pub muun_public_key: Option<String>,
    #[serde(default)]
    pub debt_type: DebtType,
    #[serde(default)]
    pub debt_amount_in_satoshis: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmarineSwapFees {
    pub lightning_in_sats: u64,
    pub sweep_in_sats: u64,
    #[serde(default)]
    pub channel_open_in_sats: u64,
    #[serde(default)]
    pub channel_close_in_sats: u64,
    #[serde(default)]
    pub output_padding_in_sats: u64,
}

impl SubmarineSwapFees {
    /// Fees paid on top of the invoice amount.
    pub fn total(&self, debt_type: DebtType) -> u64 {
        let base = self.lightning_in_sats
            + self.sweep_in_sats
            + self.channel_open_in_sats
            + self.channel_close_in_sats;
        match debt_type {
            // Padding of a lent swap is never paid: its output is not broadcast.
            DebtType::Lend => base,
            DebtType::Collect | DebtType::None => base + self.output_padding_in_sats,
        }
    }
}

/// Lifecycle of an outgoing swap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwapState {
    /// Quote received, nothing on chain.
    #[default]
    Created,
    FundingBroadcast,
    /// The funding output has the confirmations the server asked for.
    Confirmed,
    /// The server never paid and the refund path opened.
    Expired,
    Fulfilled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapEvent {
    FundingBroadcast,
    FundingConfirmed,
    Expired,
    Paid,
    Failed,
}

impl SwapState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SwapState::Fulfilled | SwapState::Failed)
    }

    /// Apply `event`. Lent swaps have no funding output and go straight to an outcome.
    pub fn transition(self, event: SwapEvent, is_lend: bool) -> Result<SwapState> {
        use SwapEvent as E;
        use SwapState as S;

        let next = match (self, event) {
            (S::Created, E::FundingBroadcast) if !is_lend => S::FundingBroadcast,
            (S::Created, E::Paid) if is_lend => S::Fulfilled,
            (S::Created, E::Failed) => S::Failed,
            (S::FundingBroadcast, E::FundingConfirmed) => S::Confirmed,
            (S::FundingBroadcast, E::Expired) => S::Expired,
            (S::Confirmed, E::Paid) => S::Fulfilled,
            (S::Confirmed, E::Failed) => S::Failed,
            (S::Expired, E::Failed) => S::Failed,
            (state, event) => {
                return Err(Error::InvalidSwap(format!(
                    "illegal swap transition {:?} on {:?}",
                    state, event
                )));
            }
        };
        Ok(next)
    }
}

/// An outgoing submarine swap as quoted by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmarineSwap {
    #[serde(rename = "swapUuid")]
    pub houston_uuid: Uuid,
    pub invoice: String,
    pub receiver: SwapReceiver,
    pub funding_output: SwapFundingOutput,
    pub fees: SubmarineSwapFees,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(default)]
    pub will_pre_open_channel: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub payed_at: Option<OffsetDateTime>,
    #[serde(default, rename = "preimageInHex", with = "hex_bytes_opt")]
    pub preimage: Option<Vec<u8>>,
    #[serde(default)]
    pub max_alternative_transactions: u32,
    #[serde(default)]
    pub best_route_fees: Vec<BestRouteFees>,
    #[serde(default)]
    pub funding_output_policies: Option<FundingOutputPolicies>,
    #[serde(default)]
    pub state: SwapState,
}

impl SubmarineSwap {
    pub fn is_lend(&self) -> bool {
        self.funding_output.debt_type == DebtType::Lend
    }

    pub fn is_collect(&self) -> bool {
        self.funding_output.debt_type == DebtType::Collect
    }

    pub fn payment_hash(&self) -> &[u8; 32] {
        &self.funding_output.server_payment_hash
    }

    /// Amount the server forwards over Lightning, as implied by the quote.
    pub fn implied_payment_amount(&self) -> Result<u64> {
        let funding = &self.funding_output;
        let (gross, deductions) = if self.is_lend() {
            (funding.debt_amount_in_satoshis, self.fees.lightning_in_sats)
        } else {
            let debt = if self.is_collect() {
                funding.debt_amount_in_satoshis
            } else {
                0
            };
            (
                funding.output_amount_in_satoshis,
                self.fees.total(funding.debt_type) + debt,
            )
        };

        gross.checked_sub(deductions).ok_or_else(|| {
            Error::InvalidSwap(format!(
                "swap {} fees exceed its amount ({} < {})",
                self.houston_uuid, gross, deductions
            ))
        })
    }

    /// The quote as the payment analyzer sees it.
    ///
    /// Everything the server charges on top of the payment, padding aside, is routing fee.
    pub fn swap_fees(&self) -> SwapFees {
        let fees = &self.fees;
        SwapFees {
            routing_fee: fees.lightning_in_sats
                + fees.sweep_in_sats
                + fees.channel_open_in_sats
                + fees.channel_close_in_sats,
            debt_type: self.funding_output.debt_type,
            debt_amount: self.funding_output.debt_amount_in_satoshis,
            output_amount: self.funding_output.output_amount_in_satoshis,
            output_padding: fees.output_padding_in_sats,
            confirmations_needed: self.funding_output.confirmations_needed,
        }
    }

    /// Cross-check the quote against the invoice it pays.
    ///
    /// Must pass before anything is signed.
    pub fn validate_against_invoice(
        &self,
        invoice: &DecodedInvoice,
        now: OffsetDateTime,
    ) -> Result<()> {
        let amount = invoice.amount_sat().ok_or_else(|| {
            Error::InvalidInvoiceAmount(format!("invoice {} has no amount", invoice.original))
        })?;

        if invoice.is_expired(now) {
            return Err(Error::InvoiceExpired(invoice.original.clone()));
        }

        let implied = self.implied_payment_amount()?;
        if implied != amount {
            return Err(self.invalid(format!(
                "pays {} sats but invoice asks for {}",
                implied, amount
            )));
        }

        if self.expires_at.unix_timestamp() != invoice.expires_at() as i64 {
            return Err(self.invalid(format!(
                "expires at {} but invoice expires at {}",
                self.expires_at.unix_timestamp(),
                invoice.expires_at()
            )));
        }

        Ok(())
    }

    /// The user's refund lock must not be further away than what was requested.
    ///
    /// The extra block covers the server seeing a block before we do.
    pub fn validate_lock_time(&self, current_height: u32) -> Result<()> {
        if let Some(lock_time) = self.funding_output.user_lock_time {
            let limit = current_height + SWAP_EXPIRATION_IN_BLOCKS + 1;
            if lock_time > limit {
                return Err(self.invalid(format!(
                    "refund lock time {} is past {}",
                    lock_time, limit
                )));
            }
        }
        Ok(())
    }

    /// Rebuild the funding script from our own keys and check the quote commits to it.
    ///
    /// `user` and `muun` are base public keys.
    pub fn validate_v2(
        &self,
        original_invoice: &str,
        user: &PublicKey,
        muun: &PublicKey,
        original_expiration_in_blocks: u32,
        network: Network,
    ) -> Result<()> {
        let funding = &self.funding_output;
        if self.invoice != original_invoice {
            return Err(self.invalid(format!(
                "quoted invoice {} is not the one being paid",
                self.invoice
            )));
        }
        let invoice = decode_invoice(original_invoice, network)?;

        if &invoice.payment_hash != self.payment_hash() {
            return Err(self.invalid(format!(
                "payment hash {} does not match invoice {}",
                hex::encode(self.payment_hash()),
                hex::encode(invoice.payment_hash)
            )));
        }

        if hex::encode(invoice.destination.serialize()) != self.receiver.public_key.to_lowercase() {
            return Err(self.invalid(format!(
                "receiver {} is not the invoice payee {}",
                self.receiver.public_key, invoice.destination
            )));
        }

        let expiration = funding
            .expiration_in_blocks
            .ok_or_else(|| self.invalid("missing expiration in blocks".to_string()))?;
        if expiration != original_expiration_in_blocks {
            return Err(self.invalid(format!(
                "expiration {} blocks, requested {}",
                expiration, original_expiration_in_blocks
            )));
        }

        let path = funding
            .output_path
            .as_ref()
            .ok_or_else(|| self.invalid("missing output path".to_string()))?;
        let derived_user = user.derive_to(path)?;
        let derived_muun = muun.derive_to(path)?;

        if funding.user_public_key.as_deref() != Some(derived_user.to_base58().as_str()) {
            return Err(self.invalid("user key does not derive from ours".to_string()));
        }
        if funding.muun_public_key.as_deref() != Some(derived_muun.to_base58().as_str()) {
            return Err(self.invalid("muun key does not derive from ours".to_string()));
        }

        let script = submarine_swap_v2_script(
            self.payment_hash(),
            &derived_user.serialize(),
            &derived_muun.serialize(),
            &funding.server_public_key,
            expiration,
        )?;
        let address = Address::p2wsh(&script, network.to_bitcoin_network());
        let expected = parse_address(&funding.output_address, network)?;
        if address != expected {
            return Err(self.invalid(format!(
                "script address {} does not match funding address {}",
                address, funding.output_address
            )));
        }

        if let Some(preimage) = &self.preimage {
            self.check_preimage(preimage)?;
        }

        Ok(())
    }

    /// Record payment progress reported by the backend.
    ///
    /// A preimage is only accepted if it hashes to the swap's payment hash.
    pub fn apply_payment_info(
        &mut self,
        preimage: Option<&[u8]>,
        confirmations: u32,
    ) -> Result<()> {
        if self.state == SwapState::FundingBroadcast
            && confirmations >= self.funding_output.confirmations_needed
        {
            self.state = self.state.transition(SwapEvent::FundingConfirmed, self.is_lend())?;
        }

        if let Some(preimage) = preimage {
            self.check_preimage(preimage)?;
            if self.state == SwapState::FundingBroadcast {
                // The server only pays once it considers the funding settled.
                self.state = self.state.transition(SwapEvent::FundingConfirmed, self.is_lend())?;
            }
            if !self.state.is_terminal() {
                self.state = self.state.transition(SwapEvent::Paid, self.is_lend())?;
            }
            self.preimage = Some(preimage.to_vec());
            self.payed_at.get_or_insert_with(OffsetDateTime::now_utc);
        }

        Ok(())
    }

    pub fn apply(&mut self, event: SwapEvent) -> Result<SwapState> {
        self.state = self.state.transition(event, self.is_lend())?;
        Ok(self.state)
    }

    fn check_preimage(&self, preimage: &[u8]) -> Result<()> {
        if &sha256::Hash::hash(preimage).to_byte_array() != self.payment_hash() {
            return Err(self.invalid("preimage does not match payment hash".to_string()));
        }
        Ok(())
    }

    fn invalid(&self, reason: String) -> Error {
        log::error!("Swap {} failed validation: {}", self.houston_uuid, reason);
        Error::InvalidSwap(format!("swap {}: {}", self.houston_uuid, reason))
    }
}

/// Witness script of a V2 swap funding output.
///
/// The collaborative path (user and server) and the server's preimage path come first; the
/// refund path needs the timelock plus both user and Muun signatures.
pub fn submarine_swap_v2_script(
    payment_hash: &[u8; 32],
    user: &[u8; 33],
    muun: &[u8; 33],
    server: &[u8],
    blocks_for_expiration: u32,
) -> Result<ScriptBuf> {
    let server = PushBytesBuf::try_from(server.to_vec())
        .map_err(|e| Error::Bitcoin(format!("Invalid server key: {}", e)))?;

    Ok(Builder::new()
        .push_slice(user)
        .push_opcode(OP_SWAP)
        .push_slice(server)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_IF)
        .push_opcode(OP_SWAP)
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(super::ripemd160(payment_hash))
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_IF)
        .push_opcode(OP_DROP)
        .push_opcode(OP_ELSE)
        .push_opcode(OP_SWAP)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ENDIF)
        .push_opcode(OP_ELSE)
        .push_int(blocks_for_expiration as i64)
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP)
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(super::hash160(muun))
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ENDIF)
        .into_script())
}
