use super::sphinx;
use crate::error::{Error, Result};
use crate::invoice::InvoiceSecrets;
use crate::keys::{PrivateKey, PublicKey};
use crate::storage::InvoiceSecretsStorage;
use crate::types::{hex_bytes, hex_bytes_opt};
use bitcoin::consensus::{deserialize, serialize};
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::{
    OP_CHECKSIG, OP_CHECKSIGVERIFY, OP_CLTV, OP_DUP, OP_ELSE, OP_ENDIF, OP_EQUAL, OP_EQUALVERIFY,
    OP_HASH160, OP_NOTIF, OP_SIZE,
};
use bitcoin::script::Builder;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Amount, ScriptBuf, Transaction, Witness};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncomingSwapState {
    #[default]
    PendingFulfillment,
    /// Verified against the local secrets, safe to claim.
    Fulfillable,
    Fulfilled,
    /// Failed verification. Never retried.
    Failed,
}

/// The on-chain HTLC collateralizing an incoming payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingSwapHtlc {
    #[serde(with = "hex_bytes")]
    pub htlc_tx: Vec<u8>,
    pub expiration_height: u32,
    #[serde(with = "hex_bytes")]
    pub swap_server_public_key: Vec<u8>,
    #[serde(default)]
    pub fulfillment_fee_subsidy_sat: u64,
    #[serde(default, with = "hex_bytes_opt")]
    pub fulfillment_tx: Option<Vec<u8>>,
}

/// An inbound Lightning payment paid to one of our invoices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingSwap {
    #[serde(rename = "uuid")]
    pub houston_uuid: Uuid,
    #[serde(with = "hex_bytes")]
    pub payment_hash: Vec<u8>,
    /// Missing when the whole payment is lent and no HTLC is ever broadcast.
    #[serde(default)]
    pub htlc: Option<IncomingSwapHtlc>,
    #[serde(default, with = "hex_bytes_opt")]
    pub sphinx_packet: Option<Vec<u8>>,
    pub payment_amount_sat: u64,
    #[serde(default)]
    pub collect_sat: u64,
    #[serde(default, rename = "preimageHex", with = "hex_bytes_opt")]
    pub preimage: Option<Vec<u8>>,
    #[serde(default)]
    pub state: IncomingSwapState,
}

/// The fulfillment transaction proposed by Muun, already signed on its side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillmentData {
    #[serde(rename = "fulfillmentTxHex", with = "hex_bytes")]
    pub fulfillment_tx: Vec<u8>,
    #[serde(rename = "muunSignatureHex", with = "hex_bytes")]
    pub muun_signature: Vec<u8>,
    #[serde(default)]
    pub confirmation_target: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentResult {
    /// Absent for full-debt swaps: only the preimage is handed over.
    pub fulfillment_tx: Option<Vec<u8>>,
    pub preimage: [u8; 32],
}

impl IncomingSwap {
    /// Check that the swap pays one of our invoices before any resource is committed.
    ///
    /// A failure marks the swap [`IncomingSwapState::Failed`].
    pub async fn verify_fulfillable(
        &mut self,
        user_key: &PrivateKey,
        store: &dyn InvoiceSecretsStorage,
        current_height: u32,
    ) -> Result<()> {
        self.ensure_not_failed()?;

        let outcome = match self.find_secrets(store).await {
            Ok(secrets) => self.check_fulfillable(&secrets, user_key, current_height),
            Err(e) => Err(e),
        };
        self.settle(outcome)?;

        if self.state == IncomingSwapState::PendingFulfillment {
            self.state = IncomingSwapState::Fulfillable;
        }
        Ok(())
    }

    /// Validate Muun's proposed fulfillment and sign our half of it.
    ///
    /// `user_key` and `muun_key` are base keys.
    pub async fn fulfill(
        &mut self,
        data: &FulfillmentData,
        user_key: &PrivateKey,
        muun_key: &PublicKey,
        store: &dyn InvoiceSecretsStorage,
        current_height: u32,
    ) -> Result<FulfillmentResult> {
        let htlc = self
            .htlc
            .clone()
            .ok_or_else(|| Error::IncomingSwap("missing swap htlc data".to_string()))?;

        self.verify_fulfillable(user_key, store, current_height).await?;
        let secrets = self.find_secrets(store).await?;

        let outcome = (|| {
            let mut tx: Transaction = deserialize(&data.fulfillment_tx).map_err(|e| {
                Error::IncomingSwap(format!("could not deserialize fulfillment tx: {}", e))
            })?;
            if tx.input.len() != 1 {
                return Err(Error::IncomingSwap(format!(
                    "expected fulfillment tx to have exactly 1 input, found {}",
                    tx.input.len()
                )));
            }
            if tx.output.len() != 1 {
                return Err(Error::IncomingSwap(format!(
                    "expected fulfillment tx to have exactly 1 output, found {}",
                    tx.output.len()
                )));
            }

            let expected_msat = (tx.output[0].value.to_sat() + self.collect_sat) * 1000;
            let input = HtlcInput {
                htlc: &htlc,
                payment_hash: &secrets.payment_hash,
                sphinx_packet: self.sphinx_packet.as_deref(),
                muun_signature: &data.muun_signature,
                expected_msat: Some(expected_msat),
            };
            sign_htlc_input(&mut tx, 0, &input, &secrets, user_key, muun_key)?;
            Ok(serialize(&tx))
        })();
        let fulfillment_tx = self.settle(outcome)?;

        log::info!(
            "Fulfilled incoming swap {} for {} sats",
            self.houston_uuid,
            self.payment_amount_sat
        );
        if let Some(htlc) = self.htlc.as_mut() {
            htlc.fulfillment_tx = Some(fulfillment_tx.clone());
        }
        self.preimage = Some(secrets.preimage.to_vec());
        self.state = IncomingSwapState::Fulfilled;

        Ok(FulfillmentResult {
            fulfillment_tx: Some(fulfillment_tx),
            preimage: secrets.preimage,
        })
    }

    /// Hand over the preimage for a swap fully covered by debt.
    pub async fn fulfill_full_debt(
        &mut self,
        store: &dyn InvoiceSecretsStorage,
    ) -> Result<FulfillmentResult> {
        let secrets = self.find_secrets(store).await?;
        self.preimage = Some(secrets.preimage.to_vec());
        self.state = IncomingSwapState::Fulfilled;
        Ok(FulfillmentResult {
            fulfillment_tx: None,
            preimage: secrets.preimage,
        })
    }

    fn check_fulfillable(
        &self,
        secrets: &InvoiceSecrets,
        user_key: &PrivateKey,
        current_height: u32,
    ) -> Result<()> {
        let node_key = user_key.derive_to(&secrets.identity_key_path())?;

        // Payers may send a few extra sats.
        if secrets.amount_sat != 0 && secrets.amount_sat > self.payment_amount_sat {
            return Err(Error::IncomingSwap(format!(
                "payment amount ({}) does not match invoice amount ({})",
                self.payment_amount_sat, secrets.amount_sat
            )));
        }

        if let Some(htlc) = &self.htlc {
            if current_height >= htlc.expiration_height {
                return Err(Error::IncomingSwap(format!(
                    "htlc expired at height {}, current height is {}",
                    htlc.expiration_height, current_height
                )));
            }
        }

        if let Some(packet) = self.sphinx_packet.as_deref().filter(|p| !p.is_empty()) {
            sphinx::validate(
                packet,
                &secrets.payment_hash,
                &secrets.payment_secret,
                &node_key.secret_key(),
                0,
                self.payment_amount_sat * 1000,
            )?;
        }

        Ok(())
    }

    async fn find_secrets(&self, store: &dyn InvoiceSecretsStorage) -> Result<InvoiceSecrets> {
        let hash: [u8; 32] = self.payment_hash.as_slice().try_into().map_err(|_| {
            Error::IncomingSwap(format!(
                "received invalid hash len {}",
                self.payment_hash.len()
            ))
        })?;

        store.find_by_payment_hash(&hash).await?.ok_or_else(|| {
            Error::IncomingSwap(format!(
                "could not find invoice data for payment hash {}",
                hex::encode(hash)
            ))
        })
    }

    fn ensure_not_failed(&self) -> Result<()> {
        if self.state == IncomingSwapState::Failed {
            return Err(Error::IncomingSwap(format!(
                "swap {} already failed verification",
                self.houston_uuid
            )));
        }
        Ok(())
    }

    fn settle<T>(&mut self, outcome: Result<T>) -> Result<T> {
        if let Err(e) = &outcome {
            log::error!("Incoming swap {} is not fulfillable: {}", self.houston_uuid, e);
            self.state = IncomingSwapState::Failed;
        }
        outcome
    }
}

/// What is needed to spend an incoming swap HTLC output on the preimage path.
pub(crate) struct HtlcInput<'a> {
    pub htlc: &'a IncomingSwapHtlc,
    pub payment_hash: &'a [u8; 32],
    pub sphinx_packet: Option<&'a [u8]>,
    pub muun_signature: &'a [u8],
    /// Amount the onion must not exceed. `None` skips the amount check.
    pub expected_msat: Option<u64>,
}

/// Verify and sign input `index` of `tx`, which must spend the HTLC of `input`.
pub(crate) fn sign_htlc_input(
    tx: &mut Transaction,
    index: usize,
    input: &HtlcInput<'_>,
    secrets: &InvoiceSecrets,
    user_key: &PrivateKey,
    muun_key: &PublicKey,
) -> Result<()> {
    let htlc_tx: Transaction = deserialize(&input.htlc.htlc_tx)
        .map_err(|e| Error::IncomingSwap(format!("could not deserialize htlc tx: {}", e)))?;

    let htlc_path = secrets.htlc_key_path();
    let user_htlc_key = user_key.derive_to(&htlc_path)?;
    let muun_htlc_key = muun_key.derive_to(&htlc_path)?;

    let script = htlc_script(
        &user_htlc_key.public_key().serialize(),
        &muun_htlc_key.serialize(),
        &input.htlc.swap_server_public_key,
        input.htlc.expiration_height,
        input.payment_hash,
    );
    let script_pubkey = ScriptBuf::new_p2wsh(&script.wscript_hash());

    let output_index = htlc_tx
        .output
        .iter()
        .position(|output| output.script_pubkey == script_pubkey)
        .ok_or_else(|| Error::IncomingSwap("could not find htlc output".to_string()))?;
    let htlc_amount = htlc_tx.output[output_index].value;

    let previous = tx
        .input
        .get(index)
        .map(|txin| txin.previous_output)
        .ok_or_else(|| Error::IncomingSwap(format!("missing input {}", index)))?;
    if previous.txid != htlc_tx.compute_txid() {
        return Err(Error::IncomingSwap(
            "expected fulfillment tx input to point to htlc tx".to_string(),
        ));
    }
    if previous.vout as usize != output_index {
        return Err(Error::IncomingSwap(
            "expected fulfillment tx input to point to correct htlc output".to_string(),
        ));
    }

    let digest = p2wsh_sighash(tx, index, &script, htlc_amount)?;

    let muun_signature = ecdsa::Signature::from_slice(input.muun_signature)
        .map_err(|e| Error::IncomingSwap(format!("invalid muun signature: {}", e)))?;
    Secp256k1::verification_only()
        .verify_ecdsa(
            &Message::from_digest(digest),
            &muun_signature.signature,
            &muun_htlc_key.point(),
        )
        .map_err(|e| {
            Error::IncomingSwap(format!("could not verify Muun signature for htlc: {}", e))
        })?;

    if let Some(packet) = input.sphinx_packet.filter(|p| !p.is_empty()) {
        let node_key = user_key.derive_to(&secrets.identity_key_path())?;
        sphinx::validate(
            packet,
            input.payment_hash,
            &secrets.payment_secret,
            &node_key.secret_key(),
            input.htlc.expiration_height,
            input.expected_msat.unwrap_or(u64::MAX),
        )?;
    }

    let user_signature = ecdsa::Signature {
        signature: user_htlc_key.sign_ecdsa(digest),
        sighash_type: EcdsaSighashType::All,
    };

    tx.input[index].witness = Witness::from_slice(&[
        secrets.preimage.to_vec(),
        user_signature.to_vec(),
        input.muun_signature.to_vec(),
        script.to_bytes(),
    ]);
    Ok(())
}

pub(crate) fn p2wsh_sighash(
    tx: &Transaction,
    index: usize,
    script: &ScriptBuf,
    amount: Amount,
) -> Result<[u8; 32]> {
    let sighash = SighashCache::new(tx)
        .p2wsh_signature_hash(index, script, amount, EcdsaSighashType::All)
        .map_err(|e| Error::Signing(format!("Failed to compute sighash: {}", e)))?;
    Ok(sighash.to_byte_array())
}

/// Witness script of an incoming swap HTLC.
///
/// Muun and the swap server can reclaim it after `expiration_height`; Muun and the user
/// spend it with the preimage.
pub fn htlc_script(
    user: &[u8; 33],
    muun: &[u8; 33],
    swap_server: &[u8],
    expiration_height: u32,
    payment_hash: &[u8; 32],
) -> ScriptBuf {
    Builder::new()
        .push_slice(muun)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_NOTIF)
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(super::hash160(swap_server))
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_int(expiration_height as i64)
        .push_opcode(OP_CLTV)
        .push_opcode(OP_ELSE)
        .push_slice(user)
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_opcode(OP_SIZE)
        .push_int(32)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_HASH160)
        .push_slice(super::ripemd160(payment_hash))
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_ENDIF)
        .into_script()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::invoice::generate_invoice_secrets;
    use crate::keys::Schema;
    use crate::storage::memory::MemoryInvoiceSecretsStorage;
    use crate::types::Network;
    use crate::swap::sphinx::{FinalHopPayload, build_final_hop_onion, node_public_key};
    use bitcoin::absolute::LockTime;
    use bitcoin::secp256k1::SecretKey;
    use bitcoin::transaction::Version;
    use bitcoin::{OutPoint, Sequence, TxIn, TxOut};

    pub(crate) struct Fixture {
        pub user: PrivateKey,
        pub muun: PrivateKey,
        pub secrets: InvoiceSecrets,
        pub store: MemoryInvoiceSecretsStorage,
    }

    pub(crate) async fn fixture(amount_sat: u64) -> Fixture {
        let network = Network::Regtest;
        let user = PrivateKey::from_seed(&[1u8; 32], network)
            .unwrap()
            .derive_to(&Schema::base_path())
            .unwrap();
        let muun = PrivateKey::from_seed(&[2u8; 32], network)
            .unwrap()
            .derive_to(&Schema::base_path())
            .unwrap();

        let mut secrets = generate_invoice_secrets(&user.public_key(), &muun.public_key(), 4)
            .unwrap()
            .remove(0)
            .secrets;
        secrets.amount_sat = amount_sat;

        let store = MemoryInvoiceSecretsStorage::new();
        store.store(std::slice::from_ref(&secrets)).await.unwrap();

        Fixture {
            user,
            muun,
            secrets,
            store,
        }
    }

    fn onion(fixture: &Fixture, amount_msat: u64, cltv: u32) -> Vec<u8> {
        let node = fixture
            .user
            .derive_to(&fixture.secrets.identity_key_path())
            .unwrap()
            .secret_key();
        build_final_hop_onion(
            &node_public_key(&node),
            &fixture.secrets.payment_hash,
            &FinalHopPayload {
                amt_to_forward_msat: amount_msat,
                outgoing_cltv: cltv,
                payment_secret: Some(fixture.secrets.payment_secret),
                total_msat: Some(amount_msat),
            },
            &SecretKey::from_slice(&[7u8; 32]).unwrap(),
        )
        .unwrap()
    }

    const SERVER: [u8; 33] = [3u8; 33];
    const EXPIRATION: u32 = 500;

    /// An HTLC tx paying `htlc_amount` and a fulfillment tx claiming it to `claim_amount`,
    /// with Muun's signature already on it.
    fn transactions(
        fixture: &Fixture,
        htlc_amount: u64,
        claim_amount: u64,
    ) -> (Vec<u8>, FulfillmentData) {
        let path = fixture.secrets.htlc_key_path();
        let user_htlc = fixture.user.derive_to(&path).unwrap();
        let muun_htlc = fixture.muun.derive_to(&path).unwrap();
        let script = htlc_script(
            &user_htlc.public_key().serialize(),
            &muun_htlc.public_key().serialize(),
            &SERVER,
            EXPIRATION,
            &fixture.secrets.payment_hash,
        );

        let htlc_tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![
                TxOut {
                    value: Amount::from_sat(1_000),
                    script_pubkey: ScriptBuf::new_op_return([1u8; 4]),
                },
                TxOut {
                    value: Amount::from_sat(htlc_amount),
                    script_pubkey: ScriptBuf::new_p2wsh(&script.wscript_hash()),
                },
            ],
        };

        let fulfillment = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(htlc_tx.compute_txid(), 1),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(claim_amount),
                script_pubkey: ScriptBuf::new_op_return([2u8; 4]),
            }],
        };

        let digest =
            p2wsh_sighash(&fulfillment, 0, &script, Amount::from_sat(htlc_amount)).unwrap();
        let muun_signature = ecdsa::Signature {
            signature: muun_htlc.sign_ecdsa(digest),
            sighash_type: EcdsaSighashType::All,
        };

        (
            serialize(&htlc_tx),
            FulfillmentData {
                fulfillment_tx: serialize(&fulfillment),
                muun_signature: muun_signature.to_vec(),
                confirmation_target: 0,
            },
        )
    }

    fn swap(
        fixture: &Fixture,
        htlc_tx: Vec<u8>,
        amount_sat: u64,
        sphinx: Option<Vec<u8>>,
    ) -> IncomingSwap {
        IncomingSwap {
            houston_uuid: Uuid::nil(),
            payment_hash: fixture.secrets.payment_hash.to_vec(),
            htlc: Some(IncomingSwapHtlc {
                htlc_tx,
                expiration_height: EXPIRATION,
                swap_server_public_key: SERVER.to_vec(),
                fulfillment_fee_subsidy_sat: 0,
                fulfillment_tx: None,
            }),
            sphinx_packet: sphinx,
            payment_amount_sat: amount_sat,
            collect_sat: 0,
            preimage: None,
            state: IncomingSwapState::PendingFulfillment,
        }
    }

    #[tokio::test]
    async fn test_fulfill_signs_preimage_path() {
        let fixture = fixture(10_000).await;
        let (htlc_tx, data) = transactions(&fixture, 10_000, 9_800);
        let packet = onion(&fixture, 9_800_000, EXPIRATION - 10);
        let mut swap = swap(&fixture, htlc_tx, 10_000, Some(packet));

        let result = swap
            .fulfill(
                &data,
                &fixture.user,
                &fixture.muun.public_key(),
                &fixture.store,
                100,
            )
            .await
            .unwrap();

        assert_eq!(result.preimage, fixture.secrets.preimage);
        assert_eq!(swap.state, IncomingSwapState::Fulfilled);

        let tx: Transaction = deserialize(&result.fulfillment_tx.unwrap()).unwrap();
        let witness: Vec<&[u8]> = tx.input[0].witness.iter().collect();
        assert_eq!(witness.len(), 4);
        assert_eq!(witness[0], &fixture.secrets.preimage[..]);
        assert_eq!(witness[2], &data.muun_signature[..]);
    }

    #[tokio::test]
    async fn test_fulfill_rejects_bad_muun_signature() {
        let fixture = fixture(10_000).await;
        let (htlc_tx, mut data) = transactions(&fixture, 10_000, 9_800);
        data.muun_signature[10] ^= 1;
        let mut swap = swap(&fixture, htlc_tx, 10_000, None);

        let result = swap
            .fulfill(
                &data,
                &fixture.user,
                &fixture.muun.public_key(),
                &fixture.store,
                100,
            )
            .await;
        assert!(matches!(result, Err(Error::IncomingSwap(_))));
        assert_eq!(swap.state, IncomingSwapState::Failed);

        // Failures are final.
        assert!(swap
            .verify_fulfillable(&fixture.user, &fixture.store, 100)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_fulfill_rejects_onion_asking_for_more() {
        let fixture = fixture(10_000).await;
        let (htlc_tx, data) = transactions(&fixture, 10_000, 9_800);
        let packet = onion(&fixture, 9_900_000, EXPIRATION - 10);
        let mut swap = swap(&fixture, htlc_tx, 10_000, Some(packet));

        assert!(swap
            .fulfill(
                &data,
                &fixture.user,
                &fixture.muun.public_key(),
                &fixture.store,
                100,
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_verify_fulfillable_checks() {
        let fixture = fixture(10_000).await;
        let (htlc_tx, _) = transactions(&fixture, 10_000, 9_800);

        let mut ok = swap(&fixture, htlc_tx.clone(), 10_000, None);
        ok.verify_fulfillable(&fixture.user, &fixture.store, 100)
            .await
            .unwrap();
        assert_eq!(ok.state, IncomingSwapState::Fulfillable);

        let mut short_payment = swap(&fixture, htlc_tx.clone(), 9_999, None);
        assert!(short_payment
            .verify_fulfillable(&fixture.user, &fixture.store, 100)
            .await
            .is_err());

        let mut expired = swap(&fixture, htlc_tx.clone(), 10_000, None);
        assert!(expired
            .verify_fulfillable(&fixture.user, &fixture.store, EXPIRATION)
            .await
            .is_err());

        let mut unknown = swap(&fixture, htlc_tx.clone(), 10_000, None);
        unknown.payment_hash = vec![9u8; 32];
        assert!(unknown
            .verify_fulfillable(&fixture.user, &fixture.store, 100)
            .await
            .is_err());

        let mut bad_hash = swap(&fixture, htlc_tx, 10_000, None);
        bad_hash.payment_hash = vec![9u8; 31];
        assert!(bad_hash
            .verify_fulfillable(&fixture.user, &fixture.store, 100)
            .await
            .is_err());
        assert_eq!(bad_hash.state, IncomingSwapState::Failed);
    }

    #[tokio::test]
    async fn test_full_debt_returns_preimage_only() {
        let fixture = fixture(0).await;
        let mut swap = swap(&fixture, vec![], 2_000, None);
        swap.htlc = None;

        let result = swap.fulfill_full_debt(&fixture.store).await.unwrap();
        assert!(result.fulfillment_tx.is_none());
        assert_eq!(result.preimage, fixture.secrets.preimage);
        assert_eq!(swap.state, IncomingSwapState::Fulfilled);
    }
}
