use super::nonces::{MusigNonces, public_nonce, secret_nonce};
use crate::address::{
    AddressVersion, MuunAddress, compressed, create_address, multisig_script, musig_context,
    parse_address, to_musig_point,
};
use crate::error::{Error, Result};
use crate::invoice::InvoiceSecrets;
use crate::keys::{PrivateKey, PublicKey, PublicKeyPair};
use crate::storage::InvoiceSecretsStorage;
use crate::swap::{
    HtlcInput, IncomingSwapHtlc, p2wsh_sighash, sign_htlc_input, submarine_swap_v2_script,
};
use crate::types::{DUST_THRESHOLD, hex_bytes, hex_bytes32, hex_bytes_opt};
use bitcoin::consensus::{deserialize, serialize};
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::OP_0;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::{Amount, ScriptBuf, Transaction, TxOut, Witness};
use musig2::{AggNonce, LiftedSignature, PartialSignature, PubNonce};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outpoint {
    pub txid: String,
    pub index: u32,
    pub amount: u64,
}

/// Data needed to spend an outgoing swap funding output collaboratively with the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputSubmarineSwapV2 {
    #[serde(with = "hex_bytes32")]
    pub swap_payment_hash: [u8; 32],
    #[serde(with = "hex_bytes")]
    pub user_public_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub muun_public_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub swap_server_public_key: Vec<u8>,
    pub blocks_for_expiration: u32,
    #[serde(with = "hex_bytes")]
    pub server_signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputIncomingSwap {
    #[serde(default, with = "hex_bytes_opt")]
    pub sphinx: Option<Vec<u8>>,
    #[serde(with = "hex_bytes")]
    pub htlc_tx: Vec<u8>,
    #[serde(with = "hex_bytes32")]
    pub payment_hash: [u8; 32],
    #[serde(with = "hex_bytes")]
    pub swap_server_public_key: Vec<u8>,
    pub expiration_height: u32,
    #[serde(default)]
    pub collect_in_sats: u64,
    /// Looked up locally by payment hash before signing.
    #[serde(skip)]
    pub secrets: Option<InvoiceSecrets>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Input {
    pub outpoint: Outpoint,
    pub address: MuunAddress,
    #[serde(default, with = "hex_bytes_opt")]
    pub user_signature: Option<Vec<u8>>,
    /// ECDSA signature for script inputs, 32-byte partial signature for V5.
    #[serde(default, with = "hex_bytes_opt")]
    pub muun_signature: Option<Vec<u8>>,
    #[serde(default, with = "hex_bytes_opt")]
    pub muun_pub_nonce: Option<Vec<u8>>,
    #[serde(default)]
    pub submarine_swap_v2: Option<InputSubmarineSwapV2>,
    #[serde(default)]
    pub incoming_swap: Option<InputIncomingSwap>,
}

/// What the user agreed to pay. A skeleton that deviates from it is never signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningExpectations {
    pub destination: String,
    pub amount: u64,
    pub change: Option<MuunAddress>,
    pub fee: u64,
    pub alternative: bool,
}

impl SigningExpectations {
    pub fn for_alternative(&self) -> Self {
        Self {
            alternative: true,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub hash: String,
    pub hex: String,
}

pub struct PartiallySignedTransaction {
    tx: Transaction,
    inputs: Vec<Input>,
    nonces: MusigNonces,
}

impl PartiallySignedTransaction {
    pub fn new(raw_tx_hex: &str, inputs: Vec<Input>, nonces: MusigNonces) -> Result<Self> {
        let bytes = hex::decode(raw_tx_hex)
            .map_err(|e| Error::InvalidTransaction(format!("failed to decode tx hex: {}", e)))?;
        let tx: Transaction = deserialize(&bytes)
            .map_err(|e| Error::InvalidTransaction(format!("failed to decode tx: {}", e)))?;

        if tx.input.len() != inputs.len() {
            return Err(Error::InvalidTransaction(format!(
                "tx has {} inputs but {} were described",
                tx.input.len(),
                inputs.len()
            )));
        }

        Ok(Self { tx, inputs, nonces })
    }

    pub fn tx(&self) -> &Transaction {
        &self.tx
    }

    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    /// Attach the local invoice secrets every incoming swap input needs.
    pub async fn resolve_invoice_secrets(
        &mut self,
        store: &dyn InvoiceSecretsStorage,
    ) -> Result<()> {
        for input in &mut self.inputs {
            if let Some(swap) = input.incoming_swap.as_mut() {
                let secrets = store
                    .find_by_payment_hash(&swap.payment_hash)
                    .await?
                    .ok_or_else(|| {
                        Error::IncomingSwap(format!(
                            "could not find invoice data for payment hash {}",
                            hex::encode(swap.payment_hash)
                        ))
                    })?;
                swap.secrets = Some(secrets);
            }
        }
        Ok(())
    }

    /// Check that the skeleton pays what the user expects and nothing else.
    ///
    /// `user_key` and `muun_key` are base public keys.
    pub fn verify(
        &self,
        expectations: &SigningExpectations,
        user_key: &PublicKey,
        muun_key: &PublicKey,
    ) -> Result<()> {
        let network = user_key.network();
        let outputs = &self.tx.output;

        match (&expectations.change, expectations.alternative) {
            (Some(_), true) if outputs.len() > 2 => {
                return Err(invalid(format!(
                    "expected at most destination and change outputs but found {}",
                    outputs.len()
                )));
            }
            (Some(_), false) if outputs.len() != 2 => {
                return Err(invalid(format!(
                    "expected destination and change outputs but found {}",
                    outputs.len()
                )));
            }
            (None, _) if outputs.len() != 1 => {
                return Err(invalid(format!(
                    "expected destination output only but found {}",
                    outputs.len()
                )));
            }
            _ => {}
        }

        let to_script = parse_address(&expectations.destination, network)?.script_pubkey();
        let change_script = expectations
            .change
            .as_ref()
            .map(|change| change.script_pubkey(network))
            .transpose()?;

        let mut to_output = None;
        let mut change_output = None;
        for output in outputs {
            if output.script_pubkey == to_script {
                to_output = Some(output.value.to_sat() as i64);
            } else if change_script.as_ref() == Some(&output.script_pubkey) {
                change_output = Some(output.value.to_sat() as i64);
            }
        }

        let mut expected_amount = expectations.amount as i64;
        let mut expected_fee = expectations.fee as i64;

        if expectations.alternative {
            if to_output.is_none() && change_output.is_none() {
                return Err(invalid(
                    "expected at least one of destination and change outputs".to_string(),
                ));
            }
            if let Some(value) = to_output {
                if value >= expected_amount {
                    return Err(invalid(format!(
                        "destination amount is mismatched. found {} expected at most {}",
                        value, expected_amount
                    )));
                }
            }
            if (to_output.is_none() || change_output.is_none()) && outputs.len() > 1 {
                return Err(invalid(format!(
                    "expected exactly one output and found {}",
                    outputs.len()
                )));
            }

            // The reduction of the destination output goes to fee.
            let to_value = to_output.unwrap_or(0);
            expected_fee += expected_amount - to_value;
            expected_amount = to_value;
        } else {
            let value = to_output
                .ok_or_else(|| invalid("destination output is not present".to_string()))?;
            if value != expected_amount {
                return Err(invalid(format!(
                    "destination amount is mismatched. found {} expected {}",
                    value, expected_amount
                )));
            }
        }

        let total: i64 = self
            .inputs
            .iter()
            .map(|input| input.outpoint.amount as i64)
            .sum();

        match &expectations.change {
            Some(change) => {
                let value =
                    change_output.ok_or_else(|| invalid("change is not present".to_string()))?;
                let expected_change = total - expected_amount - expected_fee;
                if value != expected_change {
                    return Err(invalid(format!(
                        "change amount is mismatched. found {} expected {}",
                        value, expected_change
                    )));
                }

                let pair = PublicKeyPair::new(
                    user_key.derive_to(&change.derivation_path)?,
                    muun_key.derive_to(&change.derivation_path)?,
                )?;
                let rebuilt = create_address(change.version, &pair)?;
                if rebuilt.address != change.address {
                    return Err(invalid(format!(
                        "mismatched change address. found {}, expected {}",
                        change.address, rebuilt.address
                    )));
                }
            }
            None => {
                if total - expected_amount >= expected_fee + DUST_THRESHOLD as i64 {
                    return Err(invalid(
                        "change output is too big to be burned as fee".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Sign every input with `user_key` (the base private key).
    ///
    /// Consumes the transaction together with its nonces.
    pub fn sign(self, user_key: &PrivateKey, muun_key: &PublicKey) -> Result<SignedTransaction> {
        let network = user_key.network();
        let prevouts = self
            .inputs
            .iter()
            .map(|input| {
                Ok(TxOut {
                    value: Amount::from_sat(input.outpoint.amount),
                    script_pubkey: input.address.script_pubkey(network)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let unsigned = self.tx.clone();
        let mut tx = self.tx;

        for (index, input) in self.inputs.iter().enumerate() {
            if self.nonces.len() <= index {
                return Err(Error::Signing("not enough nonces".to_string()));
            }

            let signer = InputSigner {
                unsigned: &unsigned,
                index,
                input,
                user_key,
                muun_key,
                nonces: &self.nonces,
                prevouts: &prevouts,
            };
            signer.sign(&mut tx)?;
        }

        let hash = tx.compute_txid().to_string();
        log::info!("Signed transaction {}", hash);
        Ok(SignedTransaction {
            hash,
            hex: hex::encode(serialize(&tx)),
        })
    }
}

fn invalid(reason: String) -> Error {
    Error::InvalidTransaction(reason)
}

struct InputSigner<'a> {
    unsigned: &'a Transaction,
    index: usize,
    input: &'a Input,
    user_key: &'a PrivateKey,
    muun_key: &'a PublicKey,
    nonces: &'a MusigNonces,
    prevouts: &'a [TxOut],
}

impl InputSigner<'_> {
    fn sign(&self, tx: &mut Transaction) -> Result<()> {
        let index = self.index;
        let version = self.input.address.version;

        match version {
            AddressVersion::IncomingSwap => self.sign_incoming_swap(tx)?,
            AddressVersion::V1 => {
                let user = self.user()?;
                let user_pub = compressed(user.public_key().point());
                let script_pubkey = ScriptBuf::new_p2pkh(&user_pub.pubkey_hash());
                let digest = self.legacy_sighash(&script_pubkey)?;
                tx.input[index].script_sig = Builder::new()
                    .push_slice(push_bytes(ecdsa_signature(&user, digest))?)
                    .push_slice(user_pub.to_bytes())
                    .into_script();
            }
            AddressVersion::V2 => {
                let user = self.user()?;
                let script = self.multisig(&user)?;
                let digest = self.legacy_sighash(&script)?;
                let mut builder = Builder::new()
                    .push_opcode(OP_0)
                    .push_slice(push_bytes(ecdsa_signature(&user, digest))?);
                if let Some(muun_signature) = &self.input.muun_signature {
                    builder = builder.push_slice(push_bytes(muun_signature.clone())?);
                }
                tx.input[index].script_sig =
                    builder.push_slice(push_bytes(script.to_bytes())?).into_script();
            }
            AddressVersion::V3 | AddressVersion::V4 => {
                let user = self.user()?;
                let script = self.multisig(&user)?;
                let digest = p2wsh_sighash(self.unsigned, index, &script, self.amount())?;

                let mut witness = vec![Vec::new(), ecdsa_signature(&user, digest)];
                if let Some(muun_signature) = &self.input.muun_signature {
                    witness.push(muun_signature.clone());
                }
                witness.push(script.to_bytes());
                tx.input[index].witness = Witness::from_slice(&witness);

                if version == AddressVersion::V3 {
                    let program = ScriptBuf::new_p2wsh(&script.wscript_hash());
                    tx.input[index].script_sig = Builder::new()
                        .push_slice(push_bytes(program.to_bytes())?)
                        .into_script();
                }
            }
            AddressVersion::V5 => {
                let user = self.user()?;
                tx.input[index].witness = Witness::from_slice(&[self.musig_signature(&user)?]);
            }
            AddressVersion::SubmarineSwapV2 => {
                let user = self.user()?;
                tx.input[index].witness = self.submarine_swap_witness(&user)?;
            }
        }

        Ok(())
    }

    fn user(&self) -> Result<PrivateKey> {
        self.user_key.derive_to(&self.input.address.derivation_path)
    }

    fn amount(&self) -> Amount {
        Amount::from_sat(self.input.outpoint.amount)
    }

    fn multisig(&self, user: &PrivateKey) -> Result<ScriptBuf> {
        let muun = self.muun_key.derive_to(&self.input.address.derivation_path)?;
        Ok(multisig_script(
            &compressed(user.public_key().point()),
            &compressed(muun.point()),
        ))
    }

    fn legacy_sighash(&self, script_code: &ScriptBuf) -> Result<[u8; 32]> {
        let sighash = SighashCache::new(self.unsigned)
            .legacy_signature_hash(self.index, script_code, EcdsaSighashType::All.to_u32())
            .map_err(|e| Error::Signing(format!("Failed to compute sighash: {}", e)))?;
        Ok(sighash.to_byte_array())
    }

    /// Aggregate our partial signature with Muun's into the final key-path signature.
    fn musig_signature(&self, user: &PrivateKey) -> Result<Vec<u8>> {
        let muun = self.muun_key.derive_to(&self.input.address.derivation_path)?;

        let digest = SighashCache::new(self.unsigned)
            .taproot_key_spend_signature_hash(
                self.index,
                &Prevouts::All(self.prevouts),
                TapSighashType::All,
            )
            .map_err(|e| Error::Signing(format!("Failed to compute taproot sighash: {}", e)))?
            .to_byte_array();

        let muun_nonce_bytes = self
            .input
            .muun_pub_nonce
            .as_deref()
            .ok_or_else(|| Error::Signing("missing muun public nonce".to_string()))?;
        let muun_nonce = PubNonce::from_bytes(muun_nonce_bytes)
            .map_err(|e| Error::Signing(format!("Invalid muun nonce: {}", e)))?;
        let muun_partial_bytes = self
            .input
            .muun_signature
            .as_deref()
            .ok_or_else(|| Error::Signing("missing muun partial signature".to_string()))?;
        let muun_partial = PartialSignature::from_slice(muun_partial_bytes)
            .map_err(|e| Error::Signing(format!("Invalid muun partial signature: {}", e)))?;

        let session_id = self.nonces.session_id(self.index)?;
        let user_nonce = public_nonce(&session_id);
        let agg_nonce = AggNonce::sum([&user_nonce, &muun_nonce]);
        let context = musig_context(&user.public_key().point(), &muun.point())?;

        musig2::verify_partial(
            &context,
            muun_partial,
            &agg_nonce,
            to_musig_point(&muun.point())?,
            &muun_nonce,
            digest,
        )
        .map_err(|e| Error::Signing(format!("Invalid muun partial signature: {}", e)))?;

        let seckey = musig2::secp256k1::SecretKey::from_slice(&user.secret_key().secret_bytes())
            .map_err(|e| Error::Signing(format!("Invalid user key: {}", e)))?;
        let user_partial: PartialSignature =
            musig2::sign_partial(&context, seckey, secret_nonce(&session_id), &agg_nonce, digest)
                .map_err(|e| Error::Signing(format!("Failed to sign: {}", e)))?;

        let signature: LiftedSignature = musig2::aggregate_partial_signatures(
            &context,
            &agg_nonce,
            [user_partial, muun_partial],
            digest,
        )
        .map_err(|e| Error::Signing(format!("Failed to aggregate signatures: {}", e)))?;

        let mut witness = signature.serialize().to_vec();
        witness.push(TapSighashType::All as u8);
        Ok(witness)
    }

    fn submarine_swap_witness(&self, user: &PrivateKey) -> Result<Witness> {
        let swap = self
            .input
            .submarine_swap_v2
            .as_ref()
            .ok_or_else(|| {
                Error::Signing("submarine swap data is nil for swap input".to_string())
            })?;
        if swap.server_signature.is_empty() {
            return Err(Error::Signing("swap server must provide signature".to_string()));
        }

        let user_public_key = user.public_key().serialize();
        if swap.user_public_key != user_public_key {
            return Err(invalid(format!(
                "swap user key does not match the key at {}",
                self.input.address.derivation_path
            )));
        }
        let muun_public_key: [u8; 33] = swap
            .muun_public_key
            .as_slice()
            .try_into()
            .map_err(|_| invalid("swap muun key is not a compressed key".to_string()))?;

        let script = submarine_swap_v2_script(
            &swap.swap_payment_hash,
            &user_public_key,
            &muun_public_key,
            &swap.swap_server_public_key,
            swap.blocks_for_expiration,
        )?;
        let digest = p2wsh_sighash(self.unsigned, self.index, &script, self.amount())?;

        Ok(Witness::from_slice(&[
            ecdsa_signature(user, digest),
            swap.server_signature.clone(),
            script.to_bytes(),
        ]))
    }

    fn sign_incoming_swap(&self, tx: &mut Transaction) -> Result<()> {
        let swap = self
            .input
            .incoming_swap
            .as_ref()
            .ok_or_else(|| {
                Error::Signing("incoming swap data is nil for incoming swap input".to_string())
            })?;
        let secrets = swap.secrets.as_ref().ok_or_else(|| {
            Error::Signing("invoice secrets were not resolved for incoming swap input".to_string())
        })?;
        let muun_signature = self
            .input
            .muun_signature
            .as_deref()
            .ok_or_else(|| Error::Signing("missing muun signature".to_string()))?;

        let htlc = IncomingSwapHtlc {
            htlc_tx: swap.htlc_tx.clone(),
            expiration_height: swap.expiration_height,
            swap_server_public_key: swap.swap_server_public_key.clone(),
            fulfillment_fee_subsidy_sat: 0,
            fulfillment_tx: None,
        };
        let input = HtlcInput {
            htlc: &htlc,
            payment_hash: &swap.payment_hash,
            sphinx_packet: swap.sphinx.as_deref(),
            muun_signature,
            expected_msat: None,
        };
        sign_htlc_input(tx, self.index, &input, secrets, self.user_key, self.muun_key)
    }
}

fn ecdsa_signature(key: &PrivateKey, digest: [u8; 32]) -> Vec<u8> {
    ecdsa::Signature {
        signature: key.sign_ecdsa(digest),
        sighash_type: EcdsaSighashType::All,
    }
    .to_vec()
}

fn push_bytes(bytes: Vec<u8>) -> Result<PushBytesBuf> {
    PushBytesBuf::try_from(bytes).map_err(|e| Error::Signing(format!("Push too large: {}", e)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::keys::Schema;
    use crate::types::Network;
    use bitcoin::absolute::LockTime;
    use bitcoin::secp256k1::{Message, Secp256k1};
    use bitcoin::transaction::Version;
    use bitcoin::{OutPoint, Sequence, TxIn, Txid};
    use std::str::FromStr;

    pub(crate) fn keys() -> (PrivateKey, PrivateKey) {
        let base = |seed: u8| {
            PrivateKey::from_seed(&[seed; 32], Network::Regtest)
                .unwrap()
                .derive_to(&Schema::base_path())
                .unwrap()
        };
        (base(1), base(2))
    }

    pub(crate) fn address(version: AddressVersion, branch: &str) -> MuunAddress {
        let (user, muun) = keys();
        let pair = PublicKeyPair::new(user.public_key(), muun.public_key())
            .unwrap()
            .derive_to(&Schema::base_path().join(branch).unwrap())
            .unwrap();
        create_address(version, &pair).unwrap()
    }

    pub(crate) fn input(address: MuunAddress, amount: u64, vout: u32) -> Input {
        Input {
            outpoint: Outpoint {
                txid: "11".repeat(32),
                index: vout,
                amount,
            },
            address,
            user_signature: None,
            muun_signature: None,
            muun_pub_nonce: None,
            submarine_swap_v2: None,
            incoming_swap: None,
        }
    }

    /// Unsigned tx spending `inputs` to `outputs`.
    pub(crate) fn skeleton(inputs: &[Input], outputs: &[(&str, u64)]) -> String {
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs
                .iter()
                .map(|input| TxIn {
                    previous_output: OutPoint::new(
                        Txid::from_str(&input.outpoint.txid).unwrap(),
                        input.outpoint.index,
                    ),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
                .collect(),
            output: outputs
                .iter()
                .map(|(address, amount)| TxOut {
                    value: Amount::from_sat(*amount),
                    script_pubkey: parse_address(address, Network::Regtest)
                        .unwrap()
                        .script_pubkey(),
                })
                .collect(),
        };
        hex::encode(serialize(&tx))
    }

    const DESTINATION: &str = "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080";

    fn expectations(change: Option<MuunAddress>, amount: u64, fee: u64) -> SigningExpectations {
        SigningExpectations {
            destination: DESTINATION.to_string(),
            amount,
            change,
            fee,
            alternative: false,
        }
    }

    fn verify(pst: &PartiallySignedTransaction, expectations: &SigningExpectations) -> Result<()> {
        let (user, muun) = keys();
        pst.verify(expectations, &user.public_key(), &muun.public_key())
    }

    #[test]
    fn test_verify_with_change() {
        let change = address(AddressVersion::V4, "change:0/3");
        let inputs = vec![input(address(AddressVersion::V4, "external:1/0"), 100_000, 0)];
        let raw = skeleton(&inputs, &[(DESTINATION, 60_000), (&change.address, 39_000)]);
        let pst = PartiallySignedTransaction::new(&raw, inputs, MusigNonces::generate(1)).unwrap();

        verify(&pst, &expectations(Some(change.clone()), 60_000, 1_000)).unwrap();

        assert!(verify(&pst, &expectations(Some(change.clone()), 60_001, 999)).is_err());
        assert!(verify(&pst, &expectations(Some(change.clone()), 60_000, 900)).is_err());
        assert!(verify(&pst, &expectations(None, 60_000, 1_000)).is_err());

        // A change address that does not derive from our keys.
        let mut forged = change;
        forged.derivation_path = Schema::change_path().join("4").unwrap();
        assert!(matches!(
            verify(&pst, &expectations(Some(forged), 60_000, 1_000)),
            Err(Error::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_verify_without_change_limits_burned_amount() {
        let inputs = vec![input(address(AddressVersion::V4, "external:1/0"), 10_000, 0)];
        let raw = skeleton(&inputs, &[(DESTINATION, 9_000)]);
        let pst = PartiallySignedTransaction::new(&raw, inputs, MusigNonces::generate(1)).unwrap();

        verify(&pst, &expectations(None, 9_000, 1_000)).unwrap();
        // Burning 1_000 is tolerated while it stays under fee plus dust.
        verify(&pst, &expectations(None, 9_000, 455)).unwrap();
        assert!(verify(&pst, &expectations(None, 9_000, 454)).is_err());
    }

    #[test]
    fn test_verify_alternative_moves_reduction_to_fee() {
        let change = address(AddressVersion::V4, "change:0/3");
        let inputs = vec![input(address(AddressVersion::V4, "external:1/0"), 100_000, 0)];
        let raw = skeleton(&inputs, &[(DESTINATION, 59_500), (&change.address, 39_000)]);
        let pst = PartiallySignedTransaction::new(&raw, inputs, MusigNonces::generate(1)).unwrap();

        let primary = expectations(Some(change), 60_000, 1_000);
        assert!(verify(&pst, &primary).is_err());
        verify(&pst, &primary.for_alternative()).unwrap();
    }

    #[test]
    fn test_sign_multisig_versions() {
        let (user, muun) = keys();
        let v3 = address(AddressVersion::V3, "external:1/0");
        let v4 = address(AddressVersion::V4, "external:1/1");
        let v2 = address(AddressVersion::V2, "external:1/2");
        let inputs = vec![input(v3, 5_000, 0), input(v4, 6_000, 1), input(v2, 7_000, 2)];
        let raw = skeleton(&inputs, &[(DESTINATION, 17_000)]);

        let pst = PartiallySignedTransaction::new(&raw, inputs, MusigNonces::generate(3)).unwrap();
        let signed = pst.sign(&user, &muun.public_key()).unwrap();

        let tx: Transaction = deserialize(&hex::decode(&signed.hex).unwrap()).unwrap();
        assert_eq!(signed.hash, tx.compute_txid().to_string());
        assert_eq!(tx.input[0].witness.len(), 3);
        assert!(!tx.input[0].script_sig.is_empty());
        assert_eq!(tx.input[1].witness.len(), 3);
        assert!(tx.input[1].script_sig.is_empty());
        assert!(tx.input[2].witness.is_empty());
        assert!(!tx.input[2].script_sig.is_empty());
    }

    #[test]
    fn test_sign_requires_a_nonce_per_input() {
        let (user, muun) = keys();
        let inputs = vec![
            input(address(AddressVersion::V4, "external:1/0"), 5_000, 0),
            input(address(AddressVersion::V4, "external:1/1"), 5_000, 1),
        ];
        let raw = skeleton(&inputs, &[(DESTINATION, 9_000)]);
        let pst = PartiallySignedTransaction::new(&raw, inputs, MusigNonces::generate(1)).unwrap();
        assert!(matches!(
            pst.sign(&user, &muun.public_key()),
            Err(Error::Signing(_))
        ));
    }

    /// Play Muun's side of a V5 spend: partial signature and nonce for input `index`.
    pub(crate) fn muun_cosign_v5(
        raw: &str,
        inputs: &mut [Input],
        index: usize,
        user_nonces: &MusigNonces,
    ) {
        let (user, muun) = keys();
        let tx: Transaction = deserialize(&hex::decode(raw).unwrap()).unwrap();
        let prevouts: Vec<TxOut> = inputs
            .iter()
            .map(|input| TxOut {
                value: Amount::from_sat(input.outpoint.amount),
                script_pubkey: input.address.script_pubkey(Network::Regtest).unwrap(),
            })
            .collect();
        let digest = SighashCache::new(&tx)
            .taproot_key_spend_signature_hash(index, &Prevouts::All(&prevouts), TapSighashType::All)
            .unwrap()
            .to_byte_array();

        let path = &inputs[index].address.derivation_path;
        let user_key = user.derive_to(path).unwrap();
        let muun_key = muun.derive_to(path).unwrap();
        let context = musig_context(&user_key.public_key().point(), &muun_key.public_key().point())
            .unwrap();

        let muun_session = [42u8; 32];
        let muun_nonce = public_nonce(&muun_session);
        let user_nonce =
            PubNonce::from_bytes(&hex::decode(user_nonces.pubnonce_hex(index).unwrap()).unwrap())
                .unwrap();
        let agg_nonce = AggNonce::sum([&user_nonce, &muun_nonce]);
        let seckey =
            musig2::secp256k1::SecretKey::from_slice(&muun_key.secret_key().secret_bytes())
                .unwrap();
        let partial: PartialSignature =
            musig2::sign_partial(&context, seckey, secret_nonce(&muun_session), &agg_nonce, digest)
                .unwrap();

        inputs[index].muun_pub_nonce = Some(muun_nonce.serialize().to_vec());
        inputs[index].muun_signature = Some(partial.serialize().to_vec());
    }

    #[test]
    fn test_sign_v5_produces_valid_schnorr_signature() {
        let (user, muun) = keys();
        let v5 = address(AddressVersion::V5, "external:1/5");
        let mut inputs = vec![input(v5, 20_000, 0)];
        let raw = skeleton(&inputs, &[(DESTINATION, 19_000)]);
        let nonces = MusigNonces::generate(1);
        muun_cosign_v5(&raw, &mut inputs, 0, &nonces);

        let prevouts = vec![TxOut {
            value: Amount::from_sat(20_000),
            script_pubkey: inputs[0].address.script_pubkey(Network::Regtest).unwrap(),
        }];
        let pst = PartiallySignedTransaction::new(&raw, inputs, nonces).unwrap();
        let unsigned = pst.tx().clone();
        let signed = pst.sign(&user, &muun.public_key()).unwrap();

        let tx: Transaction = deserialize(&hex::decode(&signed.hex).unwrap()).unwrap();
        let witness = tx.input[0].witness.to_vec();
        assert_eq!(witness.len(), 1);
        assert_eq!(witness[0].len(), 65);
        assert_eq!(witness[0][64], 0x01);

        let digest = SighashCache::new(&unsigned)
            .taproot_key_spend_signature_hash(0, &Prevouts::All(&prevouts), TapSighashType::All)
            .unwrap();
        let output_key = bitcoin::XOnlyPublicKey::from_slice(
            &prevouts[0].script_pubkey.as_bytes()[2..34],
        )
        .unwrap();
        let signature =
            bitcoin::secp256k1::schnorr::Signature::from_slice(&witness[0][..64]).unwrap();
        Secp256k1::verification_only()
            .verify_schnorr(
                &signature,
                &Message::from_digest(digest.to_byte_array()),
                &output_key,
            )
            .unwrap();
    }

    #[test]
    fn test_sign_v5_rejects_forged_muun_partial() {
        let (user, muun) = keys();
        let v5 = address(AddressVersion::V5, "external:1/5");
        let mut inputs = vec![input(v5, 20_000, 0)];
        let raw = skeleton(&inputs, &[(DESTINATION, 19_000)]);
        let nonces = MusigNonces::generate(1);
        muun_cosign_v5(&raw, &mut inputs, 0, &nonces);
        inputs[0].muun_signature = Some(vec![1u8; 32]);

        let pst = PartiallySignedTransaction::new(&raw, inputs, nonces).unwrap();
        assert!(matches!(
            pst.sign(&user, &muun.public_key()),
            Err(Error::Signing(_))
        ));
    }
}
