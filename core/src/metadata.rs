//! Operation metadata encryption.
//!
//! Descriptions travel to the backend only as ciphertext: once to a one-time key of our own
//! so our history stays readable, and for payments to a contact once more to a one-time key
//! of theirs.
//!
//! Payload layout (base58 of):
//!
//! ```text
//! version(1) || ephemeral_pub(33) || len16 || receiver_path || len16(nonce)   <- associated data
//! nonce || AES-256-GCM(len16 || signature || len16 || payload)
//! ```

use crate::error::{Error, Result};
use crate::keys::{DerivationPath, PrivateKey, PublicKey, Schema};
use crate::operation::Operation;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use bitcoin::secp256k1::ecdh::SharedSecret;
use bitcoin::secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use bitcoin::secp256k1::{self, Message, Secp256k1, SecretKey};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;

const VERSION_V1: u8 = 1;
const VERSION_V2: u8 = 2;

const PUBLIC_KEY_LEN: usize = 33;
const NONCE_LEN: usize = 12;
const MAX_DERIVATION_PATH_LEN: usize = 1000;
const MAX_SIGNATURE_LEN: usize = 200;
/// Header byte of an uncompressed-key compact signature is `27 + recovery id`.
const COMPACT_SIGNATURE_HEADER: u8 = 27;

/// Plaintext attached to an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMetadata {
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lnurl_sender: Option<String>,
}

impl OperationMetadata {
    pub fn with_description(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }
}

/// Who we expect to have signed a payload.
#[derive(Debug, Clone)]
pub enum Sender {
    /// The payload was encrypted to ourselves; the signer is the receiver key.
    FromSelf,
    Known(secp256k1::PublicKey),
    /// Authenticity is not checked.
    Unknown,
}

/// Encrypts to a single receiver key, signing with the sender key.
pub struct Encrypter {
    receiver_key: secp256k1::PublicKey,
    receiver_path: String,
    sender_key: SecretKey,
}

impl Encrypter {
    pub fn new(receiver: &PublicKey, sender: &PrivateKey) -> Self {
        Self {
            receiver_key: receiver.point(),
            receiver_path: receiver.path().to_string(),
            sender_key: sender.secret_key(),
        }
    }

    pub fn encrypt(&self, payload: &[u8]) -> Result<String> {
        let receiver = self.receiver_key.serialize();

        let digest = signature_digest(payload, &receiver);
        let signature = Secp256k1::signing_only()
            .sign_ecdsa_recoverable(&Message::from_digest(digest), &self.sender_key);

        let mut plaintext = Vec::with_capacity(4 + 65 + payload.len());
        write_variable_bytes(&mut plaintext, &compact_signature(&signature))?;
        write_variable_bytes(&mut plaintext, payload)?;

        let ephemeral = random_secret_key();
        let ephemeral_public =
            secp256k1::PublicKey::from_secret_key(&Secp256k1::signing_only(), &ephemeral);
        let cipher = cipher(&SharedSecret::new(&self.receiver_key, &ephemeral))?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let header_len = 1 + PUBLIC_KEY_LEN + 2 + self.receiver_path.len() + 2 + NONCE_LEN;
        let mut result = Vec::with_capacity(header_len + plaintext.len() + 16);
        result.push(VERSION_V2);
        result.extend_from_slice(&ephemeral_public.serialize());
        write_variable_bytes(&mut result, self.receiver_path.as_bytes())?;
        result.extend_from_slice(&(NONCE_LEN as u16).to_be_bytes());

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: &result,
                },
            )
            .map_err(|e| Error::Encryption(format!("Failed to encrypt: {}", e)))?;

        result.extend_from_slice(&nonce);
        result.extend_from_slice(&ciphertext);
        Ok(bitcoin::base58::encode(&result))
    }
}

/// Decrypts payloads addressed to keys below `key`.
pub struct Decrypter<'a> {
    key: &'a PrivateKey,
    sender: Sender,
}

impl<'a> Decrypter<'a> {
    pub fn new(key: &'a PrivateKey, sender: Sender) -> Self {
        Self { key, sender }
    }

    pub fn decrypt(&self, payload: &str) -> Result<Vec<u8>> {
        let parsed = ParsedPayload::parse(payload)?;

        let path = DerivationPath::from_str(&parsed.receiver_path)?;
        let receiver = self.key.derive_to(&path)?;

        let ephemeral = secp256k1::PublicKey::from_slice(&parsed.ephemeral)
            .map_err(|e| Error::Encryption(format!("Invalid ephemeral key: {}", e)))?;
        let cipher = cipher(&SharedSecret::new(&ephemeral, &receiver.secret_key()))?;

        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&parsed.nonce),
                Payload {
                    msg: &parsed.ciphertext,
                    aad: &parsed.additional_data,
                },
            )
            .map_err(|_| Error::Encryption("AEAD failed".to_string()))?;

        let mut reader = Reader::new(&plaintext);
        let signature = reader.variable_bytes(MAX_SIGNATURE_LEN)?;
        let data = reader.variable_bytes(reader.remaining())?;

        let receiver_public = receiver.public_key();
        let digest = signature_digest(data, &receiver_public.serialize());
        let signer = recover_signer(signature, digest)?;

        let expected = match &self.sender {
            Sender::FromSelf => Some(receiver_public.point()),
            Sender::Known(key) => Some(*key),
            Sender::Unknown => None,
        };
        if expected.is_some_and(|expected| expected != signer) {
            return Err(Error::Encryption("signing key mismatch".to_string()));
        }

        Ok(data.to_vec())
    }
}

/// One-time key of our own to encrypt metadata to, two random levels below the metadata branch.
pub fn self_metadata_key(user_key: &PrivateKey) -> Result<PrivateKey> {
    let branch = user_key.derive_to(&Schema::metadata_path())?;
    let (first, _) = branch.derive_next_valid_child(random_index())?;
    let (key, _) = first.derive_next_valid_child(random_index())?;
    Ok(key)
}

/// One-time key below a contact's published key.
pub fn contact_metadata_key(contact_key: &PublicKey) -> Result<PublicKey> {
    let (first, _) = contact_key.derive_next_valid_child(random_index())?;
    let (key, _) = first.derive_next_valid_child(random_index())?;
    Ok(key)
}

/// Encrypt `metadata` so that only we can read it later. `user_key` is the base key.
pub fn encrypt_for_self(metadata: &OperationMetadata, user_key: &PrivateKey) -> Result<String> {
    let key = self_metadata_key(user_key)?;
    Encrypter::new(&key.public_key(), &key).encrypt(&serde_json::to_vec(metadata)?)
}

/// Encrypt `metadata` to a contact, signed with our base key.
pub fn encrypt_for_contact(
    metadata: &OperationMetadata,
    user_key: &PrivateKey,
    contact_key: &PublicKey,
) -> Result<String> {
    let key = contact_metadata_key(contact_key)?;
    Encrypter::new(&key, user_key).encrypt(&serde_json::to_vec(metadata)?)
}

/// Readable metadata for `operation`.
///
/// Receiver metadata is tried before sender metadata. Operations from before metadata was
/// encrypted fall back to their plain description.
pub fn decrypt_operation_metadata(
    operation: &Operation,
    user_key: &PrivateKey,
) -> Option<OperationMetadata> {
    let candidates = [
        (operation.receiver_metadata.as_deref(), Sender::Unknown),
        (operation.sender_metadata.as_deref(), Sender::FromSelf),
    ];

    for (payload, sender) in candidates {
        let Some(payload) = payload else { continue };
        let decrypted = Decrypter::new(user_key, sender)
            .decrypt(payload)
            .and_then(|data| Ok(serde_json::from_slice::<OperationMetadata>(&data)?));
        match decrypted {
            Ok(metadata) => return Some(metadata),
            Err(e) => log::warn!(
                "Failed to decrypt metadata of operation {:?}: {}",
                operation.hid,
                e
            ),
        }
    }

    operation
        .description
        .as_ref()
        .map(|description| OperationMetadata::with_description(description.clone()))
}

struct ParsedPayload {
    ephemeral: Vec<u8>,
    receiver_path: String,
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
    additional_data: Vec<u8>,
}

impl ParsedPayload {
    fn parse(payload: &str) -> Result<Self> {
        let decoded = bitcoin::base58::decode(payload)
            .map_err(|e| Error::Encryption(format!("Invalid base58 payload: {}", e)))?;
        let mut reader = Reader::new(&decoded);

        let version = reader.bytes(1)?[0];
        if version != VERSION_V1 && version != VERSION_V2 {
            return Err(Error::Encryption(format!("found key version {}", version)));
        }

        let ephemeral = reader.bytes(PUBLIC_KEY_LEN)?.to_vec();
        let receiver_path =
            String::from_utf8(reader.variable_bytes(MAX_DERIVATION_PATH_LEN)?.to_vec())
                .map_err(|e| Error::Encryption(format!("Invalid receiver path: {}", e)))?;

        let additional_data_len = reader.position() + 2;
        // At least an empty signature and no payload must follow the nonce.
        let nonce = reader.variable_bytes(reader.remaining().saturating_sub(4))?.to_vec();
        if nonce.len() != NONCE_LEN {
            return Err(Error::Encryption(format!("unsupported nonce length {}", nonce.len())));
        }

        let ciphertext = reader.bytes(reader.remaining())?.to_vec();

        Ok(Self {
            ephemeral,
            receiver_path,
            nonce,
            ciphertext,
            additional_data: decoded[..additional_data_len].to_vec(),
        })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    fn position(&self) -> usize {
        self.position
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::Encryption("payload is truncated".to_string()));
        }
        let bytes = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(bytes)
    }

    fn variable_bytes(&mut self, max_len: usize) -> Result<&'a [u8]> {
        let len_bytes = self.bytes(2)?;
        let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        if len > max_len {
            return Err(Error::Encryption(format!(
                "length {} exceeds maximum {}",
                len, max_len
            )));
        }
        self.bytes(len)
    }
}

fn write_variable_bytes(out: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len())
        .map_err(|_| Error::Encryption(format!("field of {} bytes is too long", data.len())))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    Ok(())
}

fn signature_digest(payload: &[u8], receiver: &[u8; PUBLIC_KEY_LEN]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(receiver);
    hasher.finalize().into()
}

fn compact_signature(signature: &RecoverableSignature) -> [u8; 65] {
    let (recovery_id, bytes) = signature.serialize_compact();
    let mut out = [0u8; 65];
    out[0] = COMPACT_SIGNATURE_HEADER + recovery_id.to_i32() as u8;
    out[1..].copy_from_slice(&bytes);
    out
}

fn recover_signer(signature: &[u8], digest: [u8; 32]) -> Result<secp256k1::PublicKey> {
    if signature.len() != 65 || !(27..=34).contains(&signature[0]) {
        return Err(Error::Encryption("malformed signature".to_string()));
    }
    let recovery_id = RecoveryId::from_i32(((signature[0] - COMPACT_SIGNATURE_HEADER) & 3) as i32)
        .map_err(|e| Error::Encryption(format!("Invalid recovery id: {}", e)))?;
    let signature = RecoverableSignature::from_compact(&signature[1..], recovery_id)
        .map_err(|e| Error::Encryption(format!("Invalid signature: {}", e)))?;
    Secp256k1::verification_only()
        .recover_ecdsa(&Message::from_digest(digest), &signature)
        .map_err(|e| Error::Encryption(format!("failed to verify signature: {}", e)))
}

fn cipher(shared: &SharedSecret) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(&shared.secret_bytes())
        .map_err(|e| Error::Encryption(format!("Invalid key: {}", e)))
}

fn random_secret_key() -> SecretKey {
    let mut rng = rand::thread_rng();
    loop {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        if let Ok(key) = SecretKey::from_slice(&bytes) {
            return key;
        }
    }
}

fn random_index() -> u32 {
    rand::thread_rng().gen_range(0..(1u32 << 31))
}
