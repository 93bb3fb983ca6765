use crate::error::{Error, Result};
use musig2::{PubNonce, SecNonce};
use rand::RngCore;

/// Single-use MuSig2 session ids and the public nonces derived from them.
///
/// The secret nonce is rebuilt from the session id at signing time, so only the 32-byte id
/// has to be kept between submitting the operation and signing it. Reusing a session id
/// for two signatures leaks the private key, so the set moves into the transaction it signs
/// and cannot be used again:
///
/// ```compile_fail
/// use muun_wallet_core::signer::{MusigNonces, PartiallySignedTransaction};
///
/// let nonces = MusigNonces::generate(1);
/// let first = PartiallySignedTransaction::new("", vec![], nonces);
/// let second = PartiallySignedTransaction::new("", vec![], nonces);
/// ```
pub struct MusigNonces {
    session_ids: Vec<[u8; 32]>,
    public_nonces: Vec<[u8; 66]>,
}

impl MusigNonces {
    /// Generate `count` fresh nonces.
    pub fn generate(count: usize) -> Self {
        let mut rng = rand::thread_rng();
        let session_ids: Vec<[u8; 32]> = (0..count)
            .map(|_| {
                let mut id = [0u8; 32];
                rng.fill_bytes(&mut id);
                id
            })
            .collect();
        let public_nonces = session_ids
            .iter()
            .map(|id| public_nonce(id).serialize())
            .collect();

        Self {
            session_ids,
            public_nonces,
        }
    }

    pub fn len(&self) -> usize {
        self.session_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.session_ids.is_empty()
    }

    pub fn pubnonce_hex(&self, index: usize) -> Result<String> {
        self.public_nonces
            .get(index)
            .map(hex::encode)
            .ok_or_else(|| Error::Signing("not enough nonces".to_string()))
    }

    /// All public nonces, hex-encoded, in input order.
    pub fn public_nonces_hex(&self) -> Vec<String> {
        self.public_nonces.iter().map(hex::encode).collect()
    }

    pub(crate) fn session_id(&self, index: usize) -> Result<[u8; 32]> {
        self.session_ids
            .get(index)
            .copied()
            .ok_or_else(|| Error::Signing("not enough nonces".to_string()))
    }
}

impl std::fmt::Debug for MusigNonces {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MusigNonces")
            .field("count", &self.session_ids.len())
            .finish()
    }
}

/// The nonces for one submission: a primary set plus one set per alternative transaction.
///
/// Signing consumes the bundle, so the same session ids cannot sign twice. Nor can the
/// bundle be copied to sign with later:
///
/// ```compile_fail
/// use muun_wallet_core::signer::NonceBundle;
///
/// let bundle = NonceBundle::generate(1, 0);
/// let kept = bundle.clone();
/// ```
#[derive(Debug)]
pub struct NonceBundle {
    pub primary: MusigNonces,
    pub alternatives: Vec<MusigNonces>,
}

impl NonceBundle {
    /// Sets for `inputs` inputs, with `alternatives` extra sets.
    pub fn generate(inputs: usize, alternatives: usize) -> Self {
        Self {
            primary: MusigNonces::generate(inputs),
            alternatives: (0..alternatives)
                .map(|_| MusigNonces::generate(inputs))
                .collect(),
        }
    }

    pub fn primary_hex(&self) -> Vec<String> {
        self.primary.public_nonces_hex()
    }

    pub fn alternatives_hex(&self) -> Vec<Vec<String>> {
        self.alternatives
            .iter()
            .map(MusigNonces::public_nonces_hex)
            .collect()
    }
}

/// Deterministic BIP327 nonce seeded only by the session id.
pub(crate) fn secret_nonce(session_id: &[u8; 32]) -> SecNonce {
    SecNonce::build(*session_id).build()
}

pub(crate) fn public_nonce(session_id: &[u8; 32]) -> PubNonce {
    secret_nonce(session_id).public_nonce()
}
