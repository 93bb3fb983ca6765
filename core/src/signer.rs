//! Transaction signing.
//!
//! The backend builds every transaction skeleton. Before anything is signed the skeleton is
//! checked against what the user agreed to pay, and each MuSig2 session is used once.

mod nonces;
mod pst;

pub use nonces::{MusigNonces, NonceBundle};
pub use pst::{
    Input, InputIncomingSwap, InputSubmarineSwapV2, Outpoint, PartiallySignedTransaction,
    SignedTransaction, SigningExpectations,
};

use crate::error::{Error, Result};
use crate::keys::{PrivateKey, PublicKey};

/// The primary transaction plus any fee-bumped alternatives the backend prepared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransactions {
    pub primary: SignedTransaction,
    pub alternatives: Vec<SignedTransaction>,
}

/// Verify and sign the primary transaction and then each alternative.
///
/// Alternatives are verified with relaxed expectations: they may pay less to the
/// destination as long as the difference goes to fee.
pub fn sign_with_alternatives(
    primary: PartiallySignedTransaction,
    alternatives: Vec<PartiallySignedTransaction>,
    expectations: &SigningExpectations,
    user_key: &PrivateKey,
    muun_key: &PublicKey,
) -> Result<SignedTransactions> {
    let user_public_key = user_key.public_key();

    primary.verify(expectations, &user_public_key, muun_key)?;
    let primary = primary.sign(user_key, muun_key)?;

    let alternative_expectations = expectations.for_alternative();
    let alternatives = alternatives
        .into_iter()
        .enumerate()
        .map(|(i, alternative)| {
            alternative
                .verify(&alternative_expectations, &user_public_key, muun_key)
                .map_err(|e| {
                    Error::InvalidTransaction(format!("alternative {} rejected: {}", i, e))
                })?;
            alternative.sign(user_key, muun_key)
        })
        .collect::<Result<Vec<_>>>()?;

    log::info!(
        "Signed transaction {} with {} alternatives",
        primary.hash,
        alternatives.len()
    );

    Ok(SignedTransactions {
        primary,
        alternatives,
    })
}

#[cfg(test)]
mod tests {
    use super::pst::tests::{address, input, keys, skeleton};
    use super::*;
    use crate::address::AddressVersion;

    const DESTINATION: &str = "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080";

    #[test]
    fn test_sign_primary_and_alternatives() {
        let (user, muun) = keys();
        let change = address(AddressVersion::V4, "change:0/1");
        let inputs = vec![input(address(AddressVersion::V4, "external:1/0"), 50_000, 0)];

        let bundle = NonceBundle::generate(1, 2);
        let primary_raw = skeleton(&inputs, &[(DESTINATION, 30_000), (&change.address, 19_000)]);
        let bumped_raw = skeleton(&inputs, &[(DESTINATION, 29_000), (&change.address, 19_000)]);
        let drained_raw = skeleton(&inputs, &[(&change.address, 19_000)]);

        let NonceBundle {
            primary: primary_nonces,
            alternatives: alternative_nonces,
        } = bundle;
        let primary =
            PartiallySignedTransaction::new(&primary_raw, inputs.clone(), primary_nonces).unwrap();
        let alternatives = [bumped_raw, drained_raw]
            .iter()
            .zip(alternative_nonces)
            .map(|(raw, nonces)| {
                PartiallySignedTransaction::new(raw, inputs.clone(), nonces).unwrap()
            })
            .collect();

        let expectations = SigningExpectations {
            destination: DESTINATION.to_string(),
            amount: 30_000,
            change: Some(change),
            fee: 1_000,
            alternative: false,
        };

        let signed =
            sign_with_alternatives(primary, alternatives, &expectations, &user, &muun.public_key())
                .unwrap();
        assert_eq!(signed.alternatives.len(), 2);
        assert_ne!(signed.primary.hash, signed.alternatives[0].hash);
    }

    #[test]
    fn test_alternative_paying_more_is_rejected() {
        let (user, muun) = keys();
        let inputs = vec![input(address(AddressVersion::V4, "external:1/0"), 50_000, 0)];
        let primary_raw = skeleton(&inputs, &[(DESTINATION, 49_000)]);
        let greedy_raw = skeleton(&inputs, &[(DESTINATION, 49_500)]);

        let primary =
            PartiallySignedTransaction::new(&primary_raw, inputs.clone(), MusigNonces::generate(1))
                .unwrap();
        let greedy =
            PartiallySignedTransaction::new(&greedy_raw, inputs, MusigNonces::generate(1)).unwrap();

        let expectations = SigningExpectations {
            destination: DESTINATION.to_string(),
            amount: 49_000,
            change: None,
            fee: 1_000,
            alternative: false,
        };
        let result =
            sign_with_alternatives(primary, vec![greedy], &expectations, &user, &muun.public_key());
        assert!(matches!(result, Err(Error::InvalidTransaction(_))));
    }
}
