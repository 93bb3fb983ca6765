//! Address versions and the scripts behind them.
//!
//! Every version is a function of the user/Muun key pair at a path: V1 uses only the user
//! key, V2 to V4 wrap the same 2-of-2 multisig script differently, and V5 is a taproot
//! key-path output whose key is the MuSig2 aggregate of both keys.

use crate::error::{Error, Result};
use crate::keys::{DerivationPath, PublicKeyPair};
use crate::types::Network;
use bitcoin::key::TweakedPublicKey;
use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_PUSHNUM_2};
use bitcoin::script::Builder;
use bitcoin::secp256k1::{self, XOnlyPublicKey};
use bitcoin::{Address, CompressedPublicKey, ScriptBuf};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Script versions known to the wallet.
///
/// Serialized as the integer code the backend uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum AddressVersion {
    /// P2PKH of the user key.
    V1,
    /// P2SH 2-of-2 multisig.
    V2,
    /// P2SH-P2WSH 2-of-2 multisig.
    V3,
    /// P2WSH 2-of-2 multisig.
    V4,
    /// P2TR key-path spend by the MuSig2 aggregate of user and Muun.
    V5,
    /// Outgoing submarine swap funding output.
    SubmarineSwapV2,
    /// Incoming swap HTLC output.
    IncomingSwap,
}

impl AddressVersion {
    pub fn code(self) -> u32 {
        match self {
            AddressVersion::V1 => 1,
            AddressVersion::V2 => 2,
            AddressVersion::V3 => 3,
            AddressVersion::V4 => 4,
            AddressVersion::V5 => 5,
            AddressVersion::SubmarineSwapV2 => 102,
            AddressVersion::IncomingSwap => 201,
        }
    }

    /// Whether spending requires a MuSig2 nonce.
    pub fn needs_nonce(self) -> bool {
        matches!(self, AddressVersion::V5)
    }
}

impl TryFrom<u32> for AddressVersion {
    type Error = Error;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            1 => Ok(AddressVersion::V1),
            2 => Ok(AddressVersion::V2),
            3 => Ok(AddressVersion::V3),
            4 => Ok(AddressVersion::V4),
            5 => Ok(AddressVersion::V5),
            102 => Ok(AddressVersion::SubmarineSwapV2),
            201 => Ok(AddressVersion::IncomingSwap),
            other => Err(Error::Parse(format!("Unknown address version: {}", other))),
        }
    }
}

impl From<AddressVersion> for u32 {
    fn from(version: AddressVersion) -> Self {
        version.code()
    }
}

impl std::fmt::Display for AddressVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.code())
    }
}

/// An address together with how it was derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MuunAddress {
    pub version: AddressVersion,
    pub derivation_path: DerivationPath,
    pub address: String,
}

impl MuunAddress {
    /// Parse the address for `network`.
    pub fn parse(&self, network: Network) -> Result<Address> {
        parse_address(&self.address, network)
    }

    pub fn script_pubkey(&self, network: Network) -> Result<ScriptBuf> {
        Ok(self.parse(network)?.script_pubkey())
    }
}

/// Build the address of `version` for the pair at its path.
///
/// Swap versions need keys from outside the pair and are built by the swap module.
pub fn create_address(version: AddressVersion, pair: &PublicKeyPair) -> Result<MuunAddress> {
    let network = pair.network().to_bitcoin_network();
    let user = compressed(pair.user().point());
    let muun = compressed(pair.muun().point());

    let address = match version {
        AddressVersion::V1 => Address::p2pkh(user.pubkey_hash(), network),
        AddressVersion::V2 => Address::p2sh(&multisig_script(&user, &muun), network)
            .map_err(|e| Error::Bitcoin(format!("Failed to build P2SH address: {}", e)))?,
        AddressVersion::V3 => Address::p2shwsh(&multisig_script(&user, &muun), network),
        AddressVersion::V4 => Address::p2wsh(&multisig_script(&user, &muun), network),
        AddressVersion::V5 => {
            let output_key = musig_output_key(&pair.user().point(), &pair.muun().point())?;
            Address::p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(output_key), network)
        }
        AddressVersion::SubmarineSwapV2 | AddressVersion::IncomingSwap => {
            return Err(Error::Bitcoin(format!(
                "address {} cannot be built from a key pair",
                version
            )));
        }
    };

    Ok(MuunAddress {
        version,
        derivation_path: pair.path().clone(),
        address: address.to_string(),
    })
}

/// `OP_2 <user> <muun> OP_2 OP_CHECKMULTISIG`
pub fn multisig_script(user: &CompressedPublicKey, muun: &CompressedPublicKey) -> ScriptBuf {
    Builder::new()
        .push_opcode(OP_PUSHNUM_2)
        .push_slice(user.to_bytes())
        .push_slice(muun.to_bytes())
        .push_opcode(OP_PUSHNUM_2)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

/// Key aggregation context for a V5 output, with the unspendable taproot tweak applied.
pub(crate) fn musig_context(
    user: &secp256k1::PublicKey,
    muun: &secp256k1::PublicKey,
) -> Result<musig2::KeyAggContext> {
    let user = to_musig_point(user)?;
    let muun = to_musig_point(muun)?;
    musig2::KeyAggContext::new(vec![user, muun])
        .map_err(|e| Error::Signing(format!("Failed to aggregate keys: {}", e)))?
        .with_unspendable_taproot_tweak()
        .map_err(|e| Error::Signing(format!("Failed to tweak aggregate key: {}", e)))
}

pub(crate) fn to_musig_point(key: &secp256k1::PublicKey) -> Result<musig2::secp256k1::PublicKey> {
    musig2::secp256k1::PublicKey::from_slice(&key.serialize())
        .map_err(|e| Error::Signing(format!("Invalid public key: {}", e)))
}

fn musig_output_key(
    user: &secp256k1::PublicKey,
    muun: &secp256k1::PublicKey,
) -> Result<XOnlyPublicKey> {
    let aggregated: musig2::secp256k1::PublicKey = musig_context(user, muun)?.aggregated_pubkey();
    let (xonly, _) = aggregated.x_only_public_key();
    XOnlyPublicKey::from_slice(&xonly.serialize())
        .map_err(|e| Error::Signing(format!("Invalid aggregate key: {}", e)))
}

pub(crate) fn compressed(key: secp256k1::PublicKey) -> CompressedPublicKey {
    CompressedPublicKey(key)
}

/// Parse `address` and check that it belongs to `network`.
pub fn parse_address(address: &str, network: Network) -> Result<Address> {
    Address::from_str(address)
        .map_err(|e| Error::Parse(format!("Invalid address {}: {}", address, e)))?
        .require_network(network.to_bitcoin_network())
        .map_err(|e| Error::Parse(format!("Address {} on wrong network: {}", address, e)))
}
