//! Lightning swaps.
//!
//! Outgoing payments are submarine swaps: the wallet funds an on-chain output the swap
//! server can claim once it has paid the invoice. Incoming payments arrive as an HTLC the
//! wallet fulfills with the preimage it generated for its own invoice.

mod incoming;
pub mod sphinx;
mod submarine;

pub use incoming::{
    FulfillmentData, FulfillmentResult, IncomingSwap, IncomingSwapHtlc, IncomingSwapState,
    htlc_script,
};
pub(crate) use incoming::{HtlcInput, p2wsh_sighash, sign_htlc_input};
pub use submarine::{
    SWAP_EXPIRATION_IN_BLOCKS, SubmarineSwap, SubmarineSwapFees, SwapEvent, SwapFundingOutput,
    SwapReceiver, SwapState, submarine_swap_v2_script,
};

use bitcoin::hashes::{Hash, hash160, ripemd160};

pub(crate) fn ripemd160(data: &[u8]) -> [u8; 20] {
    ripemd160::Hash::hash(data).to_byte_array()
}

pub(crate) fn hash160(data: &[u8]) -> [u8; 20] {
    hash160::Hash::hash(data).to_byte_array()
}
