//! Fee rates, fee bump functions, the on-chain fee calculator and swap fee math.

use crate::size_vector::{NextTransactionSize, UtxoStatus};
use crate::types::DUST_THRESHOLD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Recommended fee rates by confirmation target, as fetched from the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeWindow {
    pub id: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub fetch_date: time::OffsetDateTime,
    /// Confirmation target in blocks to fee rate in sat/vbyte.
    pub targeted_fees: BTreeMap<u32, f64>,
    pub fast_conf_target: u32,
    pub medium_conf_target: u32,
    pub slow_conf_target: u32,
}

impl FeeWindow {
    /// Fee rate for the closest target at or below `target`.
    ///
    /// When no such target has data, falls back to the lowest target's rate.
    pub fn fee_rate_for_target(&self, target: u32) -> f64 {
        if let Some((_, rate)) = self.targeted_fees.range(..=target).next_back() {
            return *rate;
        }
        self.targeted_fees
            .values()
            .next()
            .copied()
            .unwrap_or_default()
    }

    pub fn fast_fee_rate(&self) -> f64 {
        self.fee_rate_for_target(self.fast_conf_target)
    }

    pub fn medium_fee_rate(&self) -> f64 {
        self.fee_rate_for_target(self.medium_conf_target)
    }

    pub fn slow_fee_rate(&self) -> f64 {
        self.fee_rate_for_target(self.slow_conf_target)
    }

    /// Smallest recommended rate.
    pub fn minimum_fee_rate(&self) -> f64 {
        self.targeted_fees
            .values()
            .copied()
            .fold(None, |min: Option<f64>, rate| {
                Some(min.map_or(rate, |m| m.min(rate)))
            })
            .unwrap_or_default()
    }

    /// Rate used for a swap funding transaction.
    ///
    /// 0-conf swaps can use the medium target. Swaps that need a confirmation before the
    /// server pays want it fast.
    pub fn swap_fee_rate(&self, confirmations_needed: u32) -> f64 {
        if confirmations_needed == 0 {
            self.medium_fee_rate()
        } else {
            self.fast_fee_rate()
        }
    }
}

/// `slope * x + intercept` for `x` in `[left_closed_endpoint, right_open_endpoint)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialLinearFunction {
    pub left_closed_endpoint: f64,
    #[serde(with = "endpoint")]
    pub right_open_endpoint: f64,
    pub slope: f64,
    pub intercept: f64,
}

impl PartialLinearFunction {
    pub fn contains(&self, x: f64) -> bool {
        self.left_closed_endpoint <= x && x < self.right_open_endpoint
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Extra fee needed to bump the unconfirmed ancestors of a spend, as a function of the
/// fee rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeBumpFunction {
    pub partial_linear_functions: Vec<PartialLinearFunction>,
}

impl FeeBumpFunction {
    pub fn new(partial_linear_functions: Vec<PartialLinearFunction>) -> Self {
        Self {
            partial_linear_functions,
        }
    }

    /// Bump in satoshis at `fee_rate`, or `None` if no interval contains it.
    pub fn bump_at(&self, fee_rate: f64) -> Option<u64> {
        self.partial_linear_functions
            .iter()
            .find(|piece| piece.contains(fee_rate))
            .map(|piece| ceil_sats(piece.evaluate(fee_rate)))
    }
}

/// The right endpoint is `+inf` for the last interval. JSON has no infinity, so it is
/// written as `null` and read from `null`, `"Infinity"` or a number.
mod endpoint {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(f64::INFINITY),
            Some(Raw::Number(n)) => Ok(n),
            Some(Raw::Text(t)) if t.eq_ignore_ascii_case("infinity") => Ok(f64::INFINITY),
            Some(Raw::Text(t)) => Err(serde::de::Error::custom(format!(
                "invalid endpoint: {}",
                t
            ))),
        }
    }
}

/// Fee for a given output amount, with its bump share.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeeEstimate {
    /// Total fee, including the bump.
    pub fee: u64,
    pub fee_bump: u64,
}

/// On-chain fee for spending from the size progression.
pub struct FeeCalculator<'a> {
    nts: &'a NextTransactionSize,
    fee_bump_functions: &'a [FeeBumpFunction],
}

impl<'a> FeeCalculator<'a> {
    pub fn new(nts: &'a NextTransactionSize, fee_bump_functions: &'a [FeeBumpFunction]) -> Self {
        Self {
            nts,
            fee_bump_functions,
        }
    }

    /// Fee for sending `amount` at `fee_rate` sat/vbyte.
    ///
    /// Picks the first progression entry that covers the amount (and the fee, unless the
    /// fee is taken from the amount). If none does, the last entry is used, so the caller
    /// must check the balance separately.
    pub fn fee(&self, amount: u64, fee_rate: f64, take_fee_from_amount: bool) -> FeeEstimate {
        let progression = &self.nts.size_progression;
        if amount == 0 || progression.is_empty() {
            return FeeEstimate::default();
        }

        for (index, entry) in progression.iter().enumerate() {
            let estimate = self.fee_for_entry(index, fee_rate);
            let covered = if take_fee_from_amount {
                amount <= entry.amount_in_satoshis
            } else {
                amount.saturating_add(estimate.fee) <= entry.amount_in_satoshis
            };
            if covered {
                return estimate;
            }
        }

        self.fee_for_entry(progression.len() - 1, fee_rate)
    }

    fn fee_for_entry(&self, index: usize, fee_rate: f64) -> FeeEstimate {
        let entry = &self.nts.size_progression[index];
        let fee_bump = self.fee_bump(index, fee_rate);
        FeeEstimate {
            fee: ceil_sats(entry.size_in_vbytes as f64 * fee_rate) + fee_bump,
            fee_bump,
        }
    }

    /// Bump for spending entries `0..=index`, picked by how many of them are unconfirmed.
    fn fee_bump(&self, index: usize, fee_rate: f64) -> u64 {
        if self.fee_bump_functions.is_empty() {
            return 0;
        }

        let unconfirmed = self.nts.size_progression[..=index]
            .iter()
            .filter(|entry| entry.utxo_status == UtxoStatus::Unconfirmed)
            .count();
        if unconfirmed == 0 {
            return 0;
        }

        let function = &self.fee_bump_functions[unconfirmed.min(self.fee_bump_functions.len()) - 1];
        match function.bump_at(fee_rate) {
            Some(bump) => bump,
            None => {
                log::warn!("No fee bump interval contains fee rate {}", fee_rate);
                0
            }
        }
    }
}

fn ceil_sats(value: f64) -> u64 {
    if value <= 0.0 {
        return 0;
    }
    value.ceil() as u64
}

/// Debt arrangement for a submarine swap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DebtType {
    /// No debt involved.
    #[default]
    None,
    /// The server pays with its own channel capacity; the user owes the amount.
    Lend,
    /// The funding output also settles pre-existing debt.
    Collect,
}

/// Fee policy of a possible Lightning route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BestRouteFees {
    /// Largest amount this route can carry.
    pub max_capacity: u64,
    pub fee_proportional_millionth: u64,
    pub fee_base: u64,
}

impl BestRouteFees {
    pub fn for_amount(&self, amount: u64) -> u64 {
        self.fee_proportional_millionth * amount / 1_000_000 + self.fee_base
    }
}

/// Lightning fee for `amount`: the first route with enough capacity, else the last one.
pub fn lightning_fee(amount: u64, routes: &[BestRouteFees]) -> u64 {
    routes
        .iter()
        .find(|route| amount <= route.max_capacity)
        .or_else(|| routes.last())
        .map(|route| route.for_amount(amount))
        .unwrap_or(0)
}

/// Swap server policies that shape the funding output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingOutputPolicies {
    /// Most debt the server will lend this user.
    pub maximum_debt: u64,
    /// Debt that can be collected with this swap.
    pub potential_collect: u64,
    /// Largest amount the server accepts with 0 confirmations.
    pub max_amount_for_0_conf: u64,
}

impl FundingOutputPolicies {
    pub fn funding_confirmations(&self, amount: u64, lightning_fee: u64) -> u32 {
        if amount + lightning_fee <= self.max_amount_for_0_conf {
            0
        } else {
            1
        }
    }

    pub fn debt_type(&self, amount: u64, lightning_fee: u64) -> DebtType {
        let confirmations = self.funding_confirmations(amount, lightning_fee);
        if confirmations == 0 && amount + lightning_fee <= self.maximum_debt {
            return DebtType::Lend;
        }
        if self.potential_collect > 0 {
            return DebtType::Collect;
        }
        DebtType::None
    }

    pub fn debt_amount(&self, amount: u64, lightning_fee: u64) -> u64 {
        match self.debt_type(amount, lightning_fee) {
            DebtType::Lend => amount + lightning_fee,
            DebtType::Collect => self.potential_collect,
            DebtType::None => 0,
        }
    }

    pub fn min_funding_amount(&self, amount: u64, lightning_fee: u64) -> u64 {
        let mut input = amount + lightning_fee;
        if self.debt_type(amount, lightning_fee) == DebtType::Collect {
            input += self.debt_amount(amount, lightning_fee);
        }
        input
    }

    pub fn funding_output_amount(&self, amount: u64, lightning_fee: u64) -> u64 {
        self.min_funding_amount(amount, lightning_fee)
            .max(DUST_THRESHOLD)
    }

    pub fn funding_output_padding(&self, amount: u64, lightning_fee: u64) -> u64 {
        self.funding_output_amount(amount, lightning_fee)
            - self.min_funding_amount(amount, lightning_fee)
    }
}

/// Everything a swap costs besides the on-chain fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapFees {
    pub routing_fee: u64,
    pub debt_type: DebtType,
    pub debt_amount: u64,
    /// On-chain funding output. 0 for LEND swaps, which have none.
    pub output_amount: u64,
    pub output_padding: u64,
    pub confirmations_needed: u32,
}

/// Swap fees for paying `amount` over `routes` under `policies`.
///
/// Swaps that take the fee from the amount cannot borrow.
pub fn compute_swap_fees(
    amount: u64,
    routes: &[BestRouteFees],
    policies: &FundingOutputPolicies,
    take_fee_from_amount: bool,
) -> SwapFees {
    let policies = if take_fee_from_amount {
        FundingOutputPolicies {
            maximum_debt: 0,
            ..*policies
        }
    } else {
        *policies
    };

    let routing_fee = lightning_fee(amount, routes);
    let output_padding = policies.funding_output_padding(amount, routing_fee);
    let debt_type = policies.debt_type(amount, routing_fee);
    let debt_amount = policies.debt_amount(amount, routing_fee);

    let output_amount = match debt_type {
        DebtType::Lend => 0,
        DebtType::Collect => amount + routing_fee + output_padding + debt_amount,
        DebtType::None => amount + routing_fee + output_padding,
    };

    SwapFees {
        routing_fee,
        debt_type,
        debt_amount,
        output_amount,
        output_padding,
        confirmations_needed: policies.funding_confirmations(amount, routing_fee),
    }
}
