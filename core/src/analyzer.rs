//! Decides whether a payment can be made and what it costs.
//!
//! Payments that cannot be made are reported through [`AnalysisStatus`]. `Err` is reserved
//! for inputs that should never reach the analyzer, such as a take-fee-from-amount payment
//! that does not spend the whole balance.

use crate::error::{Error, Result};
use crate::fees::{
    BestRouteFees, DebtType, FeeBumpFunction, FeeCalculator, FeeWindow, FundingOutputPolicies,
    SwapFees, compute_swap_fees,
};
use crate::size_vector::NextTransactionSize;
use crate::types::DUST_THRESHOLD;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisStatus {
    Ok,
    AmountGreaterThanBalance,
    AmountTooSmall,
    /// The amount is within balance but the fees are not. May be fixed with a lower fee rate.
    Unpayable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAnalysis {
    pub status: AnalysisStatus,
    /// What the receiver gets.
    pub amount: u64,
    /// On-chain fee, bump included.
    pub fee_total: u64,
    pub fee_bump: u64,
    pub swap_fees: Option<SwapFees>,
    /// What leaves the user's balance.
    pub total: u64,
}

impl PaymentAnalysis {
    fn with_status(status: AnalysisStatus) -> Self {
        Self {
            status,
            amount: 0,
            fee_total: 0,
            fee_bump: 0,
            swap_fees: None,
            total: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == AnalysisStatus::Ok
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentToInvoice {
    pub take_fee_from_amount: bool,
    pub amount: u64,
    /// Quoted by the swap server when the invoice carries an amount.
    pub swap_fees: Option<SwapFees>,
    /// Present for amountless invoices, where fees are computed locally.
    pub best_route_fees: Option<Vec<BestRouteFees>>,
    pub funding_output_policies: Option<FundingOutputPolicies>,
}

pub struct PaymentAnalyzer<'a> {
    fee_window: &'a FeeWindow,
    nts: &'a NextTransactionSize,
    calculator: FeeCalculator<'a>,
}

struct SwapParams {
    amount: u64,
    routing_fee: u64,
    on_chain_fee: u64,
    on_chain_fee_bump: u64,
}

impl<'a> PaymentAnalyzer<'a> {
    pub fn new(
        fee_window: &'a FeeWindow,
        nts: &'a NextTransactionSize,
        fee_bump_functions: &'a [FeeBumpFunction],
    ) -> Self {
        Self {
            fee_window,
            nts,
            calculator: FeeCalculator::new(nts, fee_bump_functions),
        }
    }

    fn total_balance(&self) -> u64 {
        self.nts.total_balance()
    }

    fn utxo_balance(&self) -> u64 {
        self.nts.utxo_balance()
    }

    pub fn to_address(
        &self,
        amount: u64,
        fee_rate: f64,
        take_fee_from_amount: bool,
    ) -> Result<PaymentAnalysis> {
        if amount < DUST_THRESHOLD {
            return Ok(PaymentAnalysis::with_status(AnalysisStatus::AmountTooSmall));
        }
        if amount > self.total_balance() {
            return Ok(PaymentAnalysis {
                total: amount,
                ..PaymentAnalysis::with_status(AnalysisStatus::AmountGreaterThanBalance)
            });
        }
        if take_fee_from_amount && amount != self.total_balance() {
            return Err(Error::Other(format!(
                "amount ({}) != userBalance ({}) for TFFA",
                amount,
                self.total_balance()
            )));
        }

        let estimate = self.calculator.fee(amount, fee_rate, take_fee_from_amount);

        if take_fee_from_amount {
            let received = amount.saturating_sub(estimate.fee);
            let status = if received <= DUST_THRESHOLD {
                AnalysisStatus::Unpayable
            } else {
                AnalysisStatus::Ok
            };
            return Ok(PaymentAnalysis {
                status,
                amount: received,
                fee_total: estimate.fee,
                fee_bump: estimate.fee_bump,
                swap_fees: None,
                total: amount,
            });
        }

        let total = amount + estimate.fee;
        let status = if total > self.total_balance() {
            AnalysisStatus::Unpayable
        } else {
            AnalysisStatus::Ok
        };
        Ok(PaymentAnalysis {
            status,
            amount,
            fee_total: estimate.fee,
            fee_bump: estimate.fee_bump,
            swap_fees: None,
            total,
        })
    }

    pub fn to_invoice(&self, payment: &PaymentToInvoice) -> Result<PaymentAnalysis> {
        if payment.amount == 0 {
            return Ok(PaymentAnalysis::with_status(AnalysisStatus::AmountTooSmall));
        }
        if payment.amount > self.total_balance() {
            return Ok(PaymentAnalysis {
                total: payment.amount,
                ..PaymentAnalysis::with_status(AnalysisStatus::AmountGreaterThanBalance)
            });
        }
        if payment.take_fee_from_amount {
            if payment.best_route_fees.is_none() {
                return Err(Error::Other(
                    "fixed amount swap can't be TFFA since that would change the amount"
                        .to_string(),
                ));
            }
            if payment.amount != self.total_balance() {
                return Err(Error::Other(format!(
                    "amount ({}) != userBalance ({}) for TFFA",
                    payment.amount,
                    self.total_balance()
                )));
            }
        }

        if let Some(routes) = &payment.best_route_fees {
            let policies = payment.funding_output_policies.as_ref().ok_or_else(|| {
                Error::Other("payment is missing funding output policies".to_string())
            })?;

            if payment.take_fee_from_amount {
                return self.analyze_tffa_amountless_swap(payment, routes, policies);
            }
            let swap_fees = compute_swap_fees(payment.amount, routes, policies, false);
            return self.analyze_fixed_amount_swap(payment, swap_fees);
        }

        let swap_fees = payment
            .swap_fees
            .ok_or_else(|| Error::Other("payment is missing required swap fees data".to_string()))?;
        self.analyze_fixed_amount_swap(payment, swap_fees)
    }

    fn analyze_fixed_amount_swap(
        &self,
        payment: &PaymentToInvoice,
        swap_fees: SwapFees,
    ) -> Result<PaymentAnalysis> {
        match swap_fees.debt_type {
            DebtType::Lend => Ok(self.analyze_lend_swap(payment, swap_fees)),
            // A swap without debt is a collect swap collecting 0.
            DebtType::Collect | DebtType::None => self.analyze_collect_swap(payment, swap_fees),
        }
    }

    fn analyze_lend_swap(
        &self,
        payment: &PaymentToInvoice,
        swap_fees: SwapFees,
    ) -> PaymentAnalysis {
        let total = payment.amount + swap_fees.routing_fee;
        let status = if total > self.total_balance() {
            AnalysisStatus::Unpayable
        } else {
            AnalysisStatus::Ok
        };

        PaymentAnalysis {
            status,
            amount: payment.amount,
            fee_total: 0,
            fee_bump: 0,
            swap_fees: Some(swap_fees),
            total,
        }
    }

    fn analyze_collect_swap(
        &self,
        payment: &PaymentToInvoice,
        swap_fees: SwapFees,
    ) -> Result<PaymentAnalysis> {
        let collect = swap_fees.debt_amount;
        let expected_output =
            payment.amount + swap_fees.routing_fee + swap_fees.output_padding + collect;

        if swap_fees.output_amount != expected_output {
            return Err(Error::Other(format!(
                "swap integrity check failed (outputAmount={}, original_amount={}, \
                 routing_fee={}, output_padding={}, collect_amount={})",
                swap_fees.output_amount,
                payment.amount,
                swap_fees.routing_fee,
                swap_fees.output_padding,
                collect
            )));
        }

        let fee_rate = self.fee_window.swap_fee_rate(swap_fees.confirmations_needed);
        let estimate = self.calculator.fee(swap_fees.output_amount, fee_rate, false);
        let total = swap_fees.output_amount + estimate.fee;
        let total_for_user = total - collect;

        let status = if total > self.utxo_balance() || total_for_user > self.total_balance() {
            AnalysisStatus::Unpayable
        } else {
            AnalysisStatus::Ok
        };

        Ok(PaymentAnalysis {
            status,
            amount: payment.amount,
            fee_total: estimate.fee,
            fee_bump: estimate.fee_bump,
            swap_fees: Some(swap_fees),
            total: total_for_user,
        })
    }

    /// Spend the whole balance on an amountless invoice.
    ///
    /// The amount fixes the routing fee and the confirmations needed, which fix the on-chain
    /// fee, which in turn fixes the amount. 0-conf is tried first since it is cheaper; if
    /// the resulting amount needs a confirmation the params are recomputed for 1-conf.
    fn analyze_tffa_amountless_swap(
        &self,
        payment: &PaymentToInvoice,
        routes: &[BestRouteFees],
        policies: &FundingOutputPolicies,
    ) -> Result<PaymentAnalysis> {
        let zero_conf_rate = self.fee_window.swap_fee_rate(0);
        let (zero_conf_fee, zero_conf_bump) = self.tffa_swap_fee(policies, zero_conf_rate);

        let unpayable = PaymentAnalysis {
            fee_total: zero_conf_fee,
            fee_bump: zero_conf_bump,
            total: self.total_balance() + zero_conf_fee,
            ..PaymentAnalysis::with_status(AnalysisStatus::Unpayable)
        };

        if zero_conf_fee > self.total_balance() {
            return Ok(unpayable);
        }

        let Some(mut params) = self.tffa_swap_params(routes, policies, 0) else {
            return Ok(unpayable);
        };
        if policies.funding_confirmations(params.amount, params.routing_fee) == 1 {
            match self.tffa_swap_params(routes, policies, 1) {
                Some(one_conf) => params = one_conf,
                None => return Ok(unpayable),
            }
        }

        if params.amount == 0 {
            return Ok(unpayable);
        }

        let swap_fees = compute_swap_fees(params.amount, routes, policies, true);
        if swap_fees.debt_type == DebtType::Lend {
            return Err(Error::Other("TFFA swap should not be a lend operation".to_string()));
        }
        if params.routing_fee != swap_fees.routing_fee {
            return Err(Error::Other(format!(
                "integrity error: inconsistent lightning fee calculated for TFFA swap \
                 (lightning_fee={}, original_amount={}, routing_fee={})",
                params.routing_fee, payment.amount, swap_fees.routing_fee
            )));
        }

        let output_amount =
            params.amount + params.routing_fee + swap_fees.output_padding + swap_fees.debt_amount;
        let total = output_amount + params.on_chain_fee;
        let total_for_display = total - swap_fees.debt_amount;

        let status = if total <= self.utxo_balance() && total_for_display <= self.total_balance() {
            AnalysisStatus::Ok
        } else {
            AnalysisStatus::Unpayable
        };

        Ok(PaymentAnalysis {
            status,
            amount: params.amount,
            fee_total: params.on_chain_fee,
            fee_bump: params.on_chain_fee_bump,
            swap_fees: Some(swap_fees),
            total: payment.amount,
        })
    }

    /// Solve `x + fee(x) = balance - on_chain_fee` for each route until one has capacity.
    ///
    /// With `fee(x) = prop * x / 1e6 + base` that is
    /// `x = (balance - on_chain_fee - base) * 1e6 / (prop + 1e6)`.
    fn tffa_swap_params(
        &self,
        routes: &[BestRouteFees],
        policies: &FundingOutputPolicies,
        confirmations: u32,
    ) -> Option<SwapParams> {
        let fee_rate = self.fee_window.swap_fee_rate(confirmations);
        let (on_chain_fee, on_chain_fee_bump) = self.tffa_swap_fee(policies, fee_rate);

        for route in routes {
            let available =
                self.total_balance() as i64 - on_chain_fee as i64 - route.fee_base as i64;
            let mut amount = (available.max(0) as u128 * 1_000_000
                / (route.fee_proportional_millionth as u128 + 1_000_000)) as u64;

            let routing_fee = route.for_amount(amount);
            // Whole-sat rounding can leave room for one more sat at the same fee.
            if route.for_amount(amount + 1) == routing_fee {
                amount += 1;
            }

            if amount + routing_fee <= route.max_capacity {
                return Some(SwapParams {
                    amount,
                    routing_fee,
                    on_chain_fee,
                    on_chain_fee_bump,
                });
            }
        }

        log::warn!("None of the best route fees have enough capacity");
        None
    }

    /// On-chain fee for spending everything, collected debt included.
    fn tffa_swap_fee(&self, policies: &FundingOutputPolicies, fee_rate: f64) -> (u64, u64) {
        let on_chain_amount = self.total_balance() + policies.potential_collect;
        let estimate = self.calculator.fee(on_chain_amount, fee_rate, true);
        (estimate.fee, estimate.fee_bump)
    }
}
