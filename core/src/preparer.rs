//! Turns a payment request into a priced, checked payment ready to submit.

use crate::analyzer::{AnalysisStatus, PaymentAnalyzer, PaymentToInvoice};
use crate::api::{Contact, PaymentService, RealTimeData};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::exchange::{BitcoinAmount, MonetaryAmount};
use crate::invoice::decode_invoice;
use crate::keys::PublicKeyPair;
use crate::size_vector::{NextTransactionSize, SizeVectorCell, WriteSite};
use crate::storage::SizeVectorStorage;
use crate::swap::{SWAP_EXPIRATION_IN_BLOCKS, SubmarineSwap};
use crate::types::DUST_THRESHOLD;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Who gets paid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum PaymentIntent {
    ToAddress { address: String },
    ToContact { contact: Contact },
    /// A Lightning invoice, paid through the submarine swap quoted for it.
    ToLnInvoice { invoice: String, swap: SubmarineSwap },
}

impl PaymentIntent {
    pub fn swap(&self) -> Option<&SubmarineSwap> {
        match self {
            PaymentIntent::ToLnInvoice { swap, .. } => Some(swap),
            PaymentIntent::ToAddress { .. } | PaymentIntent::ToContact { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub intent: PaymentIntent,
    /// Amount as entered, in the user's input currency.
    pub amount: MonetaryAmount,
    #[serde(default)]
    pub description: String,
    /// Overrides the rate picked from the fee window, in sat/vbyte. Swaps ignore it: their
    /// rate follows the confirmations the server waits for.
    #[serde(default)]
    pub fee_rate: Option<f64>,
    #[serde(default)]
    pub take_fee_from_amount: bool,
}

/// A payment with every amount fixed, as shown to the user before they confirm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedPayment {
    pub intent: PaymentIntent,
    pub status: AnalysisStatus,
    pub amount: BitcoinAmount,
    pub fee: BitcoinAmount,
    pub sweep_fee: BitcoinAmount,
    pub total: BitcoinAmount,
    pub description: String,
    pub fee_window_id: u64,
    pub rate_window_hid: u64,
    pub fee_rate: f64,
    /// Value of the output paying the receiver.
    pub output_amount: u64,
    pub swap: Option<SubmarineSwap>,
    /// Outpoints the size vector was computed over, one nonce is needed per input.
    pub outpoints: Vec<String>,
}

impl PreparedPayment {
    pub fn is_payable(&self) -> bool {
        self.status == AnalysisStatus::Ok
    }

    pub fn is_lending_swap(&self) -> bool {
        self.swap.as_ref().is_some_and(SubmarineSwap::is_lend)
    }
}

pub struct PaymentPreparer<'a, V: SizeVectorStorage, P: PaymentService> {
    config: &'a EngineConfig,
    service: &'a P,
    size_vector: &'a SizeVectorCell<V>,
    /// Base keys swap quotes are checked against.
    keys: &'a PublicKeyPair,
}

impl<'a, V: SizeVectorStorage, P: PaymentService> PaymentPreparer<'a, V, P> {
    pub fn new(
        config: &'a EngineConfig,
        service: &'a P,
        size_vector: &'a SizeVectorCell<V>,
        keys: &'a PublicKeyPair,
    ) -> Self {
        Self {
            config,
            service,
            size_vector,
            keys,
        }
    }

    /// Refresh market data, the size vector and the contact, then price the payment.
    pub async fn prepare(&self, request: &PaymentRequest) -> Result<PreparedPayment> {
        let refresh_contact = async {
            match &request.intent {
                PaymentIntent::ToContact { contact } => {
                    self.service.fetch_contact(contact.hid).await.map(Some)
                }
                PaymentIntent::ToAddress { .. } | PaymentIntent::ToLnInvoice { .. } => Ok(None),
            }
        };

        let (real_time, nts, contact) = futures::try_join!(
            self.service.fetch_real_time_data(),
            self.refresh_size_vector(),
            refresh_contact,
        )?;

        let request = match contact {
            Some(contact) => PaymentRequest {
                intent: PaymentIntent::ToContact { contact },
                ..request.clone()
            },
            None => request.clone(),
        };

        prepare_with(
            self.config,
            &request,
            &real_time,
            &nts,
            self.keys,
            OffsetDateTime::now_utc(),
        )
    }

    async fn refresh_size_vector(&self) -> Result<NextTransactionSize> {
        let fetched = self.service.fetch_next_transaction_size().await?;
        self.size_vector
            .reconcile_and_store(fetched, WriteSite::PeriodicFetch)
            .await?;

        self.size_vector
            .latest()
            .await?
            .ok_or_else(|| Error::Storage("size vector missing after refresh".to_string()))
    }
}

/// Price `request` against already-fresh data.
///
/// Swap quotes are checked against `keys`, the wallet's base key pair.
pub fn prepare_with(
    config: &EngineConfig,
    request: &PaymentRequest,
    real_time: &RealTimeData,
    nts: &NextTransactionSize,
    keys: &PublicKeyPair,
    now: OffsetDateTime,
) -> Result<PreparedPayment> {
    let rates = &real_time.exchange_rate_window;
    let fee_window = &real_time.fee_window;
    let input_currency = request.amount.currency.as_str();
    let primary_currency = config.primary_currency.as_str();
    let in_currencies =
        |sats: u64| rates.bitcoin_amount(sats, input_currency, primary_currency);

    let requested_sats = rates.to_satoshis(&request.amount)?;

    let priced = match &request.intent {
        PaymentIntent::ToLnInvoice { invoice, swap } => {
            price_swap(config, request, invoice, swap, real_time, nts, keys, now)?
        }
        PaymentIntent::ToAddress { .. } | PaymentIntent::ToContact { .. } => {
            let fee_rate = request
                .fee_rate
                .unwrap_or_else(|| match config.confirmation_target {
                    Some(target) => fee_window.fee_rate_for_target(target),
                    None => fee_window.fast_fee_rate(),
                });
            let analysis = PaymentAnalyzer::new(fee_window, nts, &real_time.fee_bump_functions)
                .to_address(requested_sats, fee_rate, request.take_fee_from_amount)?;

            Priced {
                status: analysis.status,
                amount: requested_sats,
                output_amount: analysis.amount,
                fee: analysis.fee_total,
                sweep_fee: 0,
                total: analysis.total,
                fee_rate,
            }
        }
    };

    let mut amount = in_currencies(priced.amount)?;
    if priced.amount == requested_sats {
        // Keep what the user typed, untouched by the round trip through satoshis.
        amount.in_input_currency = request.amount.clone();
    }

    log::debug!(
        "Prepared payment of {} sats: fee {}, sweep {}, total {}, status {:?}",
        priced.amount,
        priced.fee,
        priced.sweep_fee,
        priced.total,
        priced.status
    );

    Ok(PreparedPayment {
        intent: request.intent.clone(),
        status: priced.status,
        amount,
        fee: in_currencies(priced.fee)?,
        sweep_fee: in_currencies(priced.sweep_fee)?,
        total: in_currencies(priced.total)?,
        description: request.description.clone(),
        fee_window_id: fee_window.id,
        rate_window_hid: rates.window_hid,
        fee_rate: priced.fee_rate,
        output_amount: priced.output_amount,
        swap: request.intent.swap().cloned(),
        outpoints: nts.outpoints(),
    })
}

struct Priced {
    status: AnalysisStatus,
    amount: u64,
    output_amount: u64,
    fee: u64,
    sweep_fee: u64,
    total: u64,
    fee_rate: f64,
}

#[allow(clippy::too_many_arguments)]
fn price_swap(
    config: &EngineConfig,
    request: &PaymentRequest,
    invoice: &str,
    swap: &SubmarineSwap,
    real_time: &RealTimeData,
    nts: &NextTransactionSize,
    keys: &PublicKeyPair,
    now: OffsetDateTime,
) -> Result<Priced> {
    let decoded = decode_invoice(invoice, config.network)?;
    let amount = decoded.amount_sat().ok_or_else(|| {
        Error::InvalidInvoiceAmount(format!("invoice {} has no amount", decoded.original))
    })?;
    if decoded.is_expired(now) {
        return Err(Error::InvoiceExpired(decoded.original));
    }
    swap.validate_v2(
        invoice,
        keys.user(),
        keys.muun(),
        SWAP_EXPIRATION_IN_BLOCKS,
        config.network,
    )?;
    swap.validate_against_invoice(&decoded, now)?;
    swap.validate_lock_time(real_time.current_block_height)?;

    let mut swap_fees = swap.swap_fees();
    if swap.is_lend() {
        // The backend rejects outputs below dust even though a lent swap's output is
        // never broadcast.
        let padded = swap_fees.output_amount.max(DUST_THRESHOLD);
        if padded != swap_fees.output_amount {
            log::info!(
                "Padding lent swap {} output from {} to {} sats",
                swap.houston_uuid,
                swap_fees.output_amount,
                padded
            );
        }
        swap_fees.output_amount = padded;
    }

    let analysis = PaymentAnalyzer::new(&real_time.fee_window, nts, &real_time.fee_bump_functions)
        .to_invoice(&PaymentToInvoice {
            take_fee_from_amount: request.take_fee_from_amount,
            amount,
            swap_fees: Some(swap_fees),
            best_route_fees: None,
            funding_output_policies: None,
        })?;

    Ok(Priced {
        status: analysis.status,
        amount,
        output_amount: swap_fees.output_amount,
        fee: analysis.fee_total,
        sweep_fee: swap.fees.sweep_in_sats,
        total: analysis.total,
        fee_rate: real_time
            .fee_window
            .swap_fee_rate(swap_fees.confirmations_needed),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::tests::window;
    use crate::fees::{DebtType, FeeWindow};
    use crate::size_vector::tests::nts;
    use crate::swap::SwapFundingOutput;
    use crate::swap::tests::{base_keys, funded_swap};
    use crate::types::Network;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn fee_window() -> FeeWindow {
        FeeWindow {
            id: 3,
            fetch_date: OffsetDateTime::UNIX_EPOCH,
            targeted_fees: BTreeMap::from([(1, 20.0), (6, 10.0), (24, 2.0)]),
            fast_conf_target: 1,
            medium_conf_target: 6,
            slow_conf_target: 24,
        }
    }

    fn real_time() -> RealTimeData {
        RealTimeData {
            fee_window: fee_window(),
            exchange_rate_window: window(),
            fee_bump_functions: vec![],
            min_mempool_fee_rate: 1.0,
            current_block_height: 800_000,
        }
    }

    fn config() -> EngineConfig {
        EngineConfig::new(Network::Regtest, "http://localhost").with_primary_currency("USD")
    }

    fn keys() -> PublicKeyPair {
        let (user, muun) = base_keys(Network::Regtest);
        PublicKeyPair::new(user, muun).unwrap()
    }

    fn prepare(request: &PaymentRequest, nts: &NextTransactionSize) -> Result<PreparedPayment> {
        prepare_with(&config(), request, &real_time(), nts, &keys(), OffsetDateTime::now_utc())
    }

    fn to_address(amount: MonetaryAmount) -> PaymentRequest {
        PaymentRequest {
            intent: PaymentIntent::ToAddress {
                address: "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080".to_string(),
            },
            amount,
            description: "rent".to_string(),
            fee_rate: None,
            take_fee_from_amount: false,
        }
    }

    /// A real invoice for `amount_sat` and a swap quote for it, funded to our keys.
    fn quoted_invoice(amount_sat: u64, sweep: u64, lightning: u64) -> (String, SubmarineSwap) {
        let (user, muun) = base_keys(Network::Regtest);
        let (bolt11, swap, _) =
            funded_swap(&user, &muun, amount_sat, sweep, lightning, Network::Regtest);
        (bolt11, swap)
    }

    /// A lent quote: the server fronts `amount_sat + lightning` and nothing goes on chain.
    fn lent_invoice(amount_sat: u64, lightning: u64) -> (String, SubmarineSwap) {
        let (invoice, mut swap) = quoted_invoice(amount_sat, 0, lightning);
        swap.funding_output = SwapFundingOutput {
            output_amount_in_satoshis: 0,
            debt_type: DebtType::Lend,
            debt_amount_in_satoshis: amount_sat + lightning,
            ..swap.funding_output
        };
        (invoice, swap)
    }

    fn to_invoice(invoice: String, swap: SubmarineSwap) -> PaymentRequest {
        PaymentRequest {
            intent: PaymentIntent::ToLnInvoice { invoice, swap },
            amount: MonetaryAmount::from_satoshis(0),
            description: "coffee".to_string(),
            fee_rate: None,
            take_fee_from_amount: false,
        }
    }

    #[test]
    fn test_prepare_to_address_in_fiat() {
        let balance = nts(Some(1), &[(1_000_000, 200)]);
        let request = to_address(MonetaryAmount::new(dec!(100), "USD"));

        let prepared = prepare(&request, &balance).unwrap();

        // 100 USD at 50,000 USD/BTC, fast rate 20 sat/vb over 200 vbytes.
        assert!(prepared.is_payable());
        assert_eq!(prepared.amount.in_satoshis, 200_000);
        assert_eq!(prepared.amount.in_input_currency, request.amount);
        assert_eq!(prepared.fee.in_satoshis, 4_000);
        assert_eq!(prepared.total.in_satoshis, 204_000);
        assert_eq!(prepared.total.in_primary_currency.currency, "USD");
        assert_eq!(prepared.sweep_fee.in_satoshis, 0);
        assert_eq!(prepared.output_amount, 200_000);
        assert_eq!(prepared.fee_window_id, 3);
        assert_eq!(prepared.rate_window_hid, 7);
        assert_eq!(prepared.outpoints.len(), 1);
    }

    #[test]
    fn test_confirmation_target_and_override_pick_the_rate() {
        let balance = nts(Some(1), &[(1_000_000, 200)]);
        let request = to_address(MonetaryAmount::from_satoshis(10_000));
        let now = OffsetDateTime::now_utc();

        let slow = config().with_confirmation_target(24);
        let prepared = prepare_with(&slow, &request, &real_time(), &balance, &keys(), now).unwrap();
        assert_eq!(prepared.fee_rate, 2.0);
        assert_eq!(prepared.fee.in_satoshis, 400);

        let custom = PaymentRequest {
            fee_rate: Some(5.0),
            ..request
        };
        let prepared = prepare_with(&slow, &custom, &real_time(), &balance, &keys(), now).unwrap();
        assert_eq!(prepared.fee.in_satoshis, 1_000);
    }

    #[test]
    fn test_unpayable_amount_is_reported_not_failed() {
        let balance = nts(Some(1), &[(10_000, 200)]);
        let request = to_address(MonetaryAmount::from_satoshis(9_000));

        let prepared = prepare(&request, &balance).unwrap();
        assert_eq!(prepared.status, AnalysisStatus::Unpayable);
        assert!(!prepared.is_payable());
    }

    #[test]
    fn test_prepare_swap_uses_funding_output() {
        let balance = nts(Some(1), &[(1_000_000, 200)]);
        let (invoice, swap) = quoted_invoice(49_200, 500, 300);

        let prepared = prepare(&to_invoice(invoice, swap), &balance).unwrap();

        // 0-conf swaps pay the medium rate: 10 sat/vb over 200 vbytes.
        assert!(prepared.is_payable());
        assert_eq!(prepared.amount.in_satoshis, 49_200);
        assert_eq!(prepared.output_amount, 50_000);
        assert_eq!(prepared.sweep_fee.in_satoshis, 500);
        assert_eq!(prepared.fee_rate, 10.0);
        assert_eq!(prepared.fee.in_satoshis, 2_000);
        assert_eq!(prepared.total.in_satoshis, 52_000);
        assert!(prepared.swap.is_some());
    }

    #[test]
    fn test_swap_ignores_fee_rate_override() {
        let balance = nts(Some(1), &[(1_000_000, 200)]);
        let (invoice, mut swap) = quoted_invoice(49_200, 500, 300);
        swap.funding_output.confirmations_needed = 1;
        let request = PaymentRequest {
            fee_rate: Some(2.0),
            ..to_invoice(invoice, swap)
        };

        let prepared = prepare(&request, &balance).unwrap();
        assert_eq!(prepared.fee_rate, 20.0);
        assert_eq!(prepared.fee.in_satoshis, 4_000);
    }

    #[test]
    fn test_prepare_swap_rejects_mismatched_quote() {
        let balance = nts(Some(1), &[(1_000_000, 200)]);
        let (invoice, mut swap) = quoted_invoice(49_000, 500, 300);
        swap.funding_output.output_amount_in_satoshis = 50_000;

        let result = prepare(&to_invoice(invoice, swap), &balance);
        assert!(matches!(result, Err(Error::InvalidSwap(_))));
    }

    #[test]
    fn test_prepare_swap_rejects_expired_invoice() {
        let balance = nts(Some(1), &[(1_000_000, 200)]);
        let (invoice, swap) = quoted_invoice(49_200, 500, 300);
        let later = OffsetDateTime::now_utc() + time::Duration::days(30);

        let request = to_invoice(invoice, swap);
        let result = prepare_with(&config(), &request, &real_time(), &balance, &keys(), later);
        assert!(matches!(result, Err(Error::InvoiceExpired(_))));
    }

    #[test]
    fn test_prepare_swap_rejects_funding_address_not_ours() {
        let balance = nts(Some(1), &[(1_000_000, 200)]);
        let (invoice, mut swap) = quoted_invoice(49_200, 500, 300);
        swap.funding_output.output_address =
            "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080".to_string();

        let result = prepare(&to_invoice(invoice, swap), &balance);
        assert!(matches!(result, Err(Error::InvalidSwap(_))));
    }

    #[test]
    fn test_prepare_swap_rejects_quote_for_another_invoice() {
        let balance = nts(Some(1), &[(1_000_000, 200)]);
        let (invoice, _) = quoted_invoice(49_200, 500, 300);
        let (_, other_swap) = quoted_invoice(49_200, 500, 300);

        let result = prepare(&to_invoice(invoice, other_swap), &balance);
        assert!(matches!(result, Err(Error::InvalidSwap(_))));
    }

    #[test]
    fn test_prepare_swap_rejects_keys_of_another_wallet() {
        let balance = nts(Some(1), &[(1_000_000, 200)]);
        let (invoice, swap) = quoted_invoice(49_200, 500, 300);
        let (user, muun) = base_keys(Network::Regtest);
        let swapped = PublicKeyPair::new(muun, user).unwrap();

        let request = to_invoice(invoice, swap);
        let now = OffsetDateTime::now_utc();
        let result = prepare_with(&config(), &request, &real_time(), &balance, &swapped, now);
        assert!(matches!(result, Err(Error::InvalidSwap(_))));
    }

    #[test]
    fn test_lent_swap_is_padded_to_dust_and_costs_no_fee() {
        let balance = nts(Some(1), &[(1_000, 200)]);
        let (invoice, swap) = lent_invoice(100, 2);

        let prepared = prepare(&to_invoice(invoice, swap), &balance).unwrap();

        assert!(prepared.is_payable());
        assert!(prepared.is_lending_swap());
        assert_eq!(prepared.output_amount, DUST_THRESHOLD);
        assert_eq!(prepared.fee.in_satoshis, 0);
        assert_eq!(prepared.total.in_satoshis, 102);
    }

    #[test]
    fn test_lent_swap_beyond_balance_is_not_payable() {
        // The payment alone is over the balance.
        let (invoice, swap) = lent_invoice(100, 2);
        let prepared = prepare(&to_invoice(invoice, swap), &nts(Some(1), &[(50, 200)])).unwrap();
        assert_eq!(prepared.status, AnalysisStatus::AmountGreaterThanBalance);
        assert!(!prepared.is_payable());

        // The payment fits but the lightning fee does not.
        let (invoice, swap) = lent_invoice(100, 2);
        let prepared = prepare(&to_invoice(invoice, swap), &nts(Some(1), &[(101, 200)])).unwrap();
        assert_eq!(prepared.status, AnalysisStatus::Unpayable);
        assert!(!prepared.is_payable());
        assert_eq!(prepared.total.in_satoshis, 102);
    }

    #[test]
    fn test_collect_swap_total_excludes_collected_debt() {
        let balance = nts(Some(1), &[(1_000_000, 200)]);
        let (invoice, mut swap) = quoted_invoice(49_200, 500, 300);
        swap.funding_output = SwapFundingOutput {
            output_amount_in_satoshis: 51_000,
            debt_type: DebtType::Collect,
            debt_amount_in_satoshis: 1_000,
            ..swap.funding_output
        };

        let prepared = prepare(&to_invoice(invoice, swap), &balance).unwrap();

        assert_eq!(prepared.output_amount, 51_000);
        assert_eq!(prepared.total.in_satoshis, 51_000 + 2_000 - 1_000);
    }

    #[test]
    fn test_collect_swap_beyond_utxos_is_not_payable() {
        let balance = nts(Some(1), &[(52_000, 200)]);
        let (invoice, mut swap) = quoted_invoice(49_200, 500, 300);
        swap.funding_output = SwapFundingOutput {
            output_amount_in_satoshis: 51_000,
            debt_type: DebtType::Collect,
            debt_amount_in_satoshis: 1_000,
            ..swap.funding_output
        };

        // The user sees 52,000 leave but the funding output needs 53,000 of UTXOs.
        let prepared = prepare(&to_invoice(invoice, swap), &balance).unwrap();
        assert_eq!(prepared.status, AnalysisStatus::Unpayable);
    }
}
