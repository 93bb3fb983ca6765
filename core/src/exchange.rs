//! Monetary amounts and exchange-rate conversion.

use crate::error::{Error, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const BTC: &str = "BTC";

const SATOSHIS_PER_BTC: i64 = 100_000_000;

/// An amount in some currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonetaryAmount {
    pub amount: Decimal,
    pub currency: String,
}

impl MonetaryAmount {
    pub fn new(amount: Decimal, currency: impl Into<String>) -> Self {
        Self {
            amount,
            currency: currency.into(),
        }
    }

    pub fn from_satoshis(satoshis: u64) -> Self {
        Self::new(Decimal::new(satoshis as i64, 8), BTC)
    }

    pub fn is_btc(&self) -> bool {
        self.currency == BTC
    }
}

impl std::fmt::Display for MonetaryAmount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

/// An amount in satoshis along with its value in the input and primary currencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BitcoinAmount {
    pub in_satoshis: u64,
    pub in_input_currency: MonetaryAmount,
    pub in_primary_currency: MonetaryAmount,
}

impl BitcoinAmount {
    pub fn zero(input_currency: &str, primary_currency: &str) -> Self {
        Self {
            in_satoshis: 0,
            in_input_currency: MonetaryAmount::new(Decimal::ZERO, input_currency),
            in_primary_currency: MonetaryAmount::new(Decimal::ZERO, primary_currency),
        }
    }
}

/// Exchange rates valid for a window, expressed as units of each currency per BTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRateWindow {
    pub window_hid: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub fetch_date: time::OffsetDateTime,
    pub rates: BTreeMap<String, Decimal>,
}

impl ExchangeRateWindow {
    pub fn rate(&self, currency: &str) -> Result<Decimal> {
        if currency == BTC {
            return Ok(Decimal::ONE);
        }
        match self.rates.get(currency) {
            Some(rate) if !rate.is_zero() => Ok(*rate),
            Some(_) => Err(Error::Parse(format!("Zero exchange rate for {}", currency))),
            None => Err(Error::Parse(format!("No exchange rate for {}", currency))),
        }
    }

    pub fn convert(&self, amount: &MonetaryAmount, target: &str) -> Result<MonetaryAmount> {
        if amount.currency == target {
            return Ok(amount.clone());
        }
        let btc = amount.amount / self.rate(&amount.currency)?;
        Ok(MonetaryAmount::new(btc * self.rate(target)?, target))
    }

    /// Satoshis worth `amount`, rounded half-up.
    pub fn to_satoshis(&self, amount: &MonetaryAmount) -> Result<u64> {
        let btc = self.convert(amount, BTC)?.amount;
        let sats = (btc * Decimal::from(SATOSHIS_PER_BTC))
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        sats.to_u64()
            .ok_or_else(|| Error::Parse(format!("Amount out of range: {}", amount)))
    }

    pub fn from_satoshis(&self, satoshis: u64, currency: &str) -> Result<MonetaryAmount> {
        self.convert(&MonetaryAmount::from_satoshis(satoshis), currency)
    }

    /// Express `satoshis` in both currencies.
    pub fn bitcoin_amount(
        &self,
        satoshis: u64,
        input_currency: &str,
        primary_currency: &str,
    ) -> Result<BitcoinAmount> {
        Ok(BitcoinAmount {
            in_satoshis: satoshis,
            in_input_currency: self.from_satoshis(satoshis, input_currency)?,
            in_primary_currency: self.from_satoshis(satoshis, primary_currency)?,
        })
    }
}
