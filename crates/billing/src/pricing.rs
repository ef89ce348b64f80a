//! Per-endpoint unit pricing
//!
//! Converts a usage snapshot into billable amounts. Prices are dollars per
//! call (or per compute unit) held as `Decimal`; amounts are floored to whole
//! cents only once, at the end, so sub-cent calls accumulate correctly.
//!
//! Configured via:
//! - `ENDPOINT_PRICING`: `"getBalance=0.00001,sendTransaction=0.0001"`
//! - `DEFAULT_ENDPOINT_RATE`: rate for endpoints not listed (default: 0.00001)
//! - `COMPUTE_UNIT_RATE`: rate per compute unit (default: 0.000001)

use std::collections::HashMap;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::counter::UsageSnapshot;
use crate::error::{BillingError, BillingResult};

const DEFAULT_ENDPOINT_PRICING: &str = "getBalance=0.00001,sendTransaction=0.0001";

/// Billable amounts for one snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricedUsage {
    pub request_cost: Decimal,
    pub compute_cost: Decimal,
    /// Cumulative request charge for the period, floored to cents
    pub request_cents: i64,
    /// Cumulative compute-unit charge for the period, floored to cents
    pub compute_cents: i64,
}

impl PricedUsage {
    pub fn total_cents(&self) -> i64 {
        self.request_cents.saturating_add(self.compute_cents)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PricingTable {
    endpoint_rates: HashMap<String, Decimal>,
    default_rate: Decimal,
    compute_unit_rate: Decimal,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            endpoint_rates: parse_endpoint_pricing(DEFAULT_ENDPOINT_PRICING).unwrap_or_default(),
            default_rate: dec!(0.00001),
            compute_unit_rate: dec!(0.000001),
        }
    }
}

/// Parse `name=rate` pairs separated by commas
pub fn parse_endpoint_pricing(raw: &str) -> BillingResult<HashMap<String, Decimal>> {
    let mut rates = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (endpoint, rate) = pair.split_once('=').ok_or_else(|| {
            BillingError::Config(format!("Invalid ENDPOINT_PRICING entry: {}", pair))
        })?;
        let rate = parse_rate(rate)?;
        rates.insert(endpoint.trim().to_string(), rate);
    }
    Ok(rates)
}

fn parse_rate(raw: &str) -> BillingResult<Decimal> {
    let rate = Decimal::from_str(raw.trim())
        .map_err(|e| BillingError::Config(format!("Invalid rate {:?}: {}", raw, e)))?;
    if rate.is_sign_negative() {
        return Err(BillingError::Config(format!("Negative rate: {}", raw)));
    }
    Ok(rate)
}

fn to_cents(amount: Decimal) -> i64 {
    (amount * dec!(100)).floor().to_i64().unwrap_or(i64::MAX)
}

impl PricingTable {
    pub fn new(
        endpoint_rates: HashMap<String, Decimal>,
        default_rate: Decimal,
        compute_unit_rate: Decimal,
    ) -> Self {
        Self {
            endpoint_rates,
            default_rate,
            compute_unit_rate,
        }
    }

    /// Load pricing from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();
        let endpoint_rates = match std::env::var("ENDPOINT_PRICING") {
            Ok(raw) => parse_endpoint_pricing(&raw)?,
            Err(_) => defaults.endpoint_rates,
        };
        let default_rate = match std::env::var("DEFAULT_ENDPOINT_RATE") {
            Ok(raw) => parse_rate(&raw)?,
            Err(_) => defaults.default_rate,
        };
        let compute_unit_rate = match std::env::var("COMPUTE_UNIT_RATE") {
            Ok(raw) => parse_rate(&raw)?,
            Err(_) => defaults.compute_unit_rate,
        };
        Ok(Self::new(endpoint_rates, default_rate, compute_unit_rate))
    }

    /// Dollars per call for `endpoint`, falling back to the default rate
    pub fn rate_for(&self, endpoint: &str) -> Decimal {
        self.endpoint_rates
            .get(endpoint)
            .copied()
            .unwrap_or(self.default_rate)
    }

    pub fn compute_unit_rate(&self) -> Decimal {
        self.compute_unit_rate
    }

    pub fn price(&self, snapshot: &UsageSnapshot) -> PricedUsage {
        let request_cost = snapshot
            .per_endpoint_counts
            .iter()
            .fold(Decimal::ZERO, |acc, (endpoint, count)| {
                acc + self.rate_for(endpoint) * Decimal::from(*count)
            });
        let compute_cost = self.compute_unit_rate * Decimal::from(snapshot.compute_units_consumed);

        PricedUsage {
            request_cost,
            compute_cost,
            request_cents: to_cents(request_cost),
            compute_cents: to_cents(compute_cost),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meterflow_shared::{PeriodKey, SubscriberId};

    fn snapshot(counts: &[(&str, u64)], compute: u64) -> UsageSnapshot {
        let mut snapshot =
            UsageSnapshot::empty(SubscriberId::from("u1"), PeriodKey::parse("2026-10").unwrap());
        for (endpoint, count) in counts {
            snapshot
                .per_endpoint_counts
                .insert(endpoint.to_string(), *count);
        }
        snapshot.compute_units_consumed = compute;
        snapshot
    }

    #[test]
    fn test_parse_endpoint_pricing() {
        let rates = parse_endpoint_pricing("getBalance=0.00001, sendTransaction=0.0001").unwrap();
        assert_eq!(rates["getBalance"], dec!(0.00001));
        assert_eq!(rates["sendTransaction"], dec!(0.0001));
        assert!(parse_endpoint_pricing("broken").is_err());
        assert!(parse_endpoint_pricing("a=-1").is_err());
    }

    #[test]
    fn test_unmapped_endpoint_uses_default_rate() {
        let table = PricingTable::default();
        assert_eq!(table.rate_for("getSlot"), dec!(0.00001));
        assert_eq!(table.rate_for("sendTransaction"), dec!(0.0001));
    }

    #[test]
    fn test_price_floors_to_cents_after_summing() {
        let table = PricingTable::default();
        // $0.015 + $0.99999 = $1.01499; flooring each part first would give 100
        let priced = table.price(&snapshot(
            &[("sendTransaction", 150), ("getBalance", 99_999)],
            0,
        ));
        assert_eq!(priced.request_cost, dec!(1.01499));
        assert_eq!(priced.request_cents, 101);
        assert_eq!(priced.compute_cents, 0);
    }

    #[test]
    fn test_compute_units_are_priced_separately() {
        let table = PricingTable::default();
        let priced = table.price(&snapshot(&[], 2_500_000));
        assert_eq!(priced.compute_cost, dec!(2.5));
        assert_eq!(priced.compute_cents, 250);
        assert_eq!(priced.total_cents(), 250);
    }

    #[test]
    fn test_empty_snapshot_costs_nothing() {
        let priced = PricingTable::default().price(&snapshot(&[], 0));
        assert_eq!(priced.total_cents(), 0);
    }
}
