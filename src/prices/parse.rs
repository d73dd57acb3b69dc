//! Parsing of provider number strings and per-class rounding.
//!
//! The provider formats numbers the Turkish way ("5.953,42") and decorates
//! some fields with `%` or `$`. Plain dotted decimals ("32.80") are accepted too.

use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};

use super::AssetClass;

/// Parses a provider number. Returns `None` for anything that is not a number.
pub fn parse_localized_decimal(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '%' | '$' | ' ' | '\u{a0}'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let normalized = if cleaned.contains('.') && cleaned.contains(',') {
        cleaned.replace('.', "").replace(',', ".")
    } else {
        cleaned.replace(',', ".")
    };

    Decimal::from_str(&normalized)
        .or_else(|_| Decimal::from_scientific(&normalized))
        .ok()
}

/// Rounds an accepted price the way each class is displayed.
pub fn round_value(class: AssetClass, value: Decimal) -> Decimal {
    let dp = match class {
        AssetClass::Currency if value >= Decimal::TEN => 2,
        AssetClass::Currency => 4,
        AssetClass::Gold => 2,
        AssetClass::Silver => 4,
    };
    value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
}

pub fn round_percent(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Percentage change from `previous` to `current`, rounded to two places.
pub fn percent_change(previous: Decimal, current: Decimal) -> Decimal {
    if previous.is_zero() {
        return Decimal::ZERO;
    }
    round_percent((current - previous) / previous * Decimal::ONE_HUNDRED)
}
