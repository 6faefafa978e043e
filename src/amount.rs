//! Decimal amount arithmetic. BRC-20 amounts are textual decimals with up to 8
//! fractional digits; they are never represented as a binary float.

use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::error::{BrcErrorCode, ValidationResult};

/// textual decimal matcher: an integer part, optionally followed by a fractional part.
fn amount_regex() -> &'static Regex {
    static RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)?$").unwrap());
    &RE
}

pub fn is_valid_amount(raw: &str) -> bool {
    if !amount_regex().is_match(raw) {
        return false;
    }
    match Decimal::from_str(raw) {
        Ok(d) => d > Decimal::ZERO,
        Err(_) => false,
    }
}

/// Parses a BRC-20 amount string, validating shape and positivity.
pub fn parse_amount(raw: &str) -> Result<Decimal, ValidationResult> {
    if !amount_regex().is_match(raw) {
        return Err(ValidationResult::reject(
            BrcErrorCode::InvalidAmount,
            format!("amount '{raw}' is not a valid decimal"),
        ));
    }
    let value = Decimal::from_str(raw).map_err(|_| {
        ValidationResult::reject(BrcErrorCode::InvalidAmount, format!("amount '{raw}' out of range"))
    })?;
    if value <= Decimal::ZERO {
        return Err(ValidationResult::reject(
            BrcErrorCode::InvalidAmount,
            format!("amount '{raw}' must be greater than zero"),
        ));
    }
    Ok(value.round_dp(8))
}

pub fn add(a: Decimal, b: Decimal) -> Decimal {
    (a + b).round_dp(8)
}

/// Subtracts `b` from `a`, failing rather than returning a negative balance.
pub fn sub(a: Decimal, b: Decimal) -> Option<Decimal> {
    if a < b {
        None
    } else {
        Some((a - b).round_dp(8))
    }
}

/// Formats an amount with no scientific notation and no added trailing zeros.
pub fn format_amount(amount: Decimal) -> String {
    amount.normalize().to_string()
}

/// Strips leading zeros from the integer part of a raw amount string.
pub fn normalize_amount(raw: &str) -> Result<String, ValidationResult> {
    let value = parse_amount(raw)?;
    Ok(format_amount(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_integers_and_decimals() {
        assert!(is_valid_amount("500"));
        assert!(is_valid_amount("500.00000001"));
        assert!(!is_valid_amount("0"));
        assert!(!is_valid_amount("-5"));
        assert!(!is_valid_amount("5.5.5"));
        assert!(!is_valid_amount("abc"));
    }

    #[test]
    fn sub_refuses_to_go_negative() {
        let a = Decimal::from_str("100").unwrap();
        let b = Decimal::from_str("150").unwrap();
        assert_eq!(sub(a, b), None);
        assert_eq!(sub(b, a), Some(Decimal::from_str("50").unwrap()));
    }

    #[test]
    fn format_has_no_padding() {
        let v = parse_amount("250").unwrap();
        assert_eq!(format_amount(v), "250");
    }
}
