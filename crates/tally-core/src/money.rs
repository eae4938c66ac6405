//! # Money Module
//!
//! Exact multiplication of decimal currency strings by integer quantities.
//!
//! ## Why Minor Units?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  THE FLOATING POINT PROBLEM                                             │
//! │                                                                         │
//! │    0.1 × 3 = 0.30000000000000004  ❌ WRONG!                            │
//! │                                                                         │
//! │  OUR SOLUTION: parse into the currency's smallest unit                 │
//! │    "0.10" USD → 10 (cents) × 3 = 30 → "0.3"                            │
//! │    "500"  JPY → 500 (yen)  × 3 = 1500 → "1500"                         │
//! │                                                                         │
//! │  All arithmetic is BigInt on minor units, so no amount overflows.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use tally_core::money::{currency, multiply_money_amount};
//!
//! let usd = currency("USD").unwrap();
//! assert_eq!(multiply_money_amount("9.99", 3, usd).unwrap(), "29.97");
//! assert_eq!(multiply_money_amount("1.50", -2, usd).unwrap(), "-3");
//! ```

use num_bigint::{BigInt, Sign};
use std::collections::BTreeMap;
use std::fmt;

use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::types::Price;

// =============================================================================
// Currencies
// =============================================================================

/// A supported currency and its decimal precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Currency {
    pub code: &'static str,
    pub decimals: u32,
}

/// Every currency the ledger charges in.
pub const SUPPORTED_CURRENCIES: &[Currency] = &[
    Currency { code: "USD", decimals: 2 },
    Currency { code: "EUR", decimals: 2 },
    Currency { code: "GBP", decimals: 2 },
    Currency { code: "JPY", decimals: 0 },
    Currency { code: "INR", decimals: 2 },
    Currency { code: "AUD", decimals: 2 },
    Currency { code: "CAD", decimals: 2 },
];

/// Looks up a supported currency by code.
pub fn currency(code: &str) -> Option<&'static Currency> {
    SUPPORTED_CURRENCIES.iter().find(|c| c.code == code)
}

/// Currency code → amount string, as carried by money transfer entries.
pub type ChargedAmount = BTreeMap<String, String>;

// =============================================================================
// Minor Units
// =============================================================================

/// An amount in a currency's smallest unit (cents for USD, yen for JPY).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MinorUnits {
    value: BigInt,
    decimals: u32,
}

impl MinorUnits {
    /// Parses a decimal string such as `"-12.5"` for the given currency.
    ///
    /// Accepts an optional leading `-`, digits, and at most `decimals`
    /// fractional digits.
    pub fn parse(amount: &str, currency: &Currency) -> CoreResult<Self> {
        let invalid = || CoreError::InvalidAmount {
            amount: amount.to_string(),
            currency: currency.code.to_string(),
        };

        let (negative, body) = match amount.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, amount),
        };
        let (int_part, frac_part) = match body.split_once('.') {
            Some((i, f)) => (i, f),
            None => (body, ""),
        };

        let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
        if (int_part.is_empty() && frac_part.is_empty())
            || !all_digits(int_part)
            || !all_digits(frac_part)
            || (body.contains('.') && frac_part.is_empty())
        {
            return Err(invalid());
        }
        if frac_part.len() > currency.decimals as usize {
            return Err(invalid());
        }

        let padding = currency.decimals as usize - frac_part.len();
        let digits = format!("{}{}{}", int_part, frac_part, "0".repeat(padding));
        let value = BigInt::parse_bytes(digits.as_bytes(), 10).ok_or_else(invalid)?;

        Ok(MinorUnits {
            value: if negative { -value } else { value },
            decimals: currency.decimals,
        })
    }

    pub fn is_zero(&self) -> bool {
        self.value.sign() == Sign::NoSign
    }

    /// Scales by an integer quantity.
    pub fn scale(&self, quantity: i64) -> Self {
        MinorUnits {
            value: &self.value * BigInt::from(quantity),
            decimals: self.decimals,
        }
    }
}

/// Renders with trailing fractional zeros trimmed; zero is always `"0"`.
impl fmt::Display for MinorUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return f.write_str("0");
        }
        let decimals = self.decimals as usize;
        let digits = self.value.magnitude().to_string();
        let digits = format!("{:0>width$}", digits, width = decimals + 1);
        let (int_part, frac) = digits.split_at(digits.len() - decimals);

        if self.value.sign() == Sign::Minus {
            f.write_str("-")?;
        }
        f.write_str(int_part)?;
        let frac = frac.trim_end_matches('0');
        if !frac.is_empty() {
            write!(f, ".{}", frac)?;
        }
        Ok(())
    }
}

// =============================================================================
// Operations
// =============================================================================

/// Converts a JSON-sourced quantity to an integer.
///
/// ## Errors
/// `CoreError::NonIntegerQuantity` for fractional, NaN or infinite input.
pub fn integer_quantity(quantity: f64) -> CoreResult<i64> {
    if !quantity.is_finite() || quantity.fract() != 0.0 {
        return Err(CoreError::NonIntegerQuantity);
    }
    // i64::MAX as f64 rounds up to 2^63, which is out of range.
    if quantity < i64::MIN as f64 || quantity >= i64::MAX as f64 {
        return Err(CoreError::AmountOverflow(format!("quantity {}", quantity)));
    }
    Ok(quantity as i64)
}

/// Multiplies a decimal amount by an integer quantity, exactly.
///
/// The sign of the result is `sign(amount) × sign(quantity)`; a zero result
/// is `"0"` with no sign.
pub fn multiply_money_amount(amount: &str, quantity: i64, currency: &Currency) -> CoreResult<String> {
    let parsed = MinorUnits::parse(amount, currency)?;
    if quantity == 0 {
        return Ok("0".to_string());
    }
    Ok(parsed.scale(quantity).to_string())
}

/// Charges `quantity` units of a price tier in every supported currency it lists.
///
/// Zero results are omitted. Amounts that are not strings, or strings that do
/// not parse for their currency, are skipped.
pub fn build_charged_amount(price: &Price, quantity: i64) -> CoreResult<ChargedAmount> {
    let mut charged = ChargedAmount::new();
    for currency in SUPPORTED_CURRENCIES {
        let Some(serde_json::Value::String(amount)) = price.amounts.get(currency.code) else {
            continue;
        };
        let total = match multiply_money_amount(amount, quantity, currency) {
            Ok(total) => total,
            Err(CoreError::InvalidAmount { .. }) => {
                warn!(currency = currency.code, amount = %amount, "Skipping malformed price amount");
                continue;
            }
            Err(e) => return Err(e),
        };
        if total != "0" {
            charged.insert(currency.code.to_string(), total);
        }
    }
    Ok(charged)
}

/// Flips the sign of every amount; `"0"` stays `"0"`.
pub fn negate_charged_amount(charged: &ChargedAmount) -> ChargedAmount {
    charged
        .iter()
        .map(|(code, amount)| {
            let negated = if let Some(positive) = amount.strip_prefix('-') {
                positive.to_string()
            } else if amount == "0" {
                amount.clone()
            } else {
                format!("-{}", amount)
            };
            (code.clone(), negated)
        })
        .collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
