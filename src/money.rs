//! Money values: a currency code, an integer amount in minor units, and the
//! currency's ISO scale. Arithmetic is scale-preserving; multiplication by a
//! scalar rounds half-to-even at the currency scale.

use std::fmt;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::Diagnostic;

/// A currency the lexer recognises, frozen at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Currency {
    pub code: &'static str,
    /// Symbol accepted in literal position, if any (`$`, `CA$`, `¥`).
    pub symbol: Option<&'static str>,
    /// ISO 4217 minor-unit scale.
    pub scale: u8,
}

static CURRENCIES: Lazy<Vec<Currency>> = Lazy::new(|| {
    vec![
        Currency { code: "USD", symbol: Some("$"), scale: 2 },
        Currency { code: "GBP", symbol: Some("£"), scale: 2 },
        Currency { code: "EUR", symbol: Some("€"), scale: 2 },
        Currency { code: "JPY", symbol: Some("¥"), scale: 0 },
        Currency { code: "CAD", symbol: Some("CA$"), scale: 2 },
        Currency { code: "AUD", symbol: Some("AU$"), scale: 2 },
        Currency { code: "HKD", symbol: Some("HK$"), scale: 2 },
        Currency { code: "SGD", symbol: Some("S$"), scale: 2 },
        Currency { code: "CNY", symbol: Some("CN¥"), scale: 2 },
        Currency { code: "CHF", symbol: None, scale: 2 },
        Currency { code: "NZD", symbol: None, scale: 2 },
        Currency { code: "SEK", symbol: None, scale: 2 },
        Currency { code: "NOK", symbol: None, scale: 2 },
        Currency { code: "DKK", symbol: None, scale: 2 },
        Currency { code: "INR", symbol: None, scale: 2 },
        Currency { code: "KRW", symbol: None, scale: 0 },
        Currency { code: "BHD", symbol: None, scale: 3 },
        Currency { code: "KWD", symbol: None, scale: 3 },
        Currency { code: "MXN", symbol: None, scale: 2 },
        Currency { code: "BRL", symbol: None, scale: 2 },
    ]
});

pub fn currency_by_code(code: &str) -> Option<&'static Currency> {
    CURRENCIES.iter().find(|c| c.code == code)
}

/// Longest-match lookup for symbol-prefixed literals (`CA$` before `$` is
/// irrelevant here since callers try longest prefixes first).
pub fn currency_by_symbol(symbol: &str) -> Option<&'static Currency> {
    CURRENCIES.iter().find(|c| c.symbol == Some(symbol))
}

/// All symbols, longest first, for the lexer's prefix scan.
pub fn currency_symbols() -> Vec<&'static str> {
    let mut symbols: Vec<&'static str> =
        CURRENCIES.iter().filter_map(|c| c.symbol).collect();
    symbols.sort_by_key(|s| std::cmp::Reverse(s.len()));
    symbols
}

/// An exact monetary amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub currency: &'static str,
    /// Amount in minor units (`$12.34` is 1234).
    pub minor: i64,
    pub scale: u8,
}

impl Money {
    pub fn new(currency: &'static Currency, minor: i64) -> Money {
        Money {
            currency: currency.code,
            minor,
            scale: currency.scale,
        }
    }

    fn same_currency(&self, other: &Money) -> Result<(), Diagnostic> {
        if self.currency == other.currency {
            Ok(())
        } else {
            Err(Diagnostic::type_error(
                "T-MONEY-MIX",
                format!(
                    "cannot combine {} with {}: money arithmetic requires a single currency",
                    self.currency, other.currency
                ),
            ))
        }
    }

    pub fn checked_add(&self, other: &Money) -> Result<Money, Diagnostic> {
        self.same_currency(other)?;
        let minor = self.minor.checked_add(other.minor).ok_or_else(|| {
            Diagnostic::value_error("V-MONEY-OVERFLOW", "money addition overflowed")
        })?;
        Ok(Money { minor, ..*self })
    }

    pub fn checked_sub(&self, other: &Money) -> Result<Money, Diagnostic> {
        self.same_currency(other)?;
        let minor = self.minor.checked_sub(other.minor).ok_or_else(|| {
            Diagnostic::value_error("V-MONEY-OVERFLOW", "money subtraction overflowed")
        })?;
        Ok(Money { minor, ..*self })
    }

    pub fn mul_int(&self, scalar: i64) -> Result<Money, Diagnostic> {
        let minor = self.minor.checked_mul(scalar).ok_or_else(|| {
            Diagnostic::value_error("V-MONEY-OVERFLOW", "money multiplication overflowed")
        })?;
        Ok(Money { minor, ..*self })
    }

    /// Multiply by a float scalar, rounding half-to-even at the currency
    /// scale.
    pub fn mul_float(&self, scalar: f64) -> Result<Money, Diagnostic> {
        if !scalar.is_finite() {
            return Err(Diagnostic::value_error(
                "V-MONEY-NAN",
                "money multiplication requires a finite scalar",
            ));
        }
        let product = self.minor as f64 * scalar;
        let rounded = round_half_even(product);
        if rounded.abs() >= i64::MAX as f64 {
            return Err(Diagnostic::value_error(
                "V-MONEY-OVERFLOW",
                "money multiplication overflowed",
            ));
        }
        Ok(Money {
            minor: rounded as i64,
            ..*self
        })
    }

    pub fn negate(&self) -> Result<Money, Diagnostic> {
        let minor = self.minor.checked_neg().ok_or_else(|| {
            Diagnostic::value_error("V-MONEY-OVERFLOW", "money negation overflowed")
        })?;
        Ok(Money { minor, ..*self })
    }
}

fn round_half_even(x: f64) -> f64 {
    let floor = x.floor();
    let frac = x - floor;
    if (frac - 0.5).abs() < f64::EPSILON {
        if (floor as i64) % 2 == 0 {
            floor
        } else {
            floor + 1.0
        }
    } else {
        x.round()
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}#{}", self.currency, self.minor);
        }
        let divisor = 10_i64.pow(self.scale as u32);
        let whole = self.minor / divisor;
        let frac = (self.minor % divisor).abs();
        write!(
            f,
            "{}#{}.{:0width$}",
            self.currency,
            whole,
            frac,
            width = self.scale as usize
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usd(minor: i64) -> Money {
        Money::new(currency_by_code("USD").unwrap(), minor)
    }

    fn jpy(minor: i64) -> Money {
        Money::new(currency_by_code("JPY").unwrap(), minor)
    }

    #[test]
    fn addition_is_scale_preserving() {
        let sum = usd(1234).checked_add(&usd(1)).unwrap();
        assert_eq!(sum.minor, 1235);
        assert_eq!(sum.scale, 2);
    }

    #[test]
    fn mixing_currencies_is_a_type_error() {
        let err = usd(100).checked_add(&jpy(100)).unwrap_err();
        assert_eq!(err.class, crate::error::DiagnosticClass::Type);
    }

    #[test]
    fn integer_scalar_multiplication() {
        assert_eq!(jpy(100).mul_int(2).unwrap().minor, 200);
    }

    #[test]
    fn float_multiplication_rounds_half_even() {
        // 0.125 * 100 minor = 12.5 -> banker's rounding lands on 12
        assert_eq!(usd(100).mul_float(0.125).unwrap().minor, 12);
        // 0.135 * 100 minor = 13.5 -> 14 (nearest even)
        assert_eq!(usd(100).mul_float(0.135).unwrap().minor, 14);
    }

    #[test]
    fn display_uses_currency_scale() {
        assert_eq!(usd(1234).to_string(), "USD#12.34");
        assert_eq!(jpy(200).to_string(), "JPY#200");
    }

    #[test]
    fn symbol_table_prefers_longest_prefix() {
        let symbols = currency_symbols();
        let ca = symbols.iter().position(|s| *s == "CA$").unwrap();
        let dollar = symbols.iter().position(|s| *s == "$").unwrap();
        assert!(ca < dollar);
    }
}
