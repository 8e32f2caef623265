use std::{fmt, str::FromStr};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of fractional digits every amount is kept at.
pub const AMOUNT_SCALE: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoneyError {
    #[error("Amount cannot be negative: {0}")]
    NegativeAmount(Decimal),
    #[error("Amount {0} has more than two fractional digits")]
    TooPrecise(Decimal),
    #[error("`{0}` is not a valid amount")]
    Unparsable(String),
    #[error("`{0}` is not a three letter currency code")]
    InvalidCurrency(String),
}

/// Non-negative fixed-point amount with two fractional digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(value: Decimal) -> Result<Self, MoneyError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(MoneyError::NegativeAmount(value));
        }
        if value.normalize().scale() > AMOUNT_SCALE {
            return Err(MoneyError::TooPrecise(value));
        }
        let mut value = value;
        value.rescale(AMOUNT_SCALE);
        Ok(Self(value))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn checked_add(&self, other: &Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    /// `None` when the result would be negative.
    pub fn checked_sub(&self, other: &Amount) -> Option<Amount> {
        let result = self.0.checked_sub(other.0)?;
        if result.is_sign_negative() && !result.is_zero() {
            None
        } else {
            Some(Amount(result))
        }
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value =
            Decimal::from_str(s.trim()).map_err(|_| MoneyError::Unparsable(s.to_owned()))?;
        Self::new(value)
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = MoneyError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl Default for Amount {
    fn default() -> Self {
        Self::ZERO
    }
}

/// ISO-4217 style currency code: three uppercase ASCII letters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Currency {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_ascii_uppercase();
        if code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase()) {
            Ok(Self(code))
        } else {
            Err(MoneyError::InvalidCurrency(s.to_owned()))
        }
    }
}

impl TryFrom<String> for Currency {
    type Error = MoneyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn amounts_are_kept_at_two_digits() {
        let amount = Amount::new(dec!(50)).unwrap();
        assert_eq!(amount.to_string(), "50.00");
        let amount: Amount = "12.5".parse().unwrap();
        assert_eq!(amount.to_string(), "12.50");
        // trailing zeros beyond the scale are harmless
        let amount = Amount::new(dec!(1.100)).unwrap();
        assert_eq!(amount.value(), dec!(1.10));
    }

    #[test]
    fn rejects_invalid_amounts() {
        assert!(matches!(
            Amount::new(dec!(-1)),
            Err(MoneyError::NegativeAmount(_))
        ));
        assert!(matches!(
            Amount::new(dec!(0.001)),
            Err(MoneyError::TooPrecise(_))
        ));
        assert!(matches!(
            "ten".parse::<Amount>(),
            Err(MoneyError::Unparsable(_))
        ));
    }

    #[test]
    fn checked_sub_never_goes_negative() {
        let small = Amount::new(dec!(10)).unwrap();
        let large = Amount::new(dec!(10.01)).unwrap();
        assert!(small.checked_sub(&large).is_none());
        assert_eq!(large.checked_sub(&small).unwrap().value(), dec!(0.01));
        assert_eq!(small.checked_sub(&small).unwrap(), Amount::ZERO);
    }

    #[test]
    fn currency_codes() {
        let usd: Currency = "usd".parse().unwrap();
        assert_eq!(usd.as_str(), "USD");
        assert!("US".parse::<Currency>().is_err());
        assert!("US1".parse::<Currency>().is_err());
        assert!("EURO".parse::<Currency>().is_err());
    }
}
