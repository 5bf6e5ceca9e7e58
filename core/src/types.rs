//! Core identifier and value types shared by every Merx service.
//!
//! Aggregates reference each other by id only; the bus carries ids and each
//! service resolves them against its own store. All ids are UUID newtypes so
//! they cannot be mixed up at call sites.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random id.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            #[must_use]
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Returns the inner UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// Identifier of a product aggregate.
    ProductId
);
uuid_id!(
    /// Identifier of an order aggregate.
    OrderId
);
uuid_id!(
    /// Identifier of a stock reservation.
    ReservationId
);
uuid_id!(
    /// Identifier of a customer.
    CustomerId
);

/// A non-negative quantity of stock units.
///
/// Non-negativity is enforced by the type; subtraction is checked so callers
/// must handle underflow explicitly.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(u32);

impl Quantity {
    /// Zero units.
    pub const ZERO: Self = Self(0);

    /// Wrap a unit count.
    #[must_use]
    pub const fn new(units: u32) -> Self {
        Self(units)
    }

    /// Returns the unit count.
    #[must_use]
    pub const fn get(&self) -> u32 {
        self.0
    }

    /// Whether this quantity is zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Saturating addition.
    #[must_use]
    pub const fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    /// Checked subtraction; `None` on underflow.
    #[must_use]
    pub const fn checked_sub(self, other: Self) -> Option<Self> {
        match self.0.checked_sub(other.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors from money construction and arithmetic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MoneyError {
    /// Arithmetic across two different currencies.
    #[error("Currency mismatch: {left} vs {right}")]
    CurrencyMismatch {
        /// Currency on the left-hand side.
        left: Currency,
        /// Currency on the right-hand side.
        right: Currency,
    },

    /// A currency code that is not three ASCII uppercase letters.
    #[error("Invalid ISO-4217 currency code: {0:?}")]
    InvalidCurrency(String),

    /// Decimal overflow during arithmetic.
    #[error("Money arithmetic overflow")]
    Overflow,
}

/// ISO-4217 currency code (three ASCII uppercase letters).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Currency([u8; 3]);

impl Currency {
    /// United States dollar.
    pub const USD: Self = Self(*b"USD");
    /// Euro.
    pub const EUR: Self = Self(*b"EUR");

    /// Parse a currency code.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::InvalidCurrency`] unless the code is exactly
    /// three ASCII uppercase letters.
    pub fn new(code: &str) -> Result<Self, MoneyError> {
        let bytes = code.as_bytes();
        if bytes.len() == 3 && bytes.iter().all(u8::is_ascii_uppercase) {
            Ok(Self([bytes[0], bytes[1], bytes[2]]))
        } else {
            Err(MoneyError::InvalidCurrency(code.to_string()))
        }
    }

    /// Returns the code as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        // Construction guarantees ASCII uppercase.
        std::str::from_utf8(&self.0).unwrap_or("???")
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for Currency {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Currency {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Self::new(&code).map_err(serde::de::Error::custom)
    }
}

/// A monetary amount in a single currency.
///
/// Uses a decimal representation; arithmetic across currencies is rejected
/// rather than silently converted.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    amount: Decimal,
    currency: Currency,
}

impl Money {
    /// Create an amount in the given currency.
    #[must_use]
    pub const fn new(amount: Decimal, currency: Currency) -> Self {
        Self { amount, currency }
    }

    /// Zero in the given currency.
    #[must_use]
    pub const fn zero(currency: Currency) -> Self {
        Self {
            amount: Decimal::ZERO,
            currency,
        }
    }

    /// Returns the decimal amount.
    #[must_use]
    pub const fn amount(&self) -> Decimal {
        self.amount
    }

    /// Returns the currency.
    #[must_use]
    pub const fn currency(&self) -> Currency {
        self.currency
    }

    /// Add two amounts of the same currency.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::CurrencyMismatch`] for differing currencies and
    /// [`MoneyError::Overflow`] on decimal overflow.
    pub fn checked_add(self, other: Self) -> Result<Self, MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch {
                left: self.currency,
                right: other.currency,
            });
        }
        self.amount
            .checked_add(other.amount)
            .map(|amount| Self::new(amount, self.currency))
            .ok_or(MoneyError::Overflow)
    }

    /// Multiply by a unit count.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::Overflow`] on decimal overflow.
    pub fn checked_mul(self, factor: u32) -> Result<Self, MoneyError> {
        self.amount
            .checked_mul(Decimal::from(factor))
            .map(|amount| Self::new(amount, self.currency))
            .ok_or(MoneyError::Overflow)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

/// A single line of an order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    /// Product being ordered.
    pub product_id: ProductId,
    /// Product name, captured at order time for display.
    pub name: String,
    /// Units ordered.
    pub quantity: Quantity,
    /// Price per unit.
    pub unit_price: Money,
}

impl OrderItem {
    /// Create a new line item.
    #[must_use]
    pub const fn new(product_id: ProductId, name: String, quantity: Quantity, unit_price: Money) -> Self {
        Self {
            product_id,
            name,
            quantity,
            unit_price,
        }
    }

    /// Line total (`unit_price * quantity`).
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::Overflow`] on decimal overflow.
    pub fn line_total(&self) -> Result<Money, MoneyError> {
        self.unit_price.checked_mul(self.quantity.get())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn ids_are_distinct_types_and_display_as_uuid() {
        let id = ProductId::new();
        let text = id.to_string();
        assert_eq!(text.parse::<ProductId>().unwrap(), id);
    }

    #[test]
    fn quantity_checked_sub_underflow() {
        let q = Quantity::new(3);
        assert_eq!(q.checked_sub(Quantity::new(2)), Some(Quantity::new(1)));
        assert_eq!(q.checked_sub(Quantity::new(4)), None);
    }

    #[test]
    fn money_same_currency_adds() {
        let a = Money::new(Decimal::new(1050, 2), Currency::USD);
        let b = Money::new(Decimal::new(950, 2), Currency::USD);
        let sum = a.checked_add(b).unwrap();
        assert_eq!(sum.amount(), Decimal::new(2000, 2));
    }

    #[test]
    fn money_mixed_currency_rejected() {
        let usd = Money::new(Decimal::ONE, Currency::USD);
        let eur = Money::new(Decimal::ONE, Currency::EUR);
        assert!(matches!(
            usd.checked_add(eur),
            Err(MoneyError::CurrencyMismatch { .. })
        ));
    }

    #[test]
    fn currency_code_validation() {
        assert!(Currency::new("GBP").is_ok());
        assert!(Currency::new("usd").is_err());
        assert!(Currency::new("USDT").is_err());
    }

    #[test]
    fn line_total_multiplies_by_quantity() {
        let item = OrderItem::new(
            ProductId::new(),
            "Widget".to_string(),
            Quantity::new(3),
            Money::new(Decimal::new(1000, 2), Currency::USD),
        );
        assert_eq!(item.line_total().unwrap().amount(), Decimal::new(3000, 2));
    }
}
