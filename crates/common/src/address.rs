//! # Ledger Addresses and Amount Encoding
//!
//! [`Address`] is a 20-byte account identifier rendered as lowercase
//! `0x`-prefixed hex. Parsing is case-insensitive so that checksummed
//! addresses coming from upstream trackers map to the same key.
//!
//! Ledger amounts are held as `u128` in memory. On disk they are stored as
//! decimal strings (see [`amount_str`]) so that JSON consumers that parse
//! numbers as `f64` never lose precision.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

// ════════════════════════════════════════════════════════════════════════════════
// ADDRESS
// ════════════════════════════════════════════════════════════════════════════════

/// 20-byte ledger account address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 20]);

/// Error returned when an address string cannot be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddressError {
    /// Input is not 40 hex characters (after the optional `0x` prefix).
    #[error("invalid address length: expected 40 hex chars, got {0}")]
    InvalidLength(usize),
    /// Input contains non-hex characters.
    #[error("invalid address hex: {0}")]
    InvalidHex(String),
}

impl Address {
    /// Returns the raw address bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase `0x`-prefixed hex representation.
    #[must_use]
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let body = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if body.len() != 40 {
            return Err(AddressError::InvalidLength(body.len()));
        }

        let mut bytes = [0u8; 20];
        hex::decode_to_slice(body, &mut bytes)
            .map_err(|e| AddressError::InvalidHex(e.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

struct AddressVisitor;

impl<'de> Visitor<'de> for AddressVisitor {
    type Value = Address;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a 20-byte hex address string")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Address, E> {
        v.parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(AddressVisitor)
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// AMOUNT SERDE
// ════════════════════════════════════════════════════════════════════════════════

/// Serde helpers for `u128` amounts stored as decimal strings.
///
/// Accepts both strings and plain JSON integers on input.
pub mod amount_str {
    use std::fmt;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        deserializer.deserialize_any(AmountVisitor)
    }

    struct AmountVisitor;

    impl<'de> Visitor<'de> for AmountVisitor {
        type Value = u128;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a non-negative integer amount or decimal string")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u128, E> {
            Ok(u128::from(v))
        }

        fn visit_u128<E: de::Error>(self, v: u128) -> Result<u128, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u128, E> {
            u128::try_from(v).map_err(|_| E::custom(format!("negative amount: {}", v)))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u128, E> {
            v.trim()
                .parse::<u128>()
                .map_err(|_| E::custom(format!("invalid amount: '{}'", v)))
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[test]
    fn parse_is_case_insensitive() {
        let lower: Address = "0xabcdefabcdefabcdefabcdefabcdefabcdefabcd".parse().unwrap();
        let upper: Address = "0xABCDEFABCDEFABCDEFABCDEFABCDEFABCDEFABCD".parse().unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower.to_string(), "0xabcdefabcdefabcdefabcdefabcdefabcdefabcd");
    }

    #[test]
    fn parse_without_prefix() {
        let a: Address = "1111111111111111111111111111111111111111".parse().unwrap();
        assert_eq!(a, Address([0x11; 20]));
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert_eq!("0x1234".parse::<Address>(), Err(AddressError::InvalidLength(4)));
        assert!(matches!(
            "0xzz11111111111111111111111111111111111111".parse::<Address>(),
            Err(AddressError::InvalidHex(_))
        ));
    }

    #[test]
    fn address_as_json_map_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(Address([0x22; 20]), 5u32);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"0x2222222222222222222222222222222222222222":5}"#);

        let back: std::collections::BTreeMap<Address, u32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Holder {
        #[serde(with = "amount_str")]
        amount: u128,
    }

    #[test]
    fn amount_accepts_string_and_number() {
        let from_str: Holder =
            serde_json::from_str(r#"{"amount":"340282366920938463463374607431768211455"}"#)
                .unwrap();
        assert_eq!(from_str.amount, u128::MAX);

        let from_num: Holder = serde_json::from_str(r#"{"amount":42}"#).unwrap();
        assert_eq!(from_num.amount, 42);

        let json = serde_json::to_string(&Holder { amount: 7 }).unwrap();
        assert_eq!(json, r#"{"amount":"7"}"#);
    }

    #[test]
    fn amount_rejects_negative() {
        assert!(serde_json::from_str::<Holder>(r#"{"amount":-1}"#).is_err());
        assert!(serde_json::from_str::<Holder>(r#"{"amount":"abc"}"#).is_err());
    }
}
