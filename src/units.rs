//! Fixed-point helpers for 18-decimal amounts.

use serde::{Deserialize, Serialize};

use crate::ledger::Amount;

pub const DEFAULT_DECIMALS: u8 = 18;

/// `10^decimals`, or `None` when it does not fit in an [`Amount`].
pub fn scale(decimals: u8) -> Option<Amount> {
    10u128.checked_pow(u32::from(decimals))
}

/// `whole` tokens at the default 18 decimals.
pub fn tokens(whole: u64) -> Amount {
    Amount::from(whole) * 1_000_000_000_000_000_000
}

/// Ether shares the 18-decimal scaling of the token.
pub fn ether(whole: u64) -> Amount {
    tokens(whole)
}

/// Parses `"12"`, `"1.5"` or `".25"` into base units.
///
/// Returns `None` on malformed input, on more fractional digits than
/// `decimals`, or on overflow.
pub fn parse_units(s: &str, decimals: u8) -> Option<Amount> {
    let s = s.trim();
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if frac.len() > usize::from(decimals) {
        return None;
    }
    let unit = scale(decimals)?;
    let whole: Amount = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut frac_units: Amount = if frac.is_empty() { 0 } else { frac.parse().ok()? };
    for _ in frac.len()..usize::from(decimals) {
        frac_units = frac_units.checked_mul(10)?;
    }
    whole.checked_mul(unit)?.checked_add(frac_units)
}

/// Serde adapter writing an [`Amount`] as a decimal string.
///
/// Records travel through internally tagged enums, whose buffering cannot
/// carry integers wider than 64 bits, and `serde_json::Value` has the same
/// limit; a string keeps every digit. Plain JSON numbers are still accepted
/// on input.
pub mod decimal {
    use std::fmt;

    use serde::{de, Deserializer, Serializer};

    use crate::ledger::Amount;

    pub fn serialize<S: Serializer>(amount: &Amount, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(amount)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
        deserializer.deserialize_any(DecimalVisitor)
    }

    struct DecimalVisitor;

    impl<'de> de::Visitor<'de> for DecimalVisitor {
        type Value = Amount;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a non-negative integer amount")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
            Ok(Amount::from(v))
        }

        fn visit_u128<E: de::Error>(self, v: u128) -> Result<Amount, E> {
            Ok(v)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
            v.parse().map_err(E::custom)
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Decimal(#[serde(with = "decimal")] Amount);

/// [`decimal`] for every value of a `BTreeMap<K, Amount>`.
pub mod decimal_map {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::Decimal;
    use crate::ledger::Amount;

    pub fn serialize<K, S>(map: &BTreeMap<K, Amount>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize,
        S: Serializer,
    {
        serializer.collect_map(map.iter().map(|(key, amount)| (key, Decimal(*amount))))
    }

    pub fn deserialize<'de, K, D>(deserializer: D) -> Result<BTreeMap<K, Amount>, D::Error>
    where
        K: Deserialize<'de> + Ord,
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<K, Decimal>::deserialize(deserializer)?;
        Ok(raw.into_iter().map(|(key, amount)| (key, amount.0)).collect())
    }
}

/// [`decimal`] for the leaves of a two-level `BTreeMap<K, BTreeMap<V, Amount>>`.
pub mod nested_decimal_map {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::Decimal;
    use crate::ledger::Amount;

    type Nested<K, V> = BTreeMap<K, BTreeMap<V, Amount>>;

    pub fn serialize<K, V, S>(map: &Nested<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize,
        V: Serialize + Ord,
        S: Serializer,
    {
        serializer.collect_map(map.iter().map(|(outer, inner)| {
            let inner: BTreeMap<&V, Decimal> = inner
                .iter()
                .map(|(key, amount)| (key, Decimal(*amount)))
                .collect();
            (outer, inner)
        }))
    }

    pub fn deserialize<'de, K, V, D>(deserializer: D) -> Result<Nested<K, V>, D::Error>
    where
        K: Deserialize<'de> + Ord,
        V: Deserialize<'de> + Ord,
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<K, BTreeMap<V, Decimal>>::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .map(|(outer, inner)| {
                let inner = inner.into_iter().map(|(key, amount)| (key, amount.0)).collect();
                (outer, inner)
            })
            .collect())
    }
}

/// Renders base units as a decimal string, trimming trailing zeros.
pub fn format_units(amount: Amount, decimals: u8) -> String {
    let Some(unit) = scale(decimals) else {
        return amount.to_string();
    };
    let whole = amount / unit;
    let frac = amount % unit;
    if frac == 0 {
        return whole.to_string();
    }
    let digits = format!("{:0width$}", frac, width = usize::from(decimals));
    format!("{whole}.{}", digits.trim_end_matches('0'))
}
