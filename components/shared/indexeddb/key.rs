/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cmp::Ordering;
use std::mem;

use serde::{Deserialize, Serialize, Serializer};

/// The largest integer a key generator may hand out, 2^53.
/// <https://w3c.github.io/IndexedDB/#key-generator-construct>
pub const MAX_KEY_GENERATOR_VALUE: f64 = 9007199254740992.0;

/// <https://w3c.github.io/IndexedDB/#key-construct>
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum IndexedDBKeyType {
    Number(#[serde(serialize_with = "serialize_key_number")] f64),
    String(String),
    Binary(Vec<u8>),
    Date(#[serde(serialize_with = "serialize_key_number")] f64),
    Array(Vec<IndexedDBKeyType>),
}

impl IndexedDBKeyType {
    /// NaN numbers and dates cannot be keys, and neither can arrays containing them.
    pub fn is_valid(&self) -> bool {
        match self {
            IndexedDBKeyType::Number(n) | IndexedDBKeyType::Date(n) => !n.is_nan(),
            IndexedDBKeyType::String(_) | IndexedDBKeyType::Binary(_) => true,
            IndexedDBKeyType::Array(keys) => keys.iter().all(IndexedDBKeyType::is_valid),
        }
    }

    /// Rough number of bytes this key occupies once stored.
    pub fn size_estimate(&self) -> u64 {
        let overhead = mem::size_of::<IndexedDBKeyType>() as u64;
        match self {
            IndexedDBKeyType::Number(_) | IndexedDBKeyType::Date(_) => overhead,
            IndexedDBKeyType::String(s) => overhead + (s.encode_utf16().count() * 2) as u64,
            IndexedDBKeyType::Binary(b) => overhead + b.len() as u64,
            IndexedDBKeyType::Array(keys) => {
                overhead + keys.iter().map(IndexedDBKeyType::size_estimate).sum::<u64>()
            },
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            IndexedDBKeyType::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            IndexedDBKeyType::Number(_) => 0,
            IndexedDBKeyType::Date(_) => 1,
            IndexedDBKeyType::String(_) => 2,
            IndexedDBKeyType::Binary(_) => 3,
            IndexedDBKeyType::Array(_) => 4,
        }
    }
}

/// Encoded keys are compared bytewise, so both zeros share one encoding.
fn serialize_key_number<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(if *value == 0.0 { 0.0 } else { *value })
}

/// <https://w3c.github.io/IndexedDB/#compare-two-keys>
impl Ord for IndexedDBKeyType {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexedDBKeyType::Number(a), IndexedDBKeyType::Number(b)) |
            (IndexedDBKeyType::Date(a), IndexedDBKeyType::Date(b)) => {
                // -0 and +0 are the same key.
                a.partial_cmp(b).unwrap_or_else(|| a.total_cmp(b))
            },
            (IndexedDBKeyType::String(a), IndexedDBKeyType::String(b)) => {
                a.encode_utf16().cmp(b.encode_utf16())
            },
            (IndexedDBKeyType::Binary(a), IndexedDBKeyType::Binary(b)) => a.cmp(b),
            (IndexedDBKeyType::Array(a), IndexedDBKeyType::Array(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl PartialOrd for IndexedDBKeyType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for IndexedDBKeyType {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexedDBKeyType {}

/// <https://w3c.github.io/IndexedDB/#key-path-construct>
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum KeyPath {
    String(String),
    Sequence(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_order_by_type_then_value() {
        let mut keys = vec![
            IndexedDBKeyType::Array(vec![]),
            IndexedDBKeyType::Binary(vec![1]),
            IndexedDBKeyType::String("b".to_owned()),
            IndexedDBKeyType::String("a".to_owned()),
            IndexedDBKeyType::Date(3.0),
            IndexedDBKeyType::Number(10.0),
            IndexedDBKeyType::Number(-1.0),
        ];
        keys.sort();
        assert_eq!(keys[0], IndexedDBKeyType::Number(-1.0));
        assert_eq!(keys[1], IndexedDBKeyType::Number(10.0));
        assert_eq!(keys[2], IndexedDBKeyType::Date(3.0));
        assert_eq!(keys[3], IndexedDBKeyType::String("a".to_owned()));
        assert_eq!(keys[6], IndexedDBKeyType::Array(vec![]));
    }

    #[test]
    fn negative_zero_is_the_same_key_as_zero() {
        assert_eq!(
            IndexedDBKeyType::Number(-0.0),
            IndexedDBKeyType::Number(0.0)
        );
        assert_eq!(IndexedDBKeyType::Date(0.0), IndexedDBKeyType::Date(-0.0));
        assert_eq!(
            IndexedDBKeyType::Array(vec![IndexedDBKeyType::Number(-0.0)]),
            IndexedDBKeyType::Array(vec![IndexedDBKeyType::Number(0.0)])
        );
        assert!(IndexedDBKeyType::Number(-0.0) > IndexedDBKeyType::Number(-1.0));

        let encode = |key: &IndexedDBKeyType| postcard::to_stdvec(key).unwrap();
        assert_eq!(
            encode(&IndexedDBKeyType::Number(-0.0)),
            encode(&IndexedDBKeyType::Number(0.0))
        );
        assert_eq!(
            encode(&IndexedDBKeyType::Array(vec![IndexedDBKeyType::Date(-0.0)])),
            encode(&IndexedDBKeyType::Array(vec![IndexedDBKeyType::Date(0.0)]))
        );
    }

    #[test]
    fn nan_is_not_a_valid_key() {
        assert!(!IndexedDBKeyType::Number(f64::NAN).is_valid());
        assert!(
            !IndexedDBKeyType::Array(vec![
                IndexedDBKeyType::Number(1.0),
                IndexedDBKeyType::Date(f64::NAN)
            ])
            .is_valid()
        );
        assert!(IndexedDBKeyType::String(String::new()).is_valid());
    }
}
