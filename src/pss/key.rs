//! External identifiers and their total order
//!
//! Callers name vectors with whatever id type they have — integers,
//! floats, strings. The external-id index is an ordered map, so a total
//! order over that heterogeneous space is normative (it governs on-disk
//! node layout): same-type keys compare natively; cross-type keys compare
//! by a stable type tag, with canonical string form as the final tie
//! break. Numeric keys canonicalize to one width — `42` and `42.0` are
//! the same key.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A caller-supplied vector identifier.
///
/// Construct through the `From` impls (or [`ExternalId::float`]), which
/// canonicalize integral floats down to `Int`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExternalId {
    Int(i64),
    Float(f64),
    Str(String),
}

impl ExternalId {
    /// Canonicalizing float constructor: `2.0` becomes `Int(2)`.
    pub fn float(f: f64) -> Self {
        if f.fract() == 0.0 && f.is_finite() && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
            ExternalId::Int(f as i64)
        } else {
            ExternalId::Float(f)
        }
    }

    /// Stable tag ordering heterogeneous types: numbers before strings.
    fn type_rank(&self) -> u8 {
        match self {
            ExternalId::Int(_) | ExternalId::Float(_) => 0,
            ExternalId::Str(_) => 1,
        }
    }

    /// Canonical display form, the final tie break of the total order.
    pub fn canonical(&self) -> String {
        match self {
            ExternalId::Int(i) => i.to_string(),
            ExternalId::Float(f) => f.to_string(),
            ExternalId::Str(s) => s.clone(),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            ExternalId::Int(i) => Some(*i as f64),
            ExternalId::Float(f) => Some(*f),
            ExternalId::Str(_) => None,
        }
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl From<i64> for ExternalId {
    fn from(v: i64) -> Self {
        ExternalId::Int(v)
    }
}

impl From<u32> for ExternalId {
    fn from(v: u32) -> Self {
        ExternalId::Int(v as i64)
    }
}

impl From<u64> for ExternalId {
    fn from(v: u64) -> Self {
        // Positions and internal ids stay well under i64::MAX
        ExternalId::Int(v as i64)
    }
}

impl From<f64> for ExternalId {
    fn from(v: f64) -> Self {
        ExternalId::float(v)
    }
}

impl From<&str> for ExternalId {
    fn from(v: &str) -> Self {
        ExternalId::Str(v.to_string())
    }
}

impl From<String> for ExternalId {
    fn from(v: String) -> Self {
        ExternalId::Str(v)
    }
}

impl Ord for ExternalId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.as_f64(), other.as_f64()) {
            // Both numeric: canonical numeric width is f64; exact i64
            // compare when both sides are ints (no precision loss).
            (Some(a), Some(b)) => {
                if let (ExternalId::Int(x), ExternalId::Int(y)) = (self, other) {
                    return x.cmp(y);
                }
                a.total_cmp(&b)
            }
            _ => self
                .type_rank()
                .cmp(&other.type_rank())
                .then_with(|| match (self, other) {
                    (ExternalId::Str(a), ExternalId::Str(b)) => a.cmp(b),
                    _ => self.canonical().cmp(&other.canonical()),
                }),
        }
    }
}

impl PartialOrd for ExternalId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ExternalId {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ExternalId {}
