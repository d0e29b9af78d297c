//! Dimensions: the name/value pairs that distinguish series instances.
//!
//! A [`DimensionCollection`] keeps its entries ordered by name, so two
//! collections built from the same pairs in any order compare, hash and
//! encode identically. Store keys depend on that: a lookup built at one call
//! site must find the entry written at another.

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::error::{MetricsError, Result};

/// Characters that are percent-escaped inside encoded dimension fields.
///
/// Covers the key delimiter, the pair separators and the glob metacharacters
/// so that neither a decode nor a pattern match can see them inside a value.
const RESERVED: &[char] = &['%', ':', ',', '=', '*', '?', '[', ']', '\\'];

/// A single immutable (name, value) pair, e.g. `platform=ios`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Dimension {
    name: String,
    value: String,
}

impl Dimension {
    /// Creates a dimension after validating its name.
    ///
    /// Names follow the exposition label rule: a letter or underscore, then
    /// letters, digits and underscores. Names starting with `__` are reserved.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name,
            value: value.into(),
        })
    }

    /// The dimension name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The dimension value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(MetricsError::InvalidDimension {
            reason: "dimension name cannot be empty".to_string(),
        });
    };
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(MetricsError::InvalidDimension {
            reason: format!("dimension name '{name}' must start with a letter or underscore"),
        });
    }
    if let Some(c) = chars.find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
        return Err(MetricsError::InvalidDimension {
            reason: format!("invalid character '{c}' in dimension name '{name}'"),
        });
    }
    if name.starts_with("__") {
        return Err(MetricsError::InvalidDimension {
            reason: format!("dimension name '{name}' uses the reserved '__' prefix"),
        });
    }
    Ok(())
}

/// A set of dimensions with unique names, kept sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DimensionCollection(BTreeMap<String, String>);

impl DimensionCollection {
    /// Creates an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a collection from `(name, value)` pairs.
    ///
    /// # Errors
    ///
    /// Fails on an invalid name or when a name appears twice.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut dims = Self::new();
        for (name, value) in pairs {
            dims.try_insert(Dimension::new(name, value)?)?;
        }
        Ok(dims)
    }

    /// Adds a dimension, replacing any existing value under the same name.
    ///
    /// # Errors
    ///
    /// Fails if the name is invalid.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let dim = Dimension::new(name, value)?;
        self.insert(dim);
        Ok(self)
    }

    /// Inserts a dimension, returning the previous value for its name.
    pub fn insert(&mut self, dim: Dimension) -> Option<String> {
        self.0.insert(dim.name, dim.value)
    }

    /// Inserts a dimension, failing if the name is already present.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDimension` on a duplicate name.
    pub fn try_insert(&mut self, dim: Dimension) -> Result<()> {
        if self.0.contains_key(&dim.name) {
            return Err(MetricsError::InvalidDimension {
                reason: format!("duplicate dimension name '{}'", dim.name),
            });
        }
        self.0.insert(dim.name, dim.value);
        Ok(())
    }

    /// Looks up a value by dimension name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Iterates `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of dimensions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no dimensions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `true` if every dimension of `subset` is present here with
    /// the same value.
    #[must_use]
    pub fn contains_all(&self, subset: &Self) -> bool {
        subset
            .0
            .iter()
            .all(|(k, v)| self.0.get(k).is_some_and(|own| own == v))
    }

    /// Canonical encoding: `name=value` pairs sorted by name, joined by `,`.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            escape_into(&mut out, name);
            out.push('=');
            escape_into(&mut out, value);
        }
        out
    }

    /// Parses the output of [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns `InvalidDimension` on a malformed pair, a bad escape sequence
    /// or a duplicated name.
    pub fn decode(encoded: &str) -> Result<Self> {
        let mut dims = Self::new();
        if encoded.is_empty() {
            return Ok(dims);
        }
        for pair in encoded.split(',') {
            let (name, value) = pair.split_once('=').ok_or_else(|| {
                MetricsError::InvalidDimension {
                    reason: format!("dimension pair '{pair}' has no '='"),
                }
            })?;
            dims.try_insert(Dimension::new(unescape(name)?, unescape(value)?)?)?;
        }
        Ok(dims)
    }
}

impl fmt::Display for DimensionCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{name}={value}")?;
        }
        f.write_str("}")
    }
}

impl FromIterator<Dimension> for DimensionCollection {
    fn from_iter<T: IntoIterator<Item = Dimension>>(iter: T) -> Self {
        let mut dims = Self::new();
        for dim in iter {
            dims.insert(dim);
        }
        dims
    }
}

fn escape_into(out: &mut String, raw: &str) {
    for c in raw.chars() {
        if RESERVED.contains(&c) || c.is_control() {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                let _ = write!(out, "%{byte:02X}");
            }
        } else {
            out.push(c);
        }
    }
}

fn unescape(raw: &str) -> Result<String> {
    if !raw.contains('%') {
        return Ok(raw.to_string());
    }
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = raw
                .get(i + 1..i + 3)
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| MetricsError::InvalidDimension {
                    reason: format!("bad escape sequence in '{raw}'"),
                })?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| MetricsError::InvalidDimension {
        reason: format!("escaped value '{raw}' is not valid UTF-8"),
    })
}
