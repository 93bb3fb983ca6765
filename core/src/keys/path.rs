//! Augmented derivation path grammar.
//!
//! Paths look like `m/schema:1'/recovery:1'/external:1/7`: every segment may carry a
//! human-readable comment before the index, and the root label is free-form. Comments and
//! the root label are kept for display but never take part in comparisons.

use crate::error::{Error, Result};
use bitcoin::bip32;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// First index reserved for hardened children.
pub const HARDENED_OFFSET: u32 = 1 << 31;

/// A single path segment.
#[derive(Debug, Clone, Eq)]
pub struct ChildNumber {
    index: u32,
    hardened: bool,
    comment: Option<String>,
}

impl ChildNumber {
    /// A non-hardened child. Fails if `index` does not fit in 31 bits.
    pub fn normal(index: u32) -> Result<Self> {
        Self::new(index, false, None)
    }

    /// A hardened child. Fails if `index` does not fit in 31 bits.
    pub fn hardened(index: u32) -> Result<Self> {
        Self::new(index, true, None)
    }

    pub fn new(index: u32, hardened: bool, comment: Option<String>) -> Result<Self> {
        if index >= HARDENED_OFFSET {
            return Err(Error::InvalidDerivationPath(format!(
                "index {} out of range",
                index
            )));
        }
        Ok(Self {
            index,
            hardened,
            comment,
        })
    }

    /// A labeled segment for a fixed index. The index is masked to 31 bits.
    pub(crate) fn labeled(index: u32, hardened: bool, comment: &str) -> Self {
        Self {
            index: index & !HARDENED_OFFSET,
            hardened,
            comment: Some(comment.to_string()),
        }
    }

    /// Attach a comment, replacing any previous one.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_hardened(&self) -> bool {
        self.hardened
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub(crate) fn to_bip32(&self) -> bip32::ChildNumber {
        if self.hardened {
            bip32::ChildNumber::Hardened { index: self.index }
        } else {
            bip32::ChildNumber::Normal { index: self.index }
        }
    }
}

impl PartialEq for ChildNumber {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.hardened == other.hardened
    }
}

impl Hash for ChildNumber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.hardened.hash(state);
    }
}

impl fmt::Display for ChildNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(comment) = &self.comment {
            write!(f, "{}:", comment)?;
        }
        write!(f, "{}", self.index)?;
        if self.hardened {
            write!(f, "'")?;
        }
        Ok(())
    }
}

impl FromStr for ChildNumber {
    type Err = Error;

    fn from_str(segment: &str) -> Result<Self> {
        let invalid = || Error::InvalidDerivationPath(format!("invalid segment '{}'", segment));

        let (comment, rest) = match segment.split_once(':') {
            Some((comment, rest)) => {
                if comment.is_empty()
                    || !comment
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                {
                    return Err(invalid());
                }
                (Some(comment.to_string()), rest)
            }
            None => (None, segment),
        };

        let (digits, hardened) = match rest.strip_suffix(['\'', 'h', 'H']) {
            Some(digits) => (digits, true),
            None => (rest, false),
        };

        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }

        let index: u32 = digits.parse().map_err(|_| invalid())?;
        ChildNumber::new(index, hardened, comment)
    }
}

/// An absolute derivation path.
#[derive(Debug, Clone, Eq)]
pub struct DerivationPath {
    root: String,
    children: Vec<ChildNumber>,
}

impl DerivationPath {
    /// The root path `m`.
    pub fn master() -> Self {
        Self {
            root: "m".to_string(),
            children: Vec::new(),
        }
    }

    pub fn root_label(&self) -> &str {
        &self.root
    }

    pub fn children(&self) -> &[ChildNumber] {
        &self.children
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Index of the last segment, or 0 for a root path.
    pub fn last_index(&self) -> u32 {
        self.children.last().map(|c| c.index).unwrap_or(0)
    }

    /// Whether any segment is hardened.
    pub fn has_hardened(&self) -> bool {
        self.children.iter().any(|c| c.hardened)
    }

    /// A new path with `child` appended.
    pub fn child(&self, child: ChildNumber) -> Self {
        let mut children = self.children.clone();
        children.push(child);
        Self {
            root: self.root.clone(),
            children,
        }
    }

    /// A new path with every segment of `relative` appended.
    pub fn extend(&self, relative: &[ChildNumber]) -> Self {
        let mut children = self.children.clone();
        children.extend_from_slice(relative);
        Self {
            root: self.root.clone(),
            children,
        }
    }

    /// Append a textual relative path such as `invoices:4/12/9`.
    pub fn join(&self, relative: &str) -> Result<Self> {
        let segments = relative
            .split('/')
            .map(ChildNumber::from_str)
            .collect::<Result<Vec<_>>>()?;
        Ok(self.extend(&segments))
    }

    /// Whether `self` is a (possibly equal) prefix of `other`, ignoring comments.
    pub fn is_prefix_of(&self, other: &DerivationPath) -> bool {
        self.children.len() <= other.children.len()
            && self
                .children
                .iter()
                .zip(other.children.iter())
                .all(|(a, b)| a == b)
    }

    /// The segments of `self` below `prefix`, or `None` if `prefix` is not a prefix.
    pub fn indexes_from(&self, prefix: &DerivationPath) -> Option<&[ChildNumber]> {
        if prefix.is_prefix_of(self) {
            Some(&self.children[prefix.children.len()..])
        } else {
            None
        }
    }

    /// `m/i[']/...` without comments or custom root label.
    pub fn canonical(&self) -> String {
        let mut out = String::from("m");
        for child in &self.children {
            out.push('/');
            out.push_str(&child.index.to_string());
            if child.hardened {
                out.push('\'');
            }
        }
        out
    }

    pub(crate) fn to_bip32(&self) -> bip32::DerivationPath {
        bip32::DerivationPath::from(
            self.children
                .iter()
                .map(ChildNumber::to_bip32)
                .collect::<Vec<_>>(),
        )
    }
}

impl PartialEq for DerivationPath {
    fn eq(&self, other: &Self) -> bool {
        self.children == other.children
    }
}

impl Hash for DerivationPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.children.hash(state);
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)?;
        for child in &self.children {
            write!(f, "/{}", child)?;
        }
        Ok(())
    }
}

impl FromStr for DerivationPath {
    type Err = Error;

    fn from_str(path: &str) -> Result<Self> {
        let mut segments = path.split('/');
        // `split` always yields at least one item.
        let root = segments.next().unwrap_or_default();

        if root
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '_'))
        {
            return Err(Error::InvalidDerivationPath(format!(
                "invalid root label in '{}'",
                path
            )));
        }

        let children = segments
            .map(|segment| {
                ChildNumber::from_str(segment).map_err(|e| {
                    Error::InvalidDerivationPath(format!("'{}': {}", path, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            root: root.to_string(),
            children,
        })
    }
}

impl Serialize for DerivationPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DerivationPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        DerivationPath::from_str(&s).map_err(serde::de::Error::custom)
    }
}
