//! Locations in the hierarchical store.
//!
//! A [`Path`] is an immutable sequence of [`ChildKey`]s. Keys have a total,
//! deterministic order: keys that read as 32-bit integers come first in
//! numeric order, every other key follows in byte order.

use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Maximum number of keys in a path.
pub const MAX_PATH_DEPTH: usize = 32;

/// Maximum length of a single key, in bytes.
pub const MAX_KEY_BYTES: usize = 768;

const FORBIDDEN_KEY_CHARS: [char; 5] = ['.', '#', '$', '[', ']'];

/// A single segment of a path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChildKey(String);

impl ChildKey {
    /// Create a validated key.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        validate_key(&key).map_err(|reason| Error::invalid_path(key.clone(), reason))?;
        Ok(Self(key))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn as_int(&self) -> Option<i32> {
        let s = self.0.as_str();
        let digits = s.strip_prefix('-').unwrap_or(s);
        let canonical = !digits.is_empty()
            && digits.bytes().all(|b| b.is_ascii_digit())
            && (digits == "0" || !digits.starts_with('0'))
            && s != "-0";
        if canonical {
            s.parse().ok()
        } else {
            None
        }
    }
}

fn validate_key(key: &str) -> std::result::Result<(), String> {
    if key.is_empty() {
        return Err("key is empty".into());
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(format!("key longer than {MAX_KEY_BYTES} bytes"));
    }
    if let Some(c) = key
        .chars()
        .find(|c| FORBIDDEN_KEY_CHARS.contains(c) || c.is_ascii_control() || *c == '/')
    {
        return Err(format!("key contains forbidden character {c:?}"));
    }
    Ok(())
}

impl Ord for ChildKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.as_int(), other.as_int()) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for ChildKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl TryFrom<String> for ChildKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        ChildKey::new(value)
    }
}

impl From<ChildKey> for String {
    fn from(key: ChildKey) -> Self {
        key.0
    }
}

impl fmt::Display for ChildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A location in the tree, relative to the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Path {
    keys: Vec<ChildKey>,
}

impl Path {
    /// The root path.
    pub fn root() -> Self {
        Self { keys: Vec::new() }
    }

    /// Parse a `/`-separated path. Empty segments are ignored.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut keys = Vec::new();
        for segment in raw.split('/').filter(|s| !s.is_empty()) {
            validate_key(segment).map_err(|reason| Error::invalid_path(raw, reason))?;
            keys.push(ChildKey(segment.to_string()));
        }
        if keys.len() > MAX_PATH_DEPTH {
            return Err(Error::invalid_path(
                raw,
                format!("deeper than {MAX_PATH_DEPTH} keys"),
            ));
        }
        Ok(Self { keys })
    }

    /// Build a path from already validated keys.
    pub fn from_keys(keys: impl IntoIterator<Item = ChildKey>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }

    /// Path of a direct child.
    pub fn child(&self, key: &ChildKey) -> Self {
        let mut keys = self.keys.clone();
        keys.push(key.clone());
        Self { keys }
    }

    /// Concatenate a relative path onto this one.
    pub fn join(&self, relative: &Path) -> Self {
        let mut keys = self.keys.clone();
        keys.extend(relative.keys.iter().cloned());
        Self { keys }
    }

    /// Parent path, `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        let (_, init) = self.keys.split_last()?;
        Some(Self {
            keys: init.to_vec(),
        })
    }

    /// First key, `None` for the root.
    pub fn front(&self) -> Option<&ChildKey> {
        self.keys.first()
    }

    /// Last key, `None` for the root.
    pub fn back(&self) -> Option<&ChildKey> {
        self.keys.last()
    }

    /// The path without its first key.
    pub fn pop_front(&self) -> Self {
        Self {
            keys: self.keys.iter().skip(1).cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_root(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ChildKey> {
        self.keys.iter()
    }

    /// True when `self` is an ancestor of `other` or equal to it.
    pub fn contains(&self, other: &Path) -> bool {
        self.keys.len() <= other.keys.len() && other.keys.starts_with(&self.keys)
    }

    /// True when one path contains the other.
    pub fn is_related(&self, other: &Path) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// `descendant` expressed relative to `self`, if `self` contains it.
    pub fn relative(&self, descendant: &Path) -> Option<Self> {
        if self.contains(descendant) {
            Some(Self {
                keys: descendant.keys[self.keys.len()..].to_vec(),
            })
        } else {
            None
        }
    }
}

impl FromStr for Path {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Path::parse(s)
    }
}

impl TryFrom<String> for Path {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Path::parse(&value)
    }
}

impl From<Path> for String {
    fn from(path: Path) -> Self {
        path.to_string()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.keys.is_empty() {
            return f.write_str("/");
        }
        for key in &self.keys {
            write!(f, "/{key}")?;
        }
        Ok(())
    }
}
