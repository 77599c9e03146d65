//! The ordered key-value capability the engine runs on.
//!
//! A store is a collection of named ranges ("sub-trees"). Each range maps byte
//! keys to byte values, supports scans ordered by key, and exposes a mirror
//! ordered by value then key. Writes are atomic per key; nothing spans keys.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RangeKey(String);

impl RangeKey {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RangeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry of a scan.
///
/// Mirror scans swap the roles: `key` holds the stored value and `value`
/// holds the key it was stored under.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Item {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Item {
    #[must_use]
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into(), value: value.into() }
    }
}

/// Bounds, direction and size of a scan. Bounds apply to whatever the scan is
/// ordered by: keys for [`OrderedStore::slice`], values for
/// [`OrderedStore::mirror_slice`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanRange {
    pub min: Option<Vec<u8>>,
    pub max: Option<Vec<u8>>,
    pub min_inclusive: bool,
    pub max_inclusive: bool,
    pub limit: Option<usize>,
    pub reverse: bool,
}

impl ScanRange {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from(min: impl Into<Vec<u8>>, inclusive: bool) -> Self {
        Self { min: Some(min.into()), min_inclusive: inclusive, ..Self::default() }
    }

    #[must_use]
    pub fn up_to(max: impl Into<Vec<u8>>, inclusive: bool) -> Self {
        Self { max: Some(max.into()), max_inclusive: inclusive, ..Self::default() }
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    #[must_use]
    pub fn below_min(&self, candidate: &[u8]) -> bool {
        match &self.min {
            Some(min) if self.min_inclusive => candidate < min.as_slice(),
            Some(min) => candidate <= min.as_slice(),
            None => false,
        }
    }

    #[must_use]
    pub fn above_max(&self, candidate: &[u8]) -> bool {
        match &self.max {
            Some(max) if self.max_inclusive => candidate > max.as_slice(),
            Some(max) => candidate >= max.as_slice(),
            None => false,
        }
    }

    #[must_use]
    pub fn admits(&self, candidate: &[u8]) -> bool {
        !self.below_min(candidate) && !self.above_max(candidate)
    }

    /// Walk an ordered sequence of `(ordering_key, item)` pairs and keep the
    /// ones inside the bounds, honoring direction and limit.
    fn collect<'a, I>(&self, ordered: I) -> Vec<Item>
    where
        I: DoubleEndedIterator<Item = (&'a [u8], Item)>,
    {
        let limit = self.limit.unwrap_or(usize::MAX);
        if self.reverse {
            ordered
                .rev()
                .skip_while(|(position, _)| self.above_max(position))
                .take_while(|(position, _)| !self.below_min(position))
                .take(limit)
                .map(|(_, item)| item)
                .collect()
        } else {
            ordered
                .skip_while(|(position, _)| self.below_min(position))
                .take_while(|(position, _)| !self.above_max(position))
                .take(limit)
                .map(|(_, item)| item)
                .collect()
        }
    }
}

pub trait OrderedStore: Send + Sync {
    /// Insert or overwrite one entry.
    ///
    /// # Errors
    /// Returns [`CoreError::Store`] when the backend rejects the write.
    fn put(&self, range: &RangeKey, key: &[u8], value: &[u8]) -> Result<(), CoreError>;

    /// Read one entry.
    ///
    /// # Errors
    /// Returns [`CoreError::Store`] when the backend read fails.
    fn get(&self, range: &RangeKey, key: &[u8]) -> Result<Option<Vec<u8>>, CoreError>;

    /// Remove one entry, reporting whether it existed.
    ///
    /// # Errors
    /// Returns [`CoreError::Store`] when the backend rejects the delete.
    fn delete(&self, range: &RangeKey, key: &[u8]) -> Result<bool, CoreError>;

    /// Scan entries ordered by key.
    ///
    /// # Errors
    /// Returns [`CoreError::Store`] when the backend scan fails.
    fn slice(&self, range: &RangeKey, scan: &ScanRange) -> Result<Vec<Item>, CoreError>;

    /// Scan entries ordered by value, then key. See [`Item`] for the layout.
    ///
    /// # Errors
    /// Returns [`CoreError::Store`] when the backend scan fails.
    fn mirror_slice(&self, range: &RangeKey, scan: &ScanRange) -> Result<Vec<Item>, CoreError>;

    /// Number of entries in a range.
    ///
    /// # Errors
    /// Returns [`CoreError::Store`] when the backend read fails.
    fn count(&self, range: &RangeKey) -> Result<usize, CoreError>;

    /// Remove every entry in a range.
    ///
    /// # Errors
    /// Returns [`CoreError::Store`] when the backend rejects the delete.
    fn clear(&self, range: &RangeKey) -> Result<(), CoreError>;
}

#[derive(Debug, Default)]
struct RangeData {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    mirror: BTreeSet<(Vec<u8>, Vec<u8>)>,
}

/// Process-local [`OrderedStore`] over `BTreeMap`s.
#[derive(Debug, Default)]
pub struct MemoryStore {
    ranges: RwLock<BTreeMap<RangeKey, RangeData>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl OrderedStore for MemoryStore {
    fn put(&self, range: &RangeKey, key: &[u8], value: &[u8]) -> Result<(), CoreError> {
        let mut ranges = self.ranges.write();
        let data = ranges.entry(range.clone()).or_default();
        if let Some(previous) = data.entries.insert(key.to_vec(), value.to_vec()) {
            data.mirror.remove(&(previous, key.to_vec()));
        }
        data.mirror.insert((value.to_vec(), key.to_vec()));
        Ok(())
    }

    fn get(&self, range: &RangeKey, key: &[u8]) -> Result<Option<Vec<u8>>, CoreError> {
        let ranges = self.ranges.read();
        Ok(ranges.get(range).and_then(|data| data.entries.get(key).cloned()))
    }

    fn delete(&self, range: &RangeKey, key: &[u8]) -> Result<bool, CoreError> {
        let mut ranges = self.ranges.write();
        let Some(data) = ranges.get_mut(range) else {
            return Ok(false);
        };
        let Some(previous) = data.entries.remove(key) else {
            return Ok(false);
        };
        data.mirror.remove(&(previous, key.to_vec()));
        if data.entries.is_empty() {
            ranges.remove(range);
        }
        Ok(true)
    }

    fn slice(&self, range: &RangeKey, scan: &ScanRange) -> Result<Vec<Item>, CoreError> {
        let ranges = self.ranges.read();
        let Some(data) = ranges.get(range) else {
            return Ok(Vec::new());
        };
        Ok(scan.collect(
            data.entries
                .iter()
                .map(|(key, value)| (key.as_slice(), Item::new(key.clone(), value.clone()))),
        ))
    }

    fn mirror_slice(&self, range: &RangeKey, scan: &ScanRange) -> Result<Vec<Item>, CoreError> {
        let ranges = self.ranges.read();
        let Some(data) = ranges.get(range) else {
            return Ok(Vec::new());
        };
        Ok(scan.collect(
            data.mirror
                .iter()
                .map(|(value, key)| (value.as_slice(), Item::new(value.clone(), key.clone()))),
        ))
    }

    fn count(&self, range: &RangeKey) -> Result<usize, CoreError> {
        Ok(self.ranges.read().get(range).map_or(0, |data| data.entries.len()))
    }

    fn clear(&self, range: &RangeKey) -> Result<(), CoreError> {
        self.ranges.write().remove(range);
        Ok(())
    }
}
