//! Key-value backend abstraction for sharekv
//!
//! Both the RPC host and direct-mode dispatch talk to a `Backend`. The
//! RocksDB-backed `Store` is the real one; `MemStore` backs unit tests.
use crate::common::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// A key with its value, as returned by range scans
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Entry {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// One write inside an atomic batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl BatchOp {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        BatchOp::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        BatchOp::Delete { key: key.into() }
    }
}

/// Range options for scans, leveldown style.
///
/// `gt`/`gte` bound the low end and `lt`/`lte` the high end; when both
/// flavours of one end are set the exclusive one wins. `reverse` walks from
/// the high end down. `limit` caps the number of entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRange {
    pub gt: Option<Vec<u8>>,
    pub gte: Option<Vec<u8>>,
    pub lt: Option<Vec<u8>>,
    pub lte: Option<Vec<u8>>,
    pub reverse: bool,
    pub limit: Option<usize>,
}

impl ScanRange {
    /// Everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Every key starting with `prefix`.
    pub fn prefix(prefix: impl Into<Vec<u8>>) -> Self {
        let prefix = prefix.into();
        let mut upper = prefix.clone();
        // Smallest key greater than every key with this prefix
        while let Some(last) = upper.pop() {
            if last < u8::MAX {
                upper.push(last + 1);
                break;
            }
        }
        Self {
            gte: Some(prefix),
            lt: if upper.is_empty() { None } else { Some(upper) },
            ..Self::default()
        }
    }

    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Does `key` satisfy the low bound?
    pub fn above_lower(&self, key: &[u8]) -> bool {
        match (&self.gt, &self.gte) {
            (Some(gt), _) => key > gt.as_slice(),
            (None, Some(gte)) => key >= gte.as_slice(),
            (None, None) => true,
        }
    }

    /// Does `key` satisfy the high bound?
    pub fn below_upper(&self, key: &[u8]) -> bool {
        match (&self.lt, &self.lte) {
            (Some(lt), _) => key < lt.as_slice(),
            (None, Some(lte)) => key <= lte.as_slice(),
            (None, None) => true,
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.above_lower(key) && self.below_upper(key)
    }

    /// Key an iterator should seek to before walking the range.
    pub fn seek_key(&self) -> Option<&[u8]> {
        if self.reverse {
            self.lt.as_deref().or(self.lte.as_deref())
        } else {
            self.gt.as_deref().or(self.gte.as_deref())
        }
    }

    /// Has an ordered walk moved past the far end of the range?
    pub fn is_exhausted_at(&self, key: &[u8]) -> bool {
        if self.reverse {
            !self.above_lower(key)
        } else {
            !self.below_upper(key)
        }
    }

    /// Collect a range out of an already ordered walk (ascending when
    /// `reverse` is false, descending otherwise).
    pub fn collect<I>(&self, walk: I) -> Result<Vec<Entry>>
    where
        I: IntoIterator<Item = Result<(Vec<u8>, Vec<u8>)>>,
    {
        let limit = self.limit.unwrap_or(usize::MAX);
        let mut entries = Vec::new();
        if limit == 0 {
            return Ok(entries);
        }
        for item in walk {
            let (key, value) = item?;
            if self.is_exhausted_at(&key) {
                break;
            }
            if !self.contains(&key) {
                continue;
            }
            entries.push(Entry { key, value });
            if entries.len() >= limit {
                break;
            }
        }
        Ok(entries)
    }
}

/// Trait for key-value storage backends
pub trait Backend: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;
    /// Apply every op or none of them.
    fn batch(&self, ops: &[BatchOp]) -> Result<()>;
    fn scan(&self, range: &ScanRange) -> Result<Vec<Entry>>;
}

/// In-memory store
#[derive(Default)]
pub struct MemStore {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Backend for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map.lock().unwrap().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }

    fn batch(&self, ops: &[BatchOp]) -> Result<()> {
        let mut map = self.map.lock().unwrap();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key.clone(), value.clone());
                }
                BatchOp::Delete { key } => {
                    map.remove(key);
                }
            }
        }
        Ok(())
    }

    fn scan(&self, range: &ScanRange) -> Result<Vec<Entry>> {
        let map = self.map.lock().unwrap();
        let walk = map.iter().map(|(k, v)| Ok((k.clone(), v.clone())));
        if range.reverse {
            range.collect(walk.rev())
        } else {
            range.collect(walk)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled() -> MemStore {
        let store = MemStore::new();
        for key in ["a", "b", "c", "d", "e"] {
            store.put(key.as_bytes(), key.to_uppercase().as_bytes()).unwrap();
        }
        store
    }

    fn keys(entries: Vec<Entry>) -> Vec<String> {
        entries
            .into_iter()
            .map(|e| String::from_utf8(e.key).unwrap())
            .collect()
    }

    #[test]
    fn test_memstore_basic() {
        let store = MemStore::new();
        store.put(b"k", b"v").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
        store.delete(b"k").unwrap();
        assert_eq!(store.get(b"k").unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_memstore_batch() {
        let store = filled();
        store
            .batch(&[BatchOp::delete("a"), BatchOp::put("z", "Z")])
            .unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);
        assert_eq!(store.get(b"z").unwrap(), Some(b"Z".to_vec()));
    }

    #[test]
    fn test_scan_bounds() {
        let store = filled();
        let range = ScanRange {
            gt: Some(b"a".to_vec()),
            lte: Some(b"d".to_vec()),
            ..ScanRange::default()
        };
        assert_eq!(keys(store.scan(&range).unwrap()), vec!["b", "c", "d"]);

        let range = ScanRange {
            gte: Some(b"b".to_vec()),
            lt: Some(b"e".to_vec()),
            ..ScanRange::default()
        }
        .reverse()
        .limit(2);
        assert_eq!(keys(store.scan(&range).unwrap()), vec!["d", "c"]);
    }

    #[test]
    fn test_scan_limit_zero() {
        let store = filled();
        assert!(store.scan(&ScanRange::all().limit(0)).unwrap().is_empty());
    }

    #[test]
    fn test_prefix_range() {
        let store = MemStore::new();
        for key in ["user:1", "user:2", "userx", "video:1"] {
            store.put(key.as_bytes(), b"").unwrap();
        }
        let found = keys(store.scan(&ScanRange::prefix("user:")).unwrap());
        assert_eq!(found, vec!["user:1", "user:2"]);

        let range = ScanRange::prefix(vec![0xff, 0xff]);
        assert_eq!(range.lt, None);
    }

    #[test]
    fn test_seek_key() {
        let range = ScanRange {
            gte: Some(b"b".to_vec()),
            lte: Some(b"y".to_vec()),
            ..ScanRange::default()
        };
        assert_eq!(range.seek_key(), Some(&b"b"[..]));
        assert_eq!(range.clone().reverse().seek_key(), Some(&b"y"[..]));
    }
}
