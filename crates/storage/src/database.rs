//! Buffered view over a backend: mutations accumulate in an ordered overlay
//! and reach the backend only on [`Database::commit`]. Reads and iteration see
//! the overlay first, so a half-built batch behaves like committed state.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use crate::{
    prefix_upper_bound, KeyValueBackend, PrefixVisitor, StoreError, WriteOp, VERSION_KEY,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenMode {
    /// Fail unless the store already holds a chain.
    OpenExisting,
    /// Initialize a fresh store when empty.
    OpenOrCreate,
}

pub struct Database {
    backend: Arc<dyn KeyValueBackend>,
    overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl Database {
    pub fn open(
        backend: Arc<dyn KeyValueBackend>,
        mode: OpenMode,
        schema_version: &str,
    ) -> Result<Self, StoreError> {
        let mut empty = true;
        backend.for_each_prefix(&[], None, false, &mut |_, _| {
            empty = false;
            false
        })?;

        match backend.get(VERSION_KEY)? {
            Some(found) => {
                let found = String::from_utf8_lossy(&found).into_owned();
                if found != schema_version {
                    return Err(StoreError::VersionMismatch {
                        found,
                        expected: schema_version.to_string(),
                    });
                }
            }
            None if empty => {
                if mode == OpenMode::OpenExisting {
                    return Err(StoreError::EmptyStore);
                }
                backend.apply(&[WriteOp::Put {
                    key: VERSION_KEY.into(),
                    value: schema_version.as_bytes().into(),
                }])?;
            }
            None => {
                return Err(StoreError::VersionMismatch {
                    found: String::new(),
                    expected: schema_version.to_string(),
                });
            }
        }

        Ok(Self {
            backend,
            overlay: BTreeMap::new(),
        })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(pending) = self.overlay.get(key) {
            return Ok(pending.clone());
        }
        self.backend.get(key)
    }

    pub fn put(
        &mut self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        create_only: bool,
    ) -> Result<(), StoreError> {
        let key = key.into();
        if create_only && self.get(&key)?.is_some() {
            return Err(StoreError::AlreadyExists(key));
        }
        self.overlay.insert(key, Some(value.into()));
        Ok(())
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>, must_exist: bool) -> Result<(), StoreError> {
        let key = key.into();
        if must_exist && self.get(&key)?.is_none() {
            return Err(StoreError::NotFound(key));
        }
        self.overlay.insert(key, None);
        Ok(())
    }

    /// Prefix walk over the merged view of overlay and backend.
    pub fn for_each_prefix(
        &self,
        prefix: &[u8],
        middle: Option<&[u8]>,
        reverse: bool,
        visitor: &mut PrefixVisitor<'_>,
    ) -> Result<(), StoreError> {
        let start_key = middle.map(|middle| {
            let mut key = prefix.to_vec();
            key.extend_from_slice(middle);
            key
        });

        let lower: Bound<Vec<u8>>;
        let upper: Bound<Vec<u8>>;
        if reverse {
            lower = Bound::Included(prefix.to_vec());
            upper = match &start_key {
                Some(key) => Bound::Included(key.clone()),
                None => match prefix_upper_bound(prefix) {
                    Some(bound) => Bound::Excluded(bound),
                    None => Bound::Unbounded,
                },
            };
        } else {
            lower = Bound::Included(start_key.clone().unwrap_or_else(|| prefix.to_vec()));
            upper = match prefix_upper_bound(prefix) {
                Some(bound) => Bound::Excluded(bound),
                None => Bound::Unbounded,
            };
        }

        let mut pending: Vec<(&Vec<u8>, &Option<Vec<u8>>)> =
            self.overlay.range::<Vec<u8>, _>((lower, upper)).collect();
        if reverse {
            pending.reverse();
        }
        let mut pending = pending.into_iter().peekable();
        let mut stopped = false;

        self.backend
            .for_each_prefix(prefix, middle, reverse, &mut |key, value| {
                // Emit overlay entries that sort before the backend entry.
                while let Some((pending_key, _)) = pending.peek() {
                    let before = if reverse {
                        pending_key.as_slice() > key
                    } else {
                        pending_key.as_slice() < key
                    };
                    if !before {
                        break;
                    }
                    let (pending_key, pending_value) = pending.next().expect("peeked");
                    if let Some(pending_value) = pending_value {
                        if !visitor(pending_key, pending_value) {
                            stopped = true;
                            return false;
                        }
                    }
                }

                // The overlay shadows the backend at equal keys.
                if let Some((pending_key, _)) = pending.peek() {
                    if pending_key.as_slice() == key {
                        let (pending_key, pending_value) = pending.next().expect("peeked");
                        if let Some(pending_value) = pending_value {
                            if !visitor(pending_key, pending_value) {
                                stopped = true;
                                return false;
                            }
                        }
                        return true;
                    }
                }

                if !visitor(key, value) {
                    stopped = true;
                    return false;
                }
                true
            })?;

        if stopped {
            return Ok(());
        }
        for (pending_key, pending_value) in pending {
            if let Some(pending_value) = pending_value {
                if !visitor(pending_key, pending_value) {
                    break;
                }
            }
        }
        Ok(())
    }

    pub fn first_in_prefix(
        &self,
        prefix: &[u8],
        middle: Option<&[u8]>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.edge_in_prefix(prefix, middle, false)
    }

    pub fn last_in_prefix(
        &self,
        prefix: &[u8],
        middle: Option<&[u8]>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.edge_in_prefix(prefix, middle, true)
    }

    fn edge_in_prefix(
        &self,
        prefix: &[u8],
        middle: Option<&[u8]>,
        reverse: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut found = None;
        self.for_each_prefix(prefix, middle, reverse, &mut |key, value| {
            found = Some((key.to_vec(), value.to_vec()));
            false
        })?;
        Ok(found)
    }

    pub fn pending_ops(&self) -> usize {
        self.overlay.len()
    }

    /// Flushes the buffered window to the backend as one atomic batch.
    pub fn commit(&mut self) -> Result<(), StoreError> {
        if self.overlay.is_empty() {
            return Ok(());
        }
        let ops: Vec<WriteOp> = self
            .overlay
            .iter()
            .map(|(key, value)| match value {
                Some(value) => WriteOp::Put {
                    key: key.clone().into(),
                    value: value.clone().into(),
                },
                None => WriteOp::Delete {
                    key: key.clone().into(),
                },
            })
            .collect();
        self.backend.apply(&ops)?;
        self.overlay.clear();
        Ok(())
    }

    /// Drops the uncommitted window.
    pub fn rollback(&mut self) {
        self.overlay.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    const SCHEMA: &str = "test-schema-1";

    fn open_fresh() -> Database {
        Database::open(Arc::new(MemoryStore::new()), OpenMode::OpenOrCreate, SCHEMA)
            .expect("open database")
    }

    #[test]
    fn open_existing_rejects_empty_store() {
        let backend = Arc::new(MemoryStore::new());
        let result = Database::open(backend, OpenMode::OpenExisting, SCHEMA);
        assert!(matches!(result, Err(StoreError::EmptyStore)));
    }

    #[test]
    fn version_mismatch_fails_open() {
        let backend = Arc::new(MemoryStore::new());
        {
            let mut db = Database::open(Arc::clone(&backend) as Arc<dyn KeyValueBackend>,
                OpenMode::OpenOrCreate, SCHEMA)
                .expect("open");
            db.put(b"x".to_vec(), b"y".to_vec(), true).expect("put");
            db.commit().expect("commit");
        }
        let result = Database::open(backend, OpenMode::OpenOrCreate, "other-schema");
        assert!(matches!(result, Err(StoreError::VersionMismatch { .. })));
    }

    #[test]
    fn reads_see_uncommitted_writes() {
        let mut db = open_fresh();
        db.put(b"a".to_vec(), b"1".to_vec(), true).expect("put");
        assert_eq!(db.get(b"a").expect("get"), Some(b"1".to_vec()));
        db.delete(b"a".to_vec(), true).expect("delete");
        assert_eq!(db.get(b"a").expect("get"), None);
    }

    #[test]
    fn create_only_sees_pending_and_committed_keys() {
        let mut db = open_fresh();
        db.put(b"a".to_vec(), b"1".to_vec(), true).expect("put");
        assert!(matches!(
            db.put(b"a".to_vec(), b"2".to_vec(), true),
            Err(StoreError::AlreadyExists(_))
        ));
        db.commit().expect("commit");
        assert!(matches!(
            db.put(b"a".to_vec(), b"2".to_vec(), true),
            Err(StoreError::AlreadyExists(_))
        ));
        db.put(b"a".to_vec(), b"2".to_vec(), false).expect("update");
    }

    #[test]
    fn delete_must_exist() {
        let mut db = open_fresh();
        assert!(matches!(
            db.delete(b"missing".to_vec(), true),
            Err(StoreError::NotFound(_))
        ));
        db.delete(b"missing".to_vec(), false).expect("tolerated");
    }

    #[test]
    fn merged_iteration_overlays_pending_state() {
        let mut db = open_fresh();
        db.put(b"p/1".to_vec(), b"committed".to_vec(), true).expect("put");
        db.put(b"p/3".to_vec(), b"committed".to_vec(), true).expect("put");
        db.commit().expect("commit");

        db.put(b"p/2".to_vec(), b"pending".to_vec(), true).expect("put");
        db.put(b"p/3".to_vec(), b"updated".to_vec(), false).expect("put");
        db.delete(b"p/1".to_vec(), true).expect("delete");
        db.put(b"p/4".to_vec(), b"pending".to_vec(), true).expect("put");

        let mut forward = Vec::new();
        db.for_each_prefix(b"p/", None, false, &mut |key, value| {
            forward.push((key.to_vec(), value.to_vec()));
            true
        })
        .expect("iterate");
        assert_eq!(
            forward,
            vec![
                (b"p/2".to_vec(), b"pending".to_vec()),
                (b"p/3".to_vec(), b"updated".to_vec()),
                (b"p/4".to_vec(), b"pending".to_vec()),
            ]
        );

        let mut backward = Vec::new();
        db.for_each_prefix(b"p/", None, true, &mut |key, value| {
            backward.push(key.to_vec());
            let _ = value;
            true
        })
        .expect("iterate");
        assert_eq!(
            backward,
            vec![b"p/4".to_vec(), b"p/3".to_vec(), b"p/2".to_vec()]
        );

        assert_eq!(
            db.last_in_prefix(b"p/", None).expect("last"),
            Some((b"p/4".to_vec(), b"pending".to_vec()))
        );
    }

    #[test]
    fn rollback_discards_the_window() {
        let mut db = open_fresh();
        db.put(b"a".to_vec(), b"1".to_vec(), true).expect("put");
        db.commit().expect("commit");
        db.put(b"b".to_vec(), b"2".to_vec(), true).expect("put");
        db.delete(b"a".to_vec(), true).expect("delete");
        db.rollback();
        assert_eq!(db.get(b"a").expect("get"), Some(b"1".to_vec()));
        assert_eq!(db.get(b"b").expect("get"), None);
        assert_eq!(db.pending_ops(), 0);
    }
}
