use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use crate::{prefix_upper_bound, KeyValueBackend, PrefixVisitor, StoreError, WriteOp};

type MemoryStoreMap = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full dump, for byte-level comparisons in tests.
    pub fn snapshot(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let guard = self.inner.read().expect("memory store lock");
        guard
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

impl KeyValueBackend for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        Ok(guard.get(key).cloned())
    }

    fn for_each_prefix(
        &self,
        prefix: &[u8],
        middle: Option<&[u8]>,
        reverse: bool,
        visitor: &mut PrefixVisitor<'_>,
    ) -> Result<(), StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        let start_key = middle.map(|middle| {
            let mut key = prefix.to_vec();
            key.extend_from_slice(middle);
            key
        });

        let lower: Bound<Vec<u8>>;
        let upper: Bound<Vec<u8>>;
        if reverse {
            lower = Bound::Included(prefix.to_vec());
            upper = match start_key {
                Some(key) => Bound::Included(key),
                None => match prefix_upper_bound(prefix) {
                    Some(bound) => Bound::Excluded(bound),
                    None => Bound::Unbounded,
                },
            };
        } else {
            lower = Bound::Included(start_key.unwrap_or_else(|| prefix.to_vec()));
            upper = match prefix_upper_bound(prefix) {
                Some(bound) => Bound::Excluded(bound),
                None => Bound::Unbounded,
            };
        }

        let range = guard.range::<Vec<u8>, _>((lower, upper));
        if reverse {
            for (key, value) in range.rev() {
                debug_assert!(key.starts_with(prefix));
                if !visitor(key, value) {
                    break;
                }
            }
        } else {
            for (key, value) in range {
                debug_assert!(key.starts_with(prefix));
                if !visitor(key, value) {
                    break;
                }
            }
        }
        Ok(())
    }

    fn apply(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    guard.insert(key.as_slice().to_vec(), value.as_slice().to_vec());
                }
                WriteOp::Delete { key } => {
                    guard.remove(key.as_slice());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(store: &MemoryStore, key: &[u8], value: &[u8]) {
        store
            .apply(&[WriteOp::Put {
                key: key.into(),
                value: value.into(),
            }])
            .expect("apply");
    }

    fn collect(
        store: &MemoryStore,
        prefix: &[u8],
        middle: Option<&[u8]>,
        reverse: bool,
    ) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        store
            .for_each_prefix(prefix, middle, reverse, &mut |key, _| {
                keys.push(key.to_vec());
                true
            })
            .expect("iterate");
        keys
    }

    #[test]
    fn prefix_iteration_is_bounded_and_ordered() {
        let store = MemoryStore::new();
        put(&store, b"a/1", b"x");
        put(&store, b"b/1", b"x");
        put(&store, b"b/2", b"y");
        put(&store, b"b/3", b"z");
        put(&store, b"c/1", b"x");

        assert_eq!(
            collect(&store, b"b/", None, false),
            vec![b"b/1".to_vec(), b"b/2".to_vec(), b"b/3".to_vec()]
        );
        assert_eq!(
            collect(&store, b"b/", None, true),
            vec![b"b/3".to_vec(), b"b/2".to_vec(), b"b/1".to_vec()]
        );
    }

    #[test]
    fn middle_restricts_both_directions() {
        let store = MemoryStore::new();
        for suffix in [b"1", b"2", b"3", b"4"] {
            let mut key = b"p/".to_vec();
            key.extend_from_slice(suffix);
            put(&store, &key, b"v");
        }

        assert_eq!(
            collect(&store, b"p/", Some(b"3"), false),
            vec![b"p/3".to_vec(), b"p/4".to_vec()]
        );
        assert_eq!(
            collect(&store, b"p/", Some(b"2"), true),
            vec![b"p/2".to_vec(), b"p/1".to_vec()]
        );
    }

    #[test]
    fn visitor_can_stop_early() {
        let store = MemoryStore::new();
        put(&store, b"k/1", b"a");
        put(&store, b"k/2", b"b");
        let mut seen = 0;
        store
            .for_each_prefix(b"k/", None, false, &mut |_, _| {
                seen += 1;
                false
            })
            .expect("iterate");
        assert_eq!(seen, 1);
    }
}
