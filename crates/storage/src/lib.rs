//! Ordered byte-keyed storage for the chain database.
//!
//! Backends implement [`KeyValueBackend`]: a flat ordered map with point
//! reads, prefix-bounded iteration, and atomic batch application. The
//! [`Database`] wrapper layers a read-your-writes overlay on top so callers
//! can build up a block's worth of mutations and commit them as one batch.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

pub mod database;
pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

pub use database::{Database, OpenMode};
pub use memory::MemoryStore;

pub const VERSION_KEY: &[u8] = b"$version";

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
    AlreadyExists(Vec<u8>),
    NotFound(Vec<u8>),
    VersionMismatch { found: String, expected: String },
    EmptyStore,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "{message}"),
            StoreError::AlreadyExists(key) => {
                write!(f, "key already exists: {}", hex_preview(key))
            }
            StoreError::NotFound(key) => write!(f, "key not found: {}", hex_preview(key)),
            StoreError::VersionMismatch { found, expected } => {
                write!(f, "schema version {found:?}, expected {expected:?}")
            }
            StoreError::EmptyStore => write!(f, "store is empty"),
        }
    }
}

impl std::error::Error for StoreError {}

fn hex_preview(key: &[u8]) -> String {
    let mut out = String::with_capacity(key.len() * 2);
    for byte in key.iter().take(24) {
        out.push_str(&format!("{byte:02x}"));
    }
    if key.len() > 24 {
        out.push_str("..");
    }
    out
}

#[derive(Clone, Debug)]
pub struct WriteKey(SmallVec<[u8; 40]>);

impl WriteKey {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl AsRef<[u8]> for WriteKey {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for WriteKey {
    fn from(value: Vec<u8>) -> Self {
        Self(SmallVec::from_vec(value))
    }
}

impl From<&[u8]> for WriteKey {
    fn from(value: &[u8]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

#[derive(Clone, Debug)]
pub struct WriteValue(SmallVec<[u8; 64]>);

impl WriteValue {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0.into_vec()
    }
}

impl AsRef<[u8]> for WriteValue {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for WriteValue {
    fn from(value: Vec<u8>) -> Self {
        Self(SmallVec::from_vec(value))
    }
}

impl From<&[u8]> for WriteValue {
    fn from(value: &[u8]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

#[derive(Clone, Debug)]
pub enum WriteOp {
    Put { key: WriteKey, value: WriteValue },
    Delete { key: WriteKey },
}

/// `true` to keep iterating, `false` to stop early.
pub type PrefixVisitor<'a> = dyn FnMut(&[u8], &[u8]) -> bool + 'a;

pub trait KeyValueBackend: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Visits `prefix`-bounded entries in key order. `middle` restricts the
    /// walk to keys at or after (forward) or at or before (reverse)
    /// `prefix + middle`.
    fn for_each_prefix(
        &self,
        prefix: &[u8],
        middle: Option<&[u8]>,
        reverse: bool,
        visitor: &mut PrefixVisitor<'_>,
    ) -> Result<(), StoreError>;

    /// Applies all operations atomically.
    fn apply(&self, ops: &[WriteOp]) -> Result<(), StoreError>;
}

impl<T: KeyValueBackend + ?Sized> KeyValueBackend for Arc<T> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.as_ref().get(key)
    }

    fn for_each_prefix(
        &self,
        prefix: &[u8],
        middle: Option<&[u8]>,
        reverse: bool,
        visitor: &mut PrefixVisitor<'_>,
    ) -> Result<(), StoreError> {
        self.as_ref().for_each_prefix(prefix, middle, reverse, visitor)
    }

    fn apply(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        self.as_ref().apply(ops)
    }
}

/// Smallest key strictly greater than every key starting with `prefix`, or
/// `None` when the prefix is all `0xff`.
pub(crate) fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Some(bound);
        }
        bound.pop();
    }
    None
}
