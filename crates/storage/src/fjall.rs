use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fjall::{Batch, Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::{prefix_upper_bound, KeyValueBackend, PrefixVisitor, StoreError, WriteOp};

const PARTITION_NAME: &str = "chain";
const SLOW_COMMIT_THRESHOLD: Duration = Duration::from_millis(500);
const SLOW_COMMIT_LOG_INTERVAL_SECS: u64 = 30;

static LAST_SLOW_COMMIT_LOG_SECS: AtomicU64 = AtomicU64::new(0);

pub struct FjallStore {
    keyspace: Keyspace,
    partition: PartitionHandle,
}

#[derive(Clone, Debug, Default)]
pub struct FjallOptions {
    pub cache_bytes: Option<u64>,
    pub write_buffer_bytes: Option<u64>,
    pub memtable_bytes: Option<u32>,
    pub fsync_ms: Option<u16>,
}

impl FjallOptions {
    fn apply_config(&self, mut config: Config) -> Config {
        if let Some(bytes) = self.cache_bytes {
            config = config.cache_size(bytes);
        }
        if let Some(bytes) = self.write_buffer_bytes {
            config = config.max_write_buffer_size(bytes);
        }
        if let Some(ms) = self.fsync_ms {
            config = config.fsync_ms(Some(ms));
        }
        config
    }

    fn partition_options(&self) -> PartitionCreateOptions {
        let mut options = PartitionCreateOptions::default();
        if let Some(bytes) = self.memtable_bytes {
            options = options.max_memtable_size(bytes);
        }
        options
    }
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_options(path, FjallOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: FjallOptions,
    ) -> Result<Self, StoreError> {
        let config = options.apply_config(Config::new(path));
        let keyspace = config.open().map_err(map_err)?;
        let partition = keyspace
            .open_partition(PARTITION_NAME, options.partition_options())
            .map_err(map_err)?;
        Ok(Self {
            keyspace,
            partition,
        })
    }
}

impl KeyValueBackend for FjallStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.partition.get(key).map_err(map_err)?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn for_each_prefix(
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

        let range = self.partition.range::<Vec<u8>, _>((lower, upper));
        if reverse {
            for entry in range.rev() {
                let (key, value) = entry.map_err(map_err)?;
                if !visitor(key.as_ref(), value.as_ref()) {
                    break;
                }
            }
        } else {
            for entry in range {
                let (key, value) = entry.map_err(map_err)?;
                if !visitor(key.as_ref(), value.as_ref()) {
                    break;
                }
            }
        }
        Ok(())
    }

    fn apply(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut batch = Batch::with_capacity(self.keyspace.clone(), ops.len())
            .durability(Some(PersistMode::Buffer));
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    batch.insert(&self.partition, key.as_slice(), value.as_slice());
                }
                WriteOp::Delete { key } => {
                    batch.remove(&self.partition, key.as_slice());
                }
            }
        }

        let commit_start = Instant::now();
        batch.commit().map_err(map_err)?;
        let elapsed = commit_start.elapsed();
        if elapsed >= SLOW_COMMIT_THRESHOLD {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let last = LAST_SLOW_COMMIT_LOG_SECS.load(Ordering::Relaxed);
            if now.saturating_sub(last) >= SLOW_COMMIT_LOG_INTERVAL_SECS
                && LAST_SLOW_COMMIT_LOG_SECS
                    .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                umbrad_log::log_warn!(
                    "slow store commit: {}ms for {} ops (write_buffer {}B, journals {})",
                    elapsed.as_millis(),
                    ops.len(),
                    self.keyspace.write_buffer_size(),
                    self.keyspace.journal_count(),
                );
            }
        }
        Ok(())
    }
}

fn map_err(err: fjall::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}
