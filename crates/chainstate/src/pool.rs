//! Contract between the chain manager and the transaction memory pool.
//!
//! The chain manager acquires the pool session before the chain lock on
//! every ingest, so implementations must not call back into the chain while
//! a session is open.

use umbrad_crypto::Hash;
use umbrad_primitives::transaction::Transaction;

/// Exclusive access to the pool for the duration of one chain operation.
pub trait PoolSession {
    /// Removes and returns the transaction with its blob size and fee.
    fn take(&mut self, hash: &Hash) -> Option<(Transaction, usize, u64)>;

    /// Non-destructive lookup, for size estimates.
    fn get(&self, hash: &Hash) -> Option<(Transaction, usize, u64)>;

    /// Adds a transaction back. `restored` marks transactions re-presented by
    /// a block pop or a failed push; implementations absorb duplicates.
    fn add(&mut self, tx: Transaction, restored: bool) -> bool;
}

pub trait TransactionPool: Send + Sync {
    fn session(&self) -> Box<dyn PoolSession + '_>;
}

/// Pool that holds nothing; used while pushing the genesis block and in
/// tests that pre-stage transactions elsewhere.
pub struct NoopPool;

struct NoopSession;

impl PoolSession for NoopSession {
    fn take(&mut self, _hash: &Hash) -> Option<(Transaction, usize, u64)> {
        None
    }

    fn get(&self, _hash: &Hash) -> Option<(Transaction, usize, u64)> {
        None
    }

    fn add(&mut self, _tx: Transaction, _restored: bool) -> bool {
        true
    }
}

impl TransactionPool for NoopPool {
    fn session(&self) -> Box<dyn PoolSession + '_> {
        Box::new(NoopSession)
    }
}
