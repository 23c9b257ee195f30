pub mod entry;
pub mod index;
pub mod messages;
pub mod pool;
pub mod state;
pub mod upgrade;
pub mod validation;

pub use entry::{BlockEntry, TransactionEntry, TransactionIndex};
pub use messages::{BlockchainMessage, BlockchainObserver};
pub use pool::{NoopPool, PoolSession, TransactionPool};
pub use state::{BlockAddResult, Blockchain, ChainError, RandomOutsRequest, RandomOutsResponse};
pub use validation::VerificationError;
