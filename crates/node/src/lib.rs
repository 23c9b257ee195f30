pub mod config;
pub mod core;
pub mod mempool;

pub use config::Config;
pub use mempool::{Mempool, MempoolError};
pub use self::core::Core;
