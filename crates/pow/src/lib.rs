pub mod difficulty;
pub mod proof_of_work;

pub use difficulty::{check_hash, next_difficulty};
pub use proof_of_work::{check_proof_of_work, get_block_long_hash, pow_algo_for_version, PowError};
