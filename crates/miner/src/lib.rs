pub mod miner;
pub mod stake;

pub use miner::{run_miner_loop, BlockTemplate, Miner, MinerConfig, MinerError, MinerHandler};
pub use stake::{construct_stake_tx, ConstructStakeTxRequest, ConstructStakeTxResponse, RpcError};
