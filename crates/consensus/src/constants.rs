//! Network-wide consensus constants. Anything version- or network-dependent
//! lives on `Currency` instead.

/// Unlock times below this sentinel are block heights, above it Unix
/// timestamps.
pub const MAX_BLOCK_HEIGHT: u64 = 500_000_000;

pub const DIFFICULTY_TARGET: u64 = 120;

pub const TIMESTAMP_CHECK_WINDOW: usize = 60;
pub const TIMESTAMP_CHECK_WINDOW_V5: usize = 11;

pub const BLOCK_FUTURE_TIME_LIMIT: u64 = 60 * 60 * 2;
pub const BLOCK_FUTURE_TIME_LIMIT_V5: u64 = 60 * 28;

pub const MINED_MONEY_UNLOCK_WINDOW: u32 = 10;
pub const MINED_MONEY_UNLOCK_WINDOW_V5: u32 = 480;

pub const LOCKED_TX_ALLOWED_DELTA_BLOCKS: u64 = 1;
pub const LOCKED_TX_ALLOWED_DELTA_SECONDS: u64 = DIFFICULTY_TARGET * LOCKED_TX_ALLOWED_DELTA_BLOCKS;

pub const MONEY_SUPPLY: u64 = u64::MAX;
pub const EMISSION_SPEED_FACTOR: u32 = 18;

pub const REWARD_BLOCKS_WINDOW: usize = 100;
pub const BLOCK_GRANTED_FULL_REWARD_ZONE: usize = 20_000;
pub const BLOCK_GRANTED_FULL_REWARD_ZONE_V2: usize = 100_000;
pub const COINBASE_BLOB_RESERVED_SIZE: usize = 600;

pub const MAX_BLOCK_SIZE_INITIAL: usize = 100_000;
pub const MAX_BLOCK_SIZE_GROWTH_SPEED_NUMERATOR: u64 = 100 * 1024;
pub const MAX_BLOCK_SIZE_GROWTH_SPEED_DENOMINATOR: u64 = 365 * 24 * 60 * 60 / DIFFICULTY_TARGET;

pub const DIFFICULTY_WINDOW: usize = 720;
pub const DIFFICULTY_CUT: usize = 60;
pub const DIFFICULTY_LAG: usize = 15;
pub const DIFFICULTY_WINDOW_V3: usize = 60;
pub const DIFFICULTY_WINDOW_V5: usize = 60;

pub const UPGRADE_VOTING_WINDOW: u32 = 720;
pub const UPGRADE_VOTING_THRESHOLD: u32 = 90;
pub const MAX_UPGRADE_DISTANCE: u32 = 7 * 720;

pub const POISSON_CHECK_TRIGGER: usize = 10;
pub const POISSON_CHECK_DEPTH: usize = 60;
pub const POISSON_LOG_P_REJECT: f64 = -75.0;

pub const STAKE_TO_DIFFICULTY_RATIO: u64 = 100;

/// Commit every block once synchronized, every this many heights while
/// catching up.
pub const DB_COMMIT_PERIOD: u32 = 1000;

pub const DB_SCHEMA_VERSION: &str = "umbra-blockchain-4";
