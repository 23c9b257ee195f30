//! Difficulty target selection and the 256-bit work check.
//!
//! Three formula generations are in force, selected by the block major
//! version: the original windowed average with outlier cuts (v1/v2), a
//! linearly-weighted moving average (v3/v4), and the same LWMA with a
//! floor on solve times that resists timestamp manipulation (v5).

use primitive_types::{U256, U512};
use umbrad_consensus::constants::{
    DIFFICULTY_CUT, DIFFICULTY_LAG, DIFFICULTY_TARGET, DIFFICULTY_WINDOW, DIFFICULTY_WINDOW_V3,
    DIFFICULTY_WINDOW_V5,
};
use umbrad_crypto::Hash;
use umbrad_primitives::block::{BLOCK_MAJOR_VERSION_3, BLOCK_MAJOR_VERSION_5};

/// `hash * difficulty < 2^256`, with the hash read as a big-endian 256-bit
/// integer. Difficulty zero never passes.
pub fn check_hash(hash: &Hash, difficulty: u64) -> bool {
    if difficulty == 0 {
        return false;
    }
    let product: U512 = U256::from_big_endian(hash).full_mul(U256::from(difficulty));
    (product >> 256).is_zero()
}

/// Next target from the trailing `(timestamp, cumulative difficulty)` pairs,
/// oldest first. Returns 0 on arithmetic overflow, which callers treat as a
/// hard error.
pub fn next_difficulty(
    major_version: u8,
    timestamps: &[u64],
    cumulative_difficulties: &[u64],
) -> u64 {
    debug_assert_eq!(timestamps.len(), cumulative_difficulties.len());
    if major_version >= BLOCK_MAJOR_VERSION_5 {
        next_difficulty_lwma(timestamps, cumulative_difficulties, DIFFICULTY_WINDOW_V5, true)
    } else if major_version >= BLOCK_MAJOR_VERSION_3 {
        next_difficulty_lwma(timestamps, cumulative_difficulties, DIFFICULTY_WINDOW_V3, false)
    } else {
        next_difficulty_v1(timestamps, cumulative_difficulties)
    }
}

fn next_difficulty_v1(timestamps: &[u64], cumulative_difficulties: &[u64]) -> u64 {
    let mut timestamps = timestamps.to_vec();
    let mut cumulative_difficulties = cumulative_difficulties.to_vec();
    if timestamps.len() > DIFFICULTY_WINDOW {
        let excess = timestamps.len() - DIFFICULTY_WINDOW;
        timestamps.drain(..excess);
        cumulative_difficulties.drain(..excess);
    }

    let length = timestamps.len();
    if length <= 1 {
        return 1;
    }

    timestamps.sort_unstable();

    let (cut_begin, cut_end) = if length <= DIFFICULTY_WINDOW - 2 * DIFFICULTY_CUT {
        (0, length)
    } else {
        let kept = DIFFICULTY_WINDOW - 2 * DIFFICULTY_CUT;
        let cut_begin = (length - kept).div_ceil(2);
        (cut_begin, cut_begin + kept)
    };

    let time_span = (timestamps[cut_end - 1] - timestamps[cut_begin]).max(1);
    let total_work =
        cumulative_difficulties[cut_end - 1].saturating_sub(cumulative_difficulties[cut_begin]);
    if total_work == 0 {
        return 1;
    }

    let next = (total_work as u128 * DIFFICULTY_TARGET as u128 + time_span as u128 - 1)
        / time_span as u128;
    if next > u64::MAX as u128 {
        return 0;
    }
    (next as u64).max(1)
}

fn next_difficulty_lwma(
    timestamps: &[u64],
    cumulative_difficulties: &[u64],
    window: usize,
    floor_solve_times: bool,
) -> u64 {
    let len = timestamps.len().min(window + 1);
    if len < 2 {
        return 1;
    }
    let timestamps = &timestamps[timestamps.len() - len..];
    let cumulative_difficulties =
        &cumulative_difficulties[cumulative_difficulties.len() - len..];

    let t = DIFFICULTY_TARGET as i128;
    let n = (len - 1) as i128;

    let mut weighted_time: i128 = 0;
    let mut previous_timestamp = timestamps[0] as i128;
    for (i, timestamp) in timestamps.iter().enumerate().skip(1) {
        let this_timestamp = (*timestamp as i128).max(previous_timestamp + 1);
        let mut solve_time = (this_timestamp - previous_timestamp).min(6 * t);
        if floor_solve_times {
            solve_time = solve_time.max(t / 10);
        }
        previous_timestamp = this_timestamp;
        weighted_time += solve_time * i as i128;
    }

    // Keep the denominator sane when an attacker stalls timestamps.
    let min_weight = n * (n + 1) / 2 * t / 20;
    weighted_time = weighted_time.max(min_weight.max(1));

    let total_work =
        cumulative_difficulties[len - 1].saturating_sub(cumulative_difficulties[0]) as i128;
    if total_work == 0 {
        return 1;
    }
    let avg_work = total_work / n;

    // next = avg_work * T * N*(N+1)/2 / weighted_time
    let next = avg_work * t * n * (n + 1) / 2 / weighted_time;
    if next > u64::MAX as i128 {
        return 0;
    }
    (next as u64).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbrad_primitives::block::{BLOCK_MAJOR_VERSION_1, BLOCK_MAJOR_VERSION_4};

    fn perfect_chain(count: usize, difficulty: u64) -> (Vec<u64>, Vec<u64>) {
        let mut timestamps = Vec::with_capacity(count);
        let mut cumulative = Vec::with_capacity(count);
        let mut total = 0u64;
        for i in 0..count {
            timestamps.push(1_600_000_000 + i as u64 * DIFFICULTY_TARGET);
            total += difficulty;
            cumulative.push(total);
        }
        (timestamps, cumulative)
    }

    #[test]
    fn degenerate_history_yields_unit_difficulty() {
        assert_eq!(next_difficulty(BLOCK_MAJOR_VERSION_1, &[], &[]), 1);
        assert_eq!(
            next_difficulty(BLOCK_MAJOR_VERSION_1, &[1_000], &[1]),
            1
        );
        assert_eq!(
            next_difficulty(BLOCK_MAJOR_VERSION_5, &[1_000], &[1]),
            1
        );
    }

    #[test]
    fn v1_steady_chain_holds_difficulty() {
        let difficulty = 1_000u64;
        let (timestamps, cumulative) = perfect_chain(100, difficulty);
        let next = next_difficulty(BLOCK_MAJOR_VERSION_1, &timestamps, &cumulative);
        let ratio = next as f64 / difficulty as f64;
        assert!((0.9..=1.1).contains(&ratio), "next {next}");
    }

    #[test]
    fn v1_fast_blocks_raise_difficulty() {
        let difficulty = 1_000u64;
        let (mut timestamps, cumulative) = perfect_chain(100, difficulty);
        for (i, timestamp) in timestamps.iter_mut().enumerate() {
            *timestamp = 1_600_000_000 + i as u64 * (DIFFICULTY_TARGET / 4);
        }
        let next = next_difficulty(BLOCK_MAJOR_VERSION_1, &timestamps, &cumulative);
        assert!(next > difficulty);
    }

    #[test]
    fn lwma_steady_chain_holds_difficulty() {
        let difficulty = 50_000u64;
        let (timestamps, cumulative) = perfect_chain(DIFFICULTY_WINDOW_V3 + 1, difficulty);
        let next = next_difficulty(BLOCK_MAJOR_VERSION_4, &timestamps, &cumulative);
        let ratio = next as f64 / difficulty as f64;
        assert!((0.9..=1.1).contains(&ratio), "next {next}");
    }

    #[test]
    fn lwma_slow_blocks_drop_difficulty() {
        let difficulty = 50_000u64;
        let (mut timestamps, cumulative) = perfect_chain(DIFFICULTY_WINDOW_V3 + 1, difficulty);
        for (i, timestamp) in timestamps.iter_mut().enumerate() {
            *timestamp = 1_600_000_000 + i as u64 * DIFFICULTY_TARGET * 3;
        }
        let next = next_difficulty(BLOCK_MAJOR_VERSION_4, &timestamps, &cumulative);
        assert!(next < difficulty);
    }

    #[test]
    fn check_hash_boundary() {
        // difficulty 4: the largest passing hash is 2^256 / 4 - 1.
        let difficulty = 4u64;
        let mut passing = [0xffu8; 32];
        passing[0] = 0x3f;
        assert!(check_hash(&passing, difficulty));

        let mut failing = [0u8; 32];
        failing[0] = 0x40;
        assert!(!check_hash(&failing, difficulty));
    }

    #[test]
    fn check_hash_rejects_zero_difficulty() {
        assert!(!check_hash(&[0u8; 32], 0));
        assert!(check_hash(&[0xff; 32], 1));
    }
}
