//! Hard-coded block checkpoints. Inside the checkpointed span the stored
//! hashes vouch for the chain, so expensive signature and proof-of-work
//! checks are skipped.

use std::collections::BTreeMap;

use umbrad_crypto::Hash;

#[derive(Clone, Debug, Default)]
pub struct Checkpoints {
    points: BTreeMap<u32, Hash>,
}

impl Checkpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_checkpoint(&mut self, height: u32, hash: Hash) -> bool {
        if let Some(existing) = self.points.get(&height) {
            return *existing == hash;
        }
        self.points.insert(height, hash);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn heights(&self) -> impl Iterator<Item = u32> + '_ {
        self.points.keys().copied()
    }

    pub fn top_checkpoint_height(&self) -> Option<u32> {
        self.points.keys().next_back().copied()
    }

    /// True while the chain has not yet grown past the last checkpoint.
    pub fn is_in_checkpoint_zone(&self, height: u32) -> bool {
        match self.top_checkpoint_height() {
            Some(top) => height <= top,
            None => false,
        }
    }

    /// Returns `(valid, is_checkpoint)`: off-checkpoint heights are always
    /// valid, checkpointed heights must match the stored hash.
    pub fn check_block(&self, height: u32, hash: &Hash) -> (bool, bool) {
        match self.points.get(&height) {
            Some(expected) => (expected == hash, true),
            None => (true, false),
        }
    }

    /// An alternative block is acceptable only if it branches after the last
    /// checkpoint below the current chain height.
    pub fn is_alternative_block_allowed(&self, blockchain_height: u32, block_height: u32) -> bool {
        if block_height == 0 {
            return false;
        }
        match self
            .points
            .range(..blockchain_height)
            .next_back()
            .map(|(height, _)| *height)
        {
            Some(checkpoint_height) => checkpoint_height < block_height,
            None => true,
        }
    }
}
