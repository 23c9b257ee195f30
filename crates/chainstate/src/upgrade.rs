//! Consensus upgrade scheduling: a detector per target version, driven either
//! by a configured activation height or by miner voting observed in block
//! minor versions.

use umbrad_consensus::Currency;
use umbrad_primitives::block::BLOCK_MINOR_VERSION_1;

/// Read view of the main chain's version history.
pub trait VersionView {
    /// Number of blocks on the main chain, genesis included.
    fn block_count(&self) -> u32;
    fn block_version_at(&self, height: u32) -> Option<(u8, u8)>;
}

#[derive(Clone, Copy, Debug)]
pub struct UpgradeDetector {
    target_version: u8,
    voting_complete_height: Option<u32>,
}

impl UpgradeDetector {
    pub fn new(target_version: u8) -> Self {
        Self {
            target_version,
            voting_complete_height: None,
        }
    }

    pub fn target_version(&self) -> u8 {
        self.target_version
    }

    pub fn voting_complete_height(&self) -> Option<u32> {
        self.voting_complete_height
    }

    /// Height of the last block mined under the previous rules. Blocks at
    /// heights strictly above this carry `target_version`.
    pub fn upgrade_height(&self, currency: &Currency) -> Option<u32> {
        match currency.upgrade_heights.height_for(self.target_version) {
            Some(height) => Some(height),
            None => self
                .voting_complete_height
                .map(|complete| complete + currency.max_upgrade_distance),
        }
    }

    /// Recovers voting state from the stored chain at startup.
    pub fn init(&mut self, currency: &Currency, view: &dyn VersionView) {
        if currency
            .upgrade_heights
            .height_for(self.target_version)
            .is_some()
        {
            return;
        }
        let count = view.block_count();
        if count == 0 {
            return;
        }
        let last_height = count - 1;
        let Some((tip_major, _)) = view.block_version_at(last_height) else {
            return;
        };

        if tip_major + 1 == self.target_version {
            self.voting_complete_height =
                self.find_voting_complete_height(currency, view, last_height);
        } else if tip_major >= self.target_version {
            // Walk back to the last block mined under the previous rules.
            let mut height = last_height;
            while height > 0 {
                match view.block_version_at(height - 1) {
                    Some((major, _)) if major >= self.target_version => height -= 1,
                    _ => break,
                }
            }
            let upgrade_height = height.saturating_sub(1);
            self.voting_complete_height =
                self.find_voting_complete_height(currency, view, upgrade_height);
            if self.voting_complete_height.is_none() {
                umbrad_log::log_error!(
                    "voting complete height not found below upgrade height {upgrade_height} \
                     for version {}",
                    self.target_version
                );
            }
        }
    }

    pub fn block_pushed(&mut self, currency: &Currency, view: &dyn VersionView) {
        if currency
            .upgrade_heights
            .height_for(self.target_version)
            .is_some()
        {
            return;
        }
        let count = view.block_count();
        if count == 0 {
            return;
        }
        let last_height = count - 1;

        match self.voting_complete_height {
            Some(complete) => {
                if Some(last_height)
                    == self
                        .upgrade_height(currency)
                        .and_then(|height| height.checked_add(1))
                {
                    umbrad_log::log_info!(
                        "upgrade to version {} is in force from height {}; voting completed at {}",
                        self.target_version,
                        last_height,
                        complete
                    );
                }
            }
            None => {
                if self.is_voting_complete(currency, view, last_height) {
                    self.voting_complete_height = Some(last_height);
                    umbrad_log::log_info!(
                        "voting for version {} complete at height {}; upgrade after height {}",
                        self.target_version,
                        last_height,
                        self.upgrade_height(currency).unwrap_or(u32::MAX)
                    );
                }
            }
        }
    }

    pub fn block_popped(&mut self, view: &dyn VersionView) {
        if let Some(complete) = self.voting_complete_height {
            let count = view.block_count();
            if count == 0 || count - 1 < complete {
                umbrad_log::log_warn!(
                    "upgrade to version {} canceled by chain rollback",
                    self.target_version
                );
                self.voting_complete_height = None;
            }
        }
    }

    fn find_voting_complete_height(
        &self,
        currency: &Currency,
        view: &dyn VersionView,
        probable_upgrade_height: u32,
    ) -> Option<u32> {
        let start = probable_upgrade_height.saturating_sub(currency.max_upgrade_distance);
        (start..=probable_upgrade_height)
            .find(|height| self.is_voting_complete(currency, view, *height))
    }

    fn is_voting_complete(
        &self,
        currency: &Currency,
        view: &dyn VersionView,
        height: u32,
    ) -> bool {
        let window = currency.upgrade_voting_window;
        if window < 2 || height + 1 < window {
            return false;
        }
        let mut votes: u32 = 0;
        for h in (height + 1 - window)..=height {
            if let Some((major, minor)) = view.block_version_at(h) {
                if major + 1 == self.target_version && minor == BLOCK_MINOR_VERSION_1 {
                    votes += 1;
                }
            }
        }
        currency.upgrade_voting_threshold * window <= 100 * votes
    }
}

/// The version every block at `height` must carry, per the configured
/// schedule and any completed votes.
pub fn expected_major_version_for_height(
    currency: &Currency,
    detectors: &[UpgradeDetector],
    height: u32,
) -> u8 {
    let mut version = 1u8;
    for detector in detectors {
        if let Some(upgrade_height) = detector.upgrade_height(currency) {
            if height > upgrade_height {
                version = detector.target_version();
            }
        }
    }
    version
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbrad_consensus::{currency, Network};

    struct FakeView {
        versions: Vec<(u8, u8)>,
    }

    impl VersionView for FakeView {
        fn block_count(&self) -> u32 {
            self.versions.len() as u32
        }

        fn block_version_at(&self, height: u32) -> Option<(u8, u8)> {
            self.versions.get(height as usize).copied()
        }
    }

    #[test]
    fn static_schedule_drives_expected_version() {
        let currency = currency(Network::Testnet);
        let detectors: Vec<UpgradeDetector> = (2u8..=5).map(UpgradeDetector::new).collect();
        assert_eq!(expected_major_version_for_height(&currency, &detectors, 0), 1);
        assert_eq!(
            expected_major_version_for_height(&currency, &detectors, 100),
            1
        );
        assert_eq!(
            expected_major_version_for_height(&currency, &detectors, 101),
            2
        );
        assert_eq!(
            expected_major_version_for_height(&currency, &detectors, 401),
            5
        );
    }

    #[test]
    fn voting_completes_when_threshold_reached() {
        // Regtest votes with a window of 8 blocks and a 90% threshold.
        let currency = currency(Network::Regtest);
        let mut detector = UpgradeDetector::new(2);

        let mut view = FakeView {
            versions: vec![(1, 0); 4],
        };
        detector.block_pushed(&currency, &view);
        assert_eq!(detector.voting_complete_height(), None);

        view.versions = vec![(1, 1); 8];
        detector.block_pushed(&currency, &view);
        assert_eq!(detector.voting_complete_height(), Some(7));
        assert_eq!(
            detector.upgrade_height(&currency),
            Some(7 + currency.max_upgrade_distance)
        );
    }

    #[test]
    fn vote_canceled_by_rollback() {
        let currency = currency(Network::Regtest);
        let mut detector = UpgradeDetector::new(2);
        let mut view = FakeView {
            versions: vec![(1, 1); 8],
        };
        detector.block_pushed(&currency, &view);
        assert!(detector.voting_complete_height().is_some());

        view.versions.truncate(7);
        detector.block_popped(&view);
        assert_eq!(detector.voting_complete_height(), None);
    }

    #[test]
    fn init_recovers_completed_vote() {
        let currency = currency(Network::Regtest);
        let mut detector = UpgradeDetector::new(2);
        let view = FakeView {
            versions: vec![(1, 1); 8],
        };
        detector.init(&currency, &view);
        assert_eq!(detector.voting_complete_height(), Some(7));
    }
}
