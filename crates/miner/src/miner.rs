//! Multi-threaded nonce search over a shared block template.
//!
//! Workers are plain OS threads; the template refresh loop runs on the
//! dispatcher and is the only async entry point. The two meet through the
//! template lock and a handful of atomics.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

use umbrad_consensus::Currency;
use umbrad_crypto::hash_to_hex;
use umbrad_log::{log_debug, log_error, log_info, log_trace, log_warn};
use umbrad_primitives::block::{has_parent_block, Block, BLOCK_MAJOR_VERSION_5};
use umbrad_primitives::encoding::decode;
use umbrad_primitives::extra::{append_merge_mining_tag_to_extra, MergeMiningTag};
use umbrad_primitives::transaction::Transaction;
use umbrad_pow::{check_hash, get_block_long_hash};

use crate::stake::{construct_stake_tx, hex_to_bytes, ConstructStakeTxRequest};

const HASH_RATE_SAMPLES: usize = 20;
const PAUSE_SLEEP: Duration = Duration::from_millis(100);
const NO_TEMPLATE_SLEEP: Duration = Duration::from_millis(1_000);
const MINER_CONFIG_FILE_NAME: &str = "miner_conf.json";

const STATE_MINING: u8 = 0;
const STATE_SUBMITTING: u8 = 1;

#[derive(Debug)]
pub enum MinerError {
    NotConfigured(&'static str),
    Template(String),
    WalletRpc(crate::stake::RpcError),
    StakeTx(&'static str),
}

impl std::fmt::Display for MinerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MinerError::NotConfigured(what) => write!(f, "miner not configured: {what}"),
            MinerError::Template(reason) => write!(f, "template: {reason}"),
            MinerError::WalletRpc(err) => write!(f, "wallet rpc: {err}"),
            MinerError::StakeTx(reason) => write!(f, "stake transaction: {reason}"),
        }
    }
}

impl std::error::Error for MinerError {}

/// Template handed out by the node core.
#[derive(Clone, Debug)]
pub struct BlockTemplate {
    pub block: Block,
    pub difficulty: u64,
    pub height: u32,
}

pub trait MinerHandler: Send + Sync {
    fn build_block_template(&self, extra_nonce: &[u8]) -> Result<BlockTemplate, String>;
    fn handle_block_found(&self, block: Block) -> bool;
    fn next_block_difficulty(&self) -> u64;
}

#[derive(Clone, Debug, Default)]
pub struct MinerConfig {
    pub mining_threads: usize,
    pub stake_address: Option<String>,
    pub wallet_host: String,
    pub wallet_port: u16,
    pub extra_messages_file: Option<PathBuf>,
    pub print_hashrate: bool,
}

#[derive(Default, Serialize, Deserialize)]
struct MinerIndexConfig {
    current_extra_message_index: usize,
}

struct TemplateState {
    block: Option<Block>,
    difficulty: u64,
}

pub struct Miner {
    handler: Arc<dyn MinerHandler>,
    currency: Currency,

    stop: AtomicBool,
    state: AtomicU8,
    template: Mutex<TemplateState>,
    template_version: AtomicU32,
    starter_nonce: AtomicU32,
    pausers_count: AtomicI32,
    threads_total: AtomicU32,
    threads: Mutex<Vec<JoinHandle<()>>>,

    hashes: AtomicU64,
    last_hr_merge_time_ms: AtomicU64,
    current_hash_rate: AtomicU64,
    hash_rates: Mutex<VecDeque<u64>>,
    do_print_hashrate: AtomicBool,

    stake_address: Option<String>,
    wallet_host: String,
    wallet_port: u16,
    extra_messages: Vec<Vec<u8>>,
    index_config: Mutex<MinerIndexConfig>,
    config_folder: Option<PathBuf>,
}

impl Miner {
    pub fn new(
        handler: Arc<dyn MinerHandler>,
        currency: Currency,
        config: MinerConfig,
    ) -> Self {
        let mut extra_messages = Vec::new();
        let mut index_config = MinerIndexConfig::default();
        let config_folder = config
            .extra_messages_file
            .as_ref()
            .and_then(|path| path.parent().map(PathBuf::from));

        if let Some(path) = &config.extra_messages_file {
            match std::fs::read_to_string(path) {
                Ok(contents) => {
                    extra_messages = contents
                        .lines()
                        .map(str::trim)
                        .filter(|line| !line.is_empty())
                        .map(|line| line.as_bytes().to_vec())
                        .collect();
                    if let Some(folder) = &config_folder {
                        let config_path = folder.join(MINER_CONFIG_FILE_NAME);
                        if let Ok(raw) = std::fs::read_to_string(&config_path) {
                            if let Ok(parsed) = serde_json::from_str(&raw) {
                                index_config = parsed;
                            }
                        }
                    }
                    log_info!(
                        "loaded {} extra messages, current index {}",
                        extra_messages.len(),
                        index_config.current_extra_message_index
                    );
                }
                Err(err) => {
                    log_error!("failed to load extra messages file: {err}");
                }
            }
        }

        Self {
            handler,
            currency,
            stop: AtomicBool::new(true),
            state: AtomicU8::new(STATE_MINING),
            template: Mutex::new(TemplateState {
                block: None,
                difficulty: 0,
            }),
            template_version: AtomicU32::new(0),
            starter_nonce: AtomicU32::new(0),
            pausers_count: AtomicI32::new(0),
            threads_total: AtomicU32::new(0),
            threads: Mutex::new(Vec::new()),
            hashes: AtomicU64::new(0),
            last_hr_merge_time_ms: AtomicU64::new(0),
            current_hash_rate: AtomicU64::new(0),
            hash_rates: Mutex::new(VecDeque::with_capacity(HASH_RATE_SAMPLES)),
            do_print_hashrate: AtomicBool::new(config.print_hashrate),
            stake_address: config.stake_address,
            wallet_host: config.wallet_host,
            wallet_port: config.wallet_port,
            extra_messages,
            index_config: Mutex::new(index_config),
            config_folder,
        }
    }

    pub fn is_mining(&self) -> bool {
        !self.stop.load(Ordering::Relaxed)
    }

    pub fn get_speed(&self) -> u64 {
        if self.is_mining() {
            self.current_hash_rate.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    pub fn do_print_hashrate(&self, enabled: bool) {
        self.do_print_hashrate.store(enabled, Ordering::Relaxed);
    }

    /// Installs a fresh template; v2..v4 templates get a merge-mining tag
    /// committing to the block spliced into the parent coinbase.
    pub fn set_block_template(&self, mut block: Block, difficulty: u64) -> bool {
        if has_parent_block(block.header.major_version) {
            let tag = MergeMiningTag {
                depth: 0,
                merkle_root: block.aux_hash(),
            };
            let Some(parent) = block.parent_block.as_mut() else {
                log_error!("template version requires a parent block");
                return false;
            };
            parent.base_transaction.prefix.extra.clear();
            if !append_merge_mining_tag_to_extra(
                &mut parent.base_transaction.prefix.extra,
                &tag,
            ) {
                return false;
            }
        }

        {
            let mut template = self.template.lock().expect("template lock");
            template.block = Some(block);
            template.difficulty = difficulty;
        }
        self.starter_nonce
            .store(rand::thread_rng().gen(), Ordering::Relaxed);
        self.template_version.fetch_add(1, Ordering::Release);
        true
    }

    /// Chain-tip change hook: refreshes the template when mining.
    pub async fn on_block_chain_update(&self) -> bool {
        if !self.is_mining() {
            return true;
        }
        self.request_block_template().await
    }

    /// Builds a template from the node core. For v5+ the wallet supplies a
    /// stake transaction sized to the next difficulty that replaces the
    /// coinbase.
    pub async fn request_block_template(&self) -> bool {
        let extra_nonce = {
            let index_config = self.index_config.lock().expect("miner config lock");
            self.extra_messages
                .get(index_config.current_extra_message_index)
                .cloned()
                .unwrap_or_default()
        };

        let template = match self.handler.build_block_template(&extra_nonce) {
            Ok(template) => template,
            Err(reason) => {
                log_error!("failed to build block template, stopping mining: {reason}");
                return false;
            }
        };

        match self.apply_stake_transaction(template).await {
            Ok(template) => self.set_block_template(template.block, template.difficulty),
            Err(err) => {
                log_error!("template refresh aborted: {err}");
                false
            }
        }
    }

    async fn apply_stake_transaction(
        &self,
        mut template: BlockTemplate,
    ) -> Result<BlockTemplate, MinerError> {
        if template.block.header.major_version < BLOCK_MAJOR_VERSION_5 {
            return Ok(template);
        }
        let address = self
            .stake_address
            .clone()
            .ok_or(MinerError::NotConfigured("stake address"))?;

        let difficulty = self.handler.next_block_difficulty();
        let stake = self.currency.stake_for_difficulty(difficulty);
        let reward = template.block.base_transaction.output_amount();
        let unlock_time = u64::from(template.height)
            + u64::from(
                self.currency
                    .mined_money_unlock_window(template.block.header.major_version),
            );

        let request = ConstructStakeTxRequest {
            address,
            stake,
            reward,
            unlock_time,
        };
        let response = construct_stake_tx(&self.wallet_host, self.wallet_port, &request)
            .await
            .map_err(MinerError::WalletRpc)?;

        let blob = hex_to_bytes(&response.tx_as_hex)
            .ok_or(MinerError::StakeTx("tx_as_hex is not valid hex"))?;
        let stake_tx: Transaction =
            decode(&blob).map_err(|_| MinerError::StakeTx("stake transaction does not parse"))?;
        if hex_to_bytes(&response.tx_key).map(|key| key.len()) != Some(32) {
            return Err(MinerError::StakeTx("tx_key is not a 32-byte key"));
        }

        template.block.base_transaction = stake_tx;
        template.difficulty = difficulty;
        Ok(template)
    }

    pub fn start(self: &Arc<Self>, threads_count: usize) -> bool {
        if self.is_mining() {
            log_error!("starting miner but it is already started");
            return false;
        }
        let mut threads = self.threads.lock().expect("threads lock");
        if !threads.is_empty() {
            log_error!("cannot start miner: worker threads still active");
            return false;
        }

        self.threads_total
            .store(threads_count as u32, Ordering::Relaxed);
        self.starter_nonce
            .store(rand::thread_rng().gen(), Ordering::Relaxed);
        self.state.store(STATE_MINING, Ordering::Relaxed);
        self.stop.store(false, Ordering::SeqCst);

        for index in 0..threads_count as u32 {
            let miner = Arc::clone(self);
            threads.push(std::thread::spawn(move || miner.worker_thread(index)));
        }

        log_info!("mining started with {threads_count} threads");
        true
    }

    pub fn send_stop_signal(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Cooperative stop: signals, then joins every worker.
    pub fn stop(&self) {
        self.send_stop_signal();
        let mut threads = self.threads.lock().expect("threads lock");
        let count = threads.len();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        if count > 0 {
            log_info!("mining stopped, {count} threads joined");
        }
    }

    pub fn pause(&self) {
        let previous = self.pausers_count.fetch_add(1, Ordering::SeqCst);
        if previous == 0 && self.is_mining() {
            log_trace!("mining paused");
        }
    }

    pub fn resume(&self) {
        let previous = self.pausers_count.fetch_sub(1, Ordering::SeqCst);
        if previous <= 0 {
            self.pausers_count.store(0, Ordering::SeqCst);
            log_error!("unexpected miner resume");
        }
        if self.pausers_count.load(Ordering::SeqCst) == 0 && self.is_mining() {
            log_trace!("mining resumed");
        }
    }

    /// Folds the hash counter into a rate sample; keeps a short ring of
    /// samples for the reported average.
    pub fn merge_hashrate(&self) {
        let now = milliseconds_since_epoch();
        let last = self.last_hr_merge_time_ms.swap(now, Ordering::Relaxed);
        let hashes = self.hashes.swap(0, Ordering::Relaxed);
        if last == 0 || !self.is_mining() {
            return;
        }

        let rate = hashes * 1_000 / (now.saturating_sub(last) + 1);
        self.current_hash_rate.store(rate, Ordering::Relaxed);
        let mut samples = self.hash_rates.lock().expect("hash rate lock");
        samples.push_back(rate);
        while samples.len() > HASH_RATE_SAMPLES {
            samples.pop_front();
        }
        if self.do_print_hashrate.load(Ordering::Relaxed) && !samples.is_empty() {
            let total: u64 = samples.iter().sum();
            let average = total as f64 / samples.len() as f64;
            println!("hashrate: {average:.2}");
        }
    }

    fn worker_thread(self: Arc<Self>, thread_index: u32) {
        log_info!("miner thread started [{thread_index}]");
        let mut nonce = self
            .starter_nonce
            .load(Ordering::Relaxed)
            .wrapping_add(thread_index);
        let mut local_difficulty = 0u64;
        let mut local_version = 0u32;
        let mut block: Option<Block> = None;

        while !self.stop.load(Ordering::Relaxed) {
            if self.pausers_count.load(Ordering::SeqCst) > 0 {
                std::thread::sleep(PAUSE_SLEEP);
                continue;
            }

            let version = self.template_version.load(Ordering::Acquire);
            if local_version != version {
                let template = self.template.lock().expect("template lock");
                block = template.block.clone();
                local_difficulty = template.difficulty;
                drop(template);
                local_version = version;
                nonce = self
                    .starter_nonce
                    .load(Ordering::Relaxed)
                    .wrapping_add(thread_index);
            }

            let Some(candidate) = block.as_mut() else {
                log_trace!("block template not set yet");
                std::thread::sleep(NO_TEMPLATE_SLEEP);
                continue;
            };

            candidate.header.nonce = nonce;
            let hash = get_block_long_hash(candidate);
            if check_hash(&hash, local_difficulty)
                && self
                    .state
                    .compare_exchange(
                        STATE_MINING,
                        STATE_SUBMITTING,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                log_info!(
                    "found block {} at difficulty {local_difficulty}",
                    hash_to_hex(&candidate.hash())
                );
                self.submit_found_block(candidate.clone());
                self.state.store(STATE_MINING, Ordering::Release);
            }

            nonce = nonce.wrapping_add(self.threads_total.load(Ordering::Relaxed).max(1));
            self.hashes.fetch_add(1, Ordering::Relaxed);
        }
        log_info!("miner thread stopped [{thread_index}]");
    }

    fn submit_found_block(&self, block: Block) {
        let mut index_config = self.index_config.lock().expect("miner config lock");
        index_config.current_extra_message_index += 1;
        if self.handler.handle_block_found(block) {
            if let Some(folder) = &self.config_folder {
                match serde_json::to_string(&*index_config) {
                    Ok(raw) => {
                        let path = folder.join(MINER_CONFIG_FILE_NAME);
                        if let Err(err) = std::fs::write(&path, raw) {
                            log_warn!("failed to persist miner config: {err}");
                        }
                    }
                    Err(err) => log_warn!("failed to serialize miner config: {err}"),
                }
            }
        } else {
            index_config.current_extra_message_index =
                index_config.current_extra_message_index.saturating_sub(1);
            log_debug!("found block was rejected by the handler");
        }
    }

    /// Blocking helper for tools and tests: grinds `block` in place until its
    /// long hash meets `difficulty`.
    pub fn find_nonce_for_given_block(block: &mut Block, difficulty: u64) -> bool {
        let start: u32 = rand::thread_rng().gen();
        for step in 0..=u32::MAX {
            block.header.nonce = start.wrapping_add(step);
            let hash = get_block_long_hash(block);
            if check_hash(&hash, difficulty) {
                return true;
            }
        }
        false
    }
}

impl Drop for Miner {
    fn drop(&mut self) {
        self.send_stop_signal();
        let mut threads = self.threads.lock().expect("threads lock");
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Template refresh and hashrate loop; runs on the dispatcher.
pub async fn run_miner_loop(
    miner: Arc<Miner>,
    update_template_interval: Duration,
    merge_hr_interval: Duration,
) {
    let mut template_tick = tokio::time::interval(update_template_interval);
    let mut hashrate_tick = tokio::time::interval(merge_hr_interval);
    loop {
        tokio::select! {
            _ = template_tick.tick() => {
                // A failed refresh is retried on the next tick.
                if miner.is_mining() {
                    let _ = miner.request_block_template().await;
                }
            }
            _ = hashrate_tick.tick() => {
                miner.merge_hashrate();
            }
        }
    }
}

fn milliseconds_since_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use umbrad_consensus::{currency, Network};
    use umbrad_primitives::block::{BlockHeader, BLOCK_MAJOR_VERSION_1, BLOCK_MINOR_VERSION_0};
    use umbrad_primitives::transaction::{
        BaseInput, TransactionInput, TransactionPrefix,
    };

    struct CountingHandler {
        submitted: AtomicUsize,
    }

    impl MinerHandler for CountingHandler {
        fn build_block_template(&self, _extra_nonce: &[u8]) -> Result<BlockTemplate, String> {
            Err("no template in tests".to_string())
        }

        fn handle_block_found(&self, _block: Block) -> bool {
            self.submitted.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn next_block_difficulty(&self) -> u64 {
            1
        }
    }

    fn test_block() -> Block {
        Block {
            header: BlockHeader {
                major_version: BLOCK_MAJOR_VERSION_1,
                minor_version: BLOCK_MINOR_VERSION_0,
                nonce: 0,
                timestamp: 1_600_000_000,
                previous_block_hash: [7u8; 32],
            },
            parent_block: None,
            base_transaction: Transaction {
                prefix: TransactionPrefix {
                    version: 1,
                    unlock_time: 10,
                    inputs: vec![TransactionInput::Base(BaseInput { block_index: 0 })],
                    outputs: Vec::new(),
                    extra: Vec::new(),
                },
                signatures: Vec::new(),
            },
            transaction_hashes: Vec::new(),
        }
    }

    fn test_miner() -> Arc<Miner> {
        Arc::new(Miner::new(
            Arc::new(CountingHandler {
                submitted: AtomicUsize::new(0),
            }),
            currency(Network::Regtest),
            MinerConfig::default(),
        ))
    }

    #[test]
    fn template_bumps_version_and_nonce_seed() {
        let miner = test_miner();
        let before = miner.template_version.load(Ordering::Relaxed);
        assert!(miner.set_block_template(test_block(), 1));
        assert_eq!(miner.template_version.load(Ordering::Relaxed), before + 1);
    }

    #[test]
    fn workers_find_a_unit_difficulty_block() {
        let handler = Arc::new(CountingHandler {
            submitted: AtomicUsize::new(0),
        });
        let miner = Arc::new(Miner::new(
            Arc::clone(&handler) as Arc<dyn MinerHandler>,
            currency(Network::Regtest),
            MinerConfig::default(),
        ));
        assert!(miner.set_block_template(test_block(), 1));
        assert!(miner.start(2));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while handler.submitted.load(Ordering::SeqCst) == 0
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(10));
        }
        miner.stop();
        assert!(handler.submitted.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn pause_blocks_progress() {
        let miner = test_miner();
        miner.pause();
        assert!(miner.set_block_template(test_block(), 1));
        assert!(miner.start(1));
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(miner.hashes.load(Ordering::Relaxed), 0);
        miner.resume();
        miner.stop();
    }

    #[test]
    fn hashrate_ring_is_bounded() {
        let miner = test_miner();
        miner.stop.store(false, Ordering::SeqCst);
        miner.last_hr_merge_time_ms.store(1, Ordering::Relaxed);
        for _ in 0..50 {
            miner.hashes.store(1_000, Ordering::Relaxed);
            miner.merge_hashrate();
        }
        assert!(miner.hash_rates.lock().expect("lock").len() <= HASH_RATE_SAMPLES);
        miner.stop.store(true, Ordering::SeqCst);
    }

    #[test]
    fn find_nonce_succeeds_at_low_difficulty() {
        let mut block = test_block();
        assert!(Miner::find_nonce_for_given_block(&mut block, 2));
    }
}
