use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use umbrad_consensus::currency;
use umbrad_log::{log_error, log_info, LogConfig};
use umbrad_miner::{run_miner_loop, Miner, MinerConfig};
use umbrad_node::core::CoreMinerHandler;
use umbrad_node::{Config, Core};
use umbrad_storage::fjall::FjallStore;
use umbrad_storage::OpenMode;

const UPDATE_TEMPLATE_INTERVAL: Duration = Duration::from_secs(5);
const MERGE_HR_INTERVAL: Duration = Duration::from_secs(2);

fn main() {
    let config = match load_config() {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(1);
        }
    };

    umbrad_log::init(LogConfig {
        level: config.log_level(),
        format: config.log_format(),
        timestamps: true,
    });

    if let Err(message) = run(config) {
        log_error!("{message}");
        std::process::exit(1);
    }
}

fn load_config() -> Result<Config, String> {
    let mut args = std::env::args().skip(1);
    match args.next() {
        Some(flag) if flag == "--config" => {
            let path = args
                .next()
                .ok_or_else(|| "--config requires a path".to_string())?;
            Config::load(&PathBuf::from(path)).map_err(|err| err.to_string())
        }
        Some(other) => Err(format!("unknown argument {other:?}; usage: umbrad [--config <path>]")),
        None => Ok(Config::default()),
    }
}

fn run(config: Config) -> Result<(), String> {
    let network = config.network().map_err(|err| err.to_string())?;
    let currency = currency(network);
    let checkpoints = config.checkpoint_set().map_err(|err| err.to_string())?;

    std::fs::create_dir_all(&config.data_dir)
        .map_err(|err| format!("cannot create data dir: {err}"))?;
    let backend = Arc::new(
        FjallStore::open(config.blockchain_dir()).map_err(|err| err.to_string())?,
    );

    let core = Arc::new(
        Core::new(
            currency.clone(),
            checkpoints,
            backend,
            OpenMode::OpenOrCreate,
            None,
        )
        .map_err(|err| err.to_string())?,
    );
    log_info!(
        "chain loaded at height {} ({:?})",
        core.chain().tip_height(),
        network
    );

    let miner = config.mining.enabled.then(|| {
        Arc::new(Miner::new(
            Arc::new(CoreMinerHandler::new(Arc::clone(&core))),
            currency,
            MinerConfig {
                mining_threads: config.mining.threads,
                stake_address: config.mining.stake_address.clone(),
                wallet_host: config.mining.wallet_host.clone(),
                wallet_port: config.mining.wallet_port,
                extra_messages_file: config.mining.extra_messages_file.clone(),
                print_hashrate: config.mining.print_hashrate,
            },
        ))
    });

    // Single-threaded dispatcher for the I/O-bound side; the miner's nonce
    // search stays on its own OS threads.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| err.to_string())?;

    runtime.block_on(async {
        let mut miner_task = None;
        if let Some(miner) = &miner {
            if miner.request_block_template().await {
                miner.start(config.mining.threads.max(1));
                miner_task = Some(tokio::spawn(run_miner_loop(
                    Arc::clone(miner),
                    UPDATE_TEMPLATE_INTERVAL,
                    MERGE_HR_INTERVAL,
                )));
            } else {
                log_error!("initial template build failed; mining disabled");
            }
        }

        match tokio::signal::ctrl_c().await {
            Ok(()) => log_info!("shutdown requested"),
            Err(err) => log_error!("signal handler failed: {err}"),
        }

        if let Some(task) = miner_task {
            task.abort();
        }
    });

    if let Some(miner) = &miner {
        miner.stop();
    }
    core.chain().flush().map_err(|err| err.to_string())?;
    log_info!("shutdown complete");
    Ok(())
}
