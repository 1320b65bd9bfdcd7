//! Execution client runloop.
//!
//! Replays blocks from a block database through the parallel executor
//! into the state trie store. The EVM interpreter is pluggable; this
//! binary wires the no-op interpreter, which is sufficient for native
//! transfers, system contracts and precompiles.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use monad_exec::block_db::BlockDb;
use monad_exec::runloop::{RunLoop, RunloopError};
use monad_exec::triedb::{NodeStore, TrieDb};
use monad_exec::{
    dump_snapshot, load_snapshot, Db, ExecutorPool, Genesis, MonadChain, NoopInterpreter,
    CHAIN_ID_DEVNET,
};

#[derive(Debug, Parser)]
#[command(name = "monad", about = "Monad execution runloop")]
struct Args {
    /// Directory holding the block files to execute.
    #[arg(long = "block_db")]
    block_db: PathBuf,

    /// Comma-separated chunk files backing the trie store; in-memory if
    /// omitted.
    #[arg(long = "db", value_delimiter = ',')]
    db: Option<Vec<PathBuf>>,

    /// Stop after this many blocks.
    #[arg(long)]
    nblocks: Option<u64>,

    #[arg(long, default_value_t = 4)]
    nthreads: u32,

    #[arg(long, default_value_t = 64)]
    nfibers: u32,

    /// Keep the full block-indexed history instead of pruning at
    /// finalization.
    #[arg(long = "no_compaction", default_value_t = false)]
    no_compaction: bool,

    /// Dedicated CPU for the I/O ring polling thread.
    #[arg(long = "sq_thread_cpu")]
    sq_thread_cpu: Option<u32>,

    /// Load state from a snapshot directory before executing.
    #[arg(long = "load_snapshot")]
    load_snapshot: Option<PathBuf>,

    /// Dump state to a snapshot directory after executing.
    #[arg(long = "dump_snapshot")]
    dump_snapshot: Option<PathBuf>,

    /// Genesis allocation; required only on a fresh database.
    #[arg(long = "genesis_file")]
    genesis_file: Option<PathBuf>,

    /// One of trace, debug, info, warning, error, critical.
    #[arg(long = "log_level", default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    match &args.db {
        Some(paths) => {
            let db = TrieDb::open(paths, args.sq_thread_cpu, !args.no_compaction)
                .context("opening trie database")?;
            run_with_db(db, args)
        }
        None => run_with_db(TrieDb::new(), args),
    }
}

fn run_with_db<S: NodeStore>(db: TrieDb<S>, args: Args) -> anyhow::Result<()> {
    let db = Arc::new(db);
    let pool = ExecutorPool::new(args.nthreads, args.nfibers).context("building worker pool")?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        pool.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received");
                stop.store(true, Ordering::Relaxed);
            }
        });
    }

    let mut chain = MonadChain::from_id(CHAIN_ID_DEVNET).expect("devnet id is known");

    // Fresh databases need an initial state: a snapshot or a genesis file.
    let dyn_db: Arc<dyn Db> = db.clone();
    if dyn_db.latest_block_number()?.is_none() {
        if let Some(dir) = &args.load_snapshot {
            let genesis = load_genesis(&args, &mut chain)?;
            let header = monad_exec::BlockHeader {
                number: 0,
                timestamp: genesis.as_ref().map(|g| g.timestamp).unwrap_or_default(),
                gas_limit: genesis.as_ref().map(|g| g.gas_limit).unwrap_or(30_000_000),
                base_fee_per_gas: Some(alloy_primitives::U256::from(1_000_000_000u64)),
                ..monad_exec::BlockHeader::default()
            };
            load_snapshot(db.as_ref(), dir, &header).context("loading snapshot")?;
            info!("loaded snapshot from {}", dir.display());
        } else {
            let genesis = load_genesis(&args, &mut chain)?
                .ok_or_else(|| anyhow::anyhow!("fresh database requires --genesis_file"))?;
            let header = genesis.commit(&dyn_db).context("committing genesis")?;
            info!(root = %header.state_root, "genesis committed");
        }
    } else {
        // Only the chain id is taken from genesis on a warm database.
        let _ = load_genesis(&args, &mut chain)?;
    }

    let block_db = BlockDb::open(&args.block_db).context("opening block database")?;

    let mut runloop = RunLoop {
        chain,
        db: dyn_db,
        block_db,
        pool,
        interpreter: Arc::new(NoopInterpreter),
        stop,
        nblocks: args.nblocks,
        log_native_transfers: false,
    };

    let result = runloop.run();
    match &result {
        Ok(executed) => info!(executed, "runloop finished"),
        Err(RunloopError::Block { number, source }) => {
            error!("block {number} failed: {source}");
        }
        Err(err) => error!("runloop failed: {err}"),
    }

    if let Some(dir) = &args.dump_snapshot {
        dump_snapshot(db.as_ref(), dir).context("dumping snapshot")?;
        info!("dumped snapshot to {}", dir.display());
    }

    result.map(|_| ()).map_err(Into::into)
}

fn load_genesis(args: &Args, chain: &mut MonadChain) -> anyhow::Result<Option<Genesis>> {
    let Some(path) = &args.genesis_file else {
        return Ok(None);
    };
    let genesis = Genesis::load(path).context("reading genesis file")?;
    if let Some(id) = genesis.chain_id {
        *chain = MonadChain::from_id(id)
            .ok_or_else(|| anyhow::anyhow!("unknown chain id {id} in genesis file"))?;
    }
    Ok(Some(genesis))
}

fn init_logging(level: &str) {
    // `critical` maps onto the highest level tracing knows.
    let level = match level {
        "warning" => "warn",
        "critical" => "error",
        other => other,
    };
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
