//! CLI for the contract engine.

use clap::{Parser, Subcommand};
use contract_engine::ipc::UnixConnector;
use contract_engine::{
    BatchExecutor, EngineConfig, ExecutorManager, NativeRuntime, ObjectGraphCache,
    ParallelExecutor, SequentialExecutor, Workload, WorkloadConfig,
};
use eyre::{bail, WrapErr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "contract-engine", version, about = "Sandboxed contract execution engine")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace). RUST_LOG wins when set.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve RUN/KILL from a service manager.
    Serve {
        /// Socket of the service manager.
        #[arg(long)]
        socket: PathBuf,
        /// Identity announced on the control connection.
        #[arg(long, default_value = "engine")]
        uuid: String,
        /// Largest accepted frame, in bytes.
        #[arg(long, default_value_t = EngineConfig::default().max_frame_size)]
        max_frame_size: usize,
        /// Object graphs kept in the engine-wide cache.
        #[arg(long, default_value_t = EngineConfig::default().graph_cache_capacity)]
        graph_cache: usize,
    },
    /// Run a synthetic transfer batch in parallel and check it against a
    /// sequential run.
    Batch {
        #[arg(long, default_value_t = 1000)]
        accounts: usize,
        #[arg(long, default_value_t = 1000)]
        transactions: usize,
        /// Worker threads; defaults to the available parallelism.
        #[arg(long)]
        threads: Option<usize>,
        /// Share of transfers drawn from the hot accounts, 0.0 to 1.0.
        #[arg(long, default_value_t = 0.0)]
        conflict: f64,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Command::Serve {
            socket,
            uuid,
            max_frame_size,
            graph_cache,
        } => serve(EngineConfig {
            socket_path: socket,
            uuid,
            max_frame_size,
            graph_cache_capacity: graph_cache,
            ..Default::default()
        }),
        Command::Batch {
            accounts,
            transactions,
            threads,
            conflict,
            seed,
        } => {
            if !(0.0..=1.0).contains(&conflict) {
                bail!("conflict factor must be between 0.0 and 1.0, got {conflict}");
            }
            let config = WorkloadConfig {
                num_accounts: accounts,
                num_transactions: transactions,
                conflict_factor: conflict,
                seed,
                ..Default::default()
            };
            let parallel = match threads {
                Some(n) => ParallelExecutor::new(n),
                None => ParallelExecutor::default(),
            };
            batch(config, &parallel)
        }
    }
}

fn serve(config: EngineConfig) -> eyre::Result<()> {
    let cache = Arc::new(ObjectGraphCache::new(config.graph_cache_capacity));
    let runtime = Arc::new(NativeRuntime::with_builtins(cache));
    let connector = UnixConnector::new(&config.socket_path);
    let socket = config.socket_path.display().to_string();

    ExecutorManager::new(connector, runtime, config)
        .run()
        .wrap_err_with(|| format!("executor manager on {socket} failed"))
}

fn batch(config: WorkloadConfig, parallel: &ParallelExecutor) -> eyre::Result<()> {
    println!(
        "Configuration: {} accounts, {} transactions, {:.0}% conflicts, {} threads\n",
        config.num_accounts,
        config.num_transactions,
        config.conflict_factor * 100.0,
        parallel.config.num_threads
    );

    let workload = Workload::generate(config);
    let sequential = SequentialExecutor::new();

    let expected = Arc::new(workload.create_state());
    run_one(&sequential, expected.clone(), &workload);

    let actual = Arc::new(workload.create_state());
    run_one(parallel, actual.clone(), &workload);

    if expected.snapshot() != actual.snapshot() {
        bail!("parallel execution diverged from sequential execution");
    }
    println!("\nFinal states match.");
    Ok(())
}

fn run_one(
    executor: &dyn BatchExecutor,
    state: Arc<contract_engine::address_monitor::WorldState>,
    workload: &Workload,
) {
    let start = Instant::now();
    let result = executor.execute(state, workload);
    let elapsed = start.elapsed();
    let tps = result.total() as f64 / elapsed.as_secs_f64();

    println!(
        "{:12} | {:5} successful | {:5} failed | {:5} aborts | {:8.2} ms | {:8.0} tx/s",
        executor.name(),
        result.successful,
        result.failed,
        result.aborts,
        elapsed.as_secs_f64() * 1000.0,
        tps
    );
}
