//! specmem-embed entry point: wires the configuration, the encoder's
//! supporting components, and the Unix-socket server together, then runs
//! until a graceful shutdown signal arrives.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use specmem_embed::adapter::DimensionAdapter;
use specmem_embed::cache::DiskCache;
use specmem_embed::encoder::EncoderConfig;
use specmem_embed::lifecycle::{LifecycleManager, PidFile};
use specmem_embed::monitor::CpuMonitor;
use specmem_embed::oracle::DimensionOracle;
use specmem_embed::overflow::OverflowQueue;
use specmem_embed::scheduler::{AdmissionConfig, FifoAckConfig, Scheduler, ThrottleConfig};
use specmem_embed::server::handler::AppState;
use specmem_embed::server::{self, close_inherited_fds, ignore_sigpipe};
use specmem_embed::stats::Stats;
use specmem_embed::{project, Config};

const ORACLE_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const CPU_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

fn main() -> std::process::ExitCode {
    // Logging must come up before anything else runs, including the PID
    // file write, so a startup failure is always observable.
    if let Err(e) = specmem_embed::logging::init_logging("specmem-embed") {
        eprintln!("failed to initialize logging: {e}");
        return std::process::ExitCode::FAILURE;
    }

    close_inherited_fds();
    ignore_sigpipe();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            return std::process::ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run()) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal startup error");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> specmem_embed::Result<()> {
    let config = Config::from_env()?;
    let project_id = project::project_id(&config.project_root);
    info!(project_id, project_root = %config.project_root.display(), "starting specmem-embed");

    let pid_file = PidFile::new(
        config
            .socket_path
            .parent()
            .map(|p| p.join("embed.pid"))
            .unwrap_or_else(|| std::path::PathBuf::from("embed.pid")),
    );
    pid_file.write_current()?;

    let stats = Arc::new(Stats::default());
    let monitor = Arc::new(CpuMonitor::new());

    let cache = Arc::new(DiskCache::new(
        config.cache_dir.clone(),
        config.cache_max_bytes,
        Arc::clone(&stats),
    )?);
    let adapter = Arc::new(DimensionAdapter::new(config.cache_dir.join("projections"), Arc::clone(&stats)));

    let encoder_config = EncoderConfig {
        model_id: "sentence-transformers/paraphrase-multilingual-MiniLM-L12-v2".to_string(),
        model_cache_dir: config.project_root.join("specmem").join("models"),
        tokenizer_cache_dir: config.project_root.join("specmem").join("tokenizers"),
        max_length: 384,
        batch_size: 32,
        thread_min: config.thread_min,
        thread_max: config.thread_max,
    };

    // A daemon spawned directly by a human shell has no meaningful parent
    // to watch; one spawned by a supervisor inherits that supervisor as
    // its real parent pid, which `getppid()` already reflects.
    let parent_pid = parent_pid_for_watchdog();
    let lifecycle = Arc::new(LifecycleManager::new(&config, encoder_config, parent_pid));

    let (overflow, oracle) = match &config.database_url {
        Some(url) if config.overflow_enabled => {
            let overflow = Arc::new(OverflowQueue::connect(url, project_id.clone()).await?);
            let pool = connect_oracle_pool(url).await?;
            let oracle = DimensionOracle::connect(pool, ORACLE_REFRESH_INTERVAL).await?;
            (Some(overflow), oracle)
        }
        Some(url) => {
            let pool = connect_oracle_pool(url).await?;
            let oracle = DimensionOracle::connect(pool, ORACLE_REFRESH_INTERVAL).await?;
            (None, oracle)
        }
        None => {
            warn!("no database configured; dimension oracle and overflow queue are both disabled");
            return Err(specmem_embed::EmbedError::Configuration(
                "a database connection is required: set SPECMEM_DB_URL or the SPECMEM_DB_* parts".to_string(),
            ));
        }
    };

    let scheduler = Arc::new(Scheduler::new(
        config.scheduler_mode,
        AdmissionConfig::default(),
        ThrottleConfig::default(),
        FifoAckConfig::default(),
        Arc::clone(&monitor),
        overflow.is_some(),
        config.thread_min,
        config.thread_max,
        Arc::clone(&stats),
    ));

    let state = Arc::new(AppState::new(
        Arc::clone(&lifecycle),
        adapter,
        Arc::clone(&cache),
        Arc::clone(&scheduler),
        Arc::clone(&oracle),
        overflow,
        Arc::clone(&stats),
    ));

    tokio::spawn(Arc::clone(&lifecycle).run_watchdog());
    tokio::spawn(Arc::clone(&scheduler).run_maintenance_loop());
    tokio::spawn(Arc::clone(&oracle).spawn_refresh_loop());
    tokio::spawn(sample_cpu_loop(Arc::clone(&monitor), Arc::clone(&stats)));
    tokio::spawn(server::handler::run_fifo_workers(Arc::clone(&state), config.fifo_workers));
    tokio::spawn(server::handler::run_overflow_drain_loop(Arc::clone(&state)));

    let result = server::run(state, &config.socket_path, config.max_workers).await;

    lifecycle.request_shutdown();
    cache.flush();
    let _ = std::fs::remove_file(&config.socket_path);
    pid_file.cleanup();

    result
}

async fn connect_oracle_pool(database_url: &str) -> specmem_embed::Result<sqlx::PgPool> {
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(database_url)
        .await
        .map_err(specmem_embed::EmbedError::Database)
}

async fn sample_cpu_loop(monitor: Arc<CpuMonitor>, stats: Arc<Stats>) {
    let mut ticker = tokio::time::interval(CPU_SAMPLE_INTERVAL);
    loop {
        ticker.tick().await;
        stats.record_cpu(monitor.sample());
    }
}

#[cfg(unix)]
fn parent_pid_for_watchdog() -> Option<u32> {
    let ppid = nix::unistd::getppid().as_raw();
    if ppid <= 1 {
        None
    } else {
        Some(ppid as u32)
    }
}

#[cfg(not(unix))]
fn parent_pid_for_watchdog() -> Option<u32> {
    None
}
