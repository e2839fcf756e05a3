//! Ensemble CLI: train, test, push, and live commands over a ranking store.
//!
//! Commands:
//! - `init-config`: print or write the default TOML configuration
//! - `train`: replay the leading share of history and finalize snapshots
//! - `test`: evaluate a snapshot on the held-out remainder, save artifacts
//! - `push`: validate, gate, and promote a snapshot for LIVE
//! - `live`: trade the latest bars against the promoted snapshot
//! - `rank`: continuous ranking process; promotes through the PUSH gate (`--force` skips TEST)
//! - `status`: versions, evaluations, and the current score board
//! - `audit`: replay the outcome log and compare with stored scores

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ensemble_core::config::EngineConfig;
use ensemble_core::domain::{RankingSnapshot, SnapshotVersion};
use ensemble_core::store::{FileStore, RankingStore, SnapshotSource};
use ensemble_core::{ManualClock, StrategyRegistry};
use ensemble_runner::collector::InlineCollector;
use ensemble_runner::export::{export_scores_csv, save_artifacts, EvaluationManifest};
use ensemble_runner::lifecycle::{self, push, split_ticks, train, LiveTrader, PushOptions};
use ensemble_runner::{
    audit_scores, load_market, LoadOptions, LoadedMarket, PaperBroker, PromotionPolicy, RankingProcess,
};

#[derive(Parser)]
#[command(
    name = "ensemble",
    about = "Ensemble CLI: ranked, weighted strategy ensembles with a train/test/push/live lifecycle"
)]
struct Cli {
    /// Path to a TOML config file. Defaults to the built-in configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug-level logging (RUST_LOG overrides).
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct DataArgs {
    /// Directory of `<SYMBOL>.csv` bar files.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Generate synthetic bars for instruments with no CSV.
    #[arg(long, default_value_t = false)]
    synthetic: bool,

    /// Synthetic bars per instrument.
    #[arg(long, default_value_t = 500)]
    bars: usize,

    /// First synthetic trading day (YYYY-MM-DD).
    #[arg(long, default_value = "2022-01-03")]
    start: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the default configuration, or write it to a file.
    InitConfig {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Replay the training share of history and finalize snapshots. Never promotes.
    Train {
        #[command(flatten)]
        data: DataArgs,
    },
    /// Evaluate a finalized snapshot on the held-out share of history.
    Test {
        #[command(flatten)]
        data: DataArgs,

        /// Snapshot version to evaluate. Defaults to the latest.
        #[arg(long)]
        version: Option<u64>,

        /// Output directory for evaluation artifacts.
        #[arg(long, default_value = "results")]
        output_dir: PathBuf,
    },
    /// Promote a finalized snapshot so LIVE picks it up.
    Push {
        /// Snapshot version to promote. Defaults to the latest.
        #[arg(long)]
        version: Option<u64>,

        /// Skip the TEST gate (validation still applies).
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Trade the most recent bars against the promoted snapshot.
    Live {
        #[command(flatten)]
        data: DataArgs,

        /// Number of trailing bars to trade through.
        #[arg(long, default_value_t = 20)]
        ticks: usize,

        /// Pause between ticks.
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,

        /// Paper broker starting cash.
        #[arg(long, default_value_t = ensemble_runner::execution::DEFAULT_STARTING_CASH)]
        cash: f64,
    },
    /// Run the ranking process over all history, promoting each snapshot.
    Rank {
        #[command(flatten)]
        data: DataArgs,

        /// Ticks between recomputations. Defaults to `ranking.recompute_every`.
        #[arg(long)]
        cadence: Option<usize>,

        /// Auto-promote snapshots that have no passing TEST verdict.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Show snapshot versions, evaluations, and the current score board.
    Status {
        /// Also print the score board as CSV.
        #[arg(long, default_value_t = false)]
        scores: bool,
    },
    /// Recompute scores from the outcome log and compare with stored scores.
    Audit {
        /// Relative tolerance.
        #[arg(long, default_value_t = 1e-9)]
        tolerance: f64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Commands::InitConfig { output } = &cli.command {
        return run_init_config(output.as_deref());
    }

    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::InitConfig { .. } => Ok(()),
        Commands::Train { data } => run_train(&config, &data),
        Commands::Test {
            data,
            version,
            output_dir,
        } => run_test(&config, &data, version.map(SnapshotVersion), &output_dir),
        Commands::Push { version, force } => run_push(&config, version.map(SnapshotVersion), force),
        Commands::Live {
            data,
            ticks,
            interval_ms,
            cash,
        } => run_live(&config, &data, ticks, interval_ms, cash),
        Commands::Rank { data, cadence, force } => run_rank(&config, &data, cadence, force),
        Commands::Status { scores } => run_status(&config, scores),
        Commands::Audit { tolerance } => run_audit(&config, tolerance),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path).with_context(|| format!("loading config {}", path.display())),
        None => {
            info!("no --config given; using the built-in configuration");
            let config = EngineConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn open_store(config: &EngineConfig) -> Result<Arc<FileStore>> {
    let store = FileStore::open(&config.store.path)
        .with_context(|| format!("opening ranking store at {}", config.store.path.display()))?;
    Ok(Arc::new(store))
}

fn load_data(config: &EngineConfig, data: &DataArgs) -> Result<LoadedMarket> {
    let start = NaiveDate::parse_from_str(&data.start, "%Y-%m-%d")
        .with_context(|| format!("bad --start '{}'", data.start))?;
    let opts = LoadOptions {
        data_dir: data.data_dir.clone(),
        synthetic: data.synthetic,
        start,
        bars: data.bars,
    };
    let loaded = load_market(&config.universe, &opts)?;
    if loaded.data.is_empty() {
        bail!("no bars shared by every instrument in the universe");
    }
    if loaded.has_synthetic {
        warn!("running on SYNTHETIC data");
    }
    Ok(loaded)
}

fn run_init_config(output: Option<&Path>) -> Result<()> {
    let toml = EngineConfig::default().to_toml()?;
    match output {
        Some(path) => {
            if path.exists() {
                bail!("{} already exists; refusing to overwrite", path.display());
            }
            std::fs::write(path, toml).with_context(|| format!("writing {}", path.display()))?;
            println!("Wrote default configuration to {}", path.display());
        }
        None => print!("{toml}"),
    }
    Ok(())
}

fn run_train(config: &EngineConfig, data: &DataArgs) -> Result<()> {
    let registry = StrategyRegistry::from_config(&config.strategies)?;
    let loaded = load_data(config, data)?;
    let (train_ticks, _) = split_ticks(loaded.data.len(), config.lifecycle.train_fraction);
    if train_ticks.is_empty() {
        bail!("not enough bars for a training window ({} total)", loaded.data.len());
    }
    let store: Arc<dyn RankingStore> = open_store(config)?;
    let report = train(config, &registry, &loaded.data, train_ticks, store)?;

    println!();
    println!("=== TRAIN ===");
    println!("Ticks:          {}..={}", report.first_tick, report.last_tick);
    println!("Restored:       {} ({} skipped)", report.restored, report.restore_skipped);
    println!("Signals:        {}", report.stats.signals);
    println!("Abstentions:    {}", report.stats.abstentions);
    println!("Samples:        {} recorded, {} rejected", report.stats.samples_recorded, report.stats.samples_rejected);
    println!("Snapshots:      {}", report.stats.snapshots.len());
    for rejected in &report.stats.rejected_candidates {
        println!("REJECTED:       {rejected}");
    }
    match report.latest {
        Some(v) => println!("Latest:         {v} (not promoted; run `test` then `push`)"),
        None => println!("Latest:         none"),
    }
    println!();
    print_board(&report.board, None);
    Ok(())
}

fn run_test(
    config: &EngineConfig,
    data: &DataArgs,
    version: Option<SnapshotVersion>,
    output_dir: &Path,
) -> Result<()> {
    let registry = StrategyRegistry::from_config(&config.strategies)?;
    let loaded = load_data(config, data)?;
    let (_, test_ticks) = split_ticks(loaded.data.len(), config.lifecycle.train_fraction);
    if test_ticks.is_empty() {
        bail!("no held-out bars left for TEST; lower lifecycle.train_fraction");
    }
    let store = open_store(config)?;
    let report = lifecycle::test(config, &registry, &loaded.data, test_ticks, store.as_ref(), version)?;
    let snapshot = store.read_snapshot(report.version)?;

    let m = &report.metrics;
    println!();
    println!("=== TEST {} ===", report.version);
    println!("Decisions:      {}", m.decisions);
    println!("Trades:         {}", m.trades);
    println!("Hit Rate:       {:.1}%", m.hit_rate * 100.0);
    println!("Total Return:   {:.2}%", m.total_return * 100.0);
    println!("Mean Return:    {:.4}%", m.mean_return * 100.0);
    println!("Sharpe:         {:.3}", m.sharpe);
    println!("Max Drawdown:   {:.2}%", m.max_drawdown * 100.0);
    println!("Abstentions:    {}", report.abstentions);
    println!("Gate:           {}", if report.passed { "PASSED" } else { "FAILED" });
    if loaded.has_synthetic {
        println!();
        println!("WARNING: Results based on SYNTHETIC data");
    }

    let manifest = EvaluationManifest::new(snapshot, report, loaded.dataset_hash, loaded.has_synthetic);
    let run_dir = save_artifacts(&manifest, output_dir)?;
    println!();
    println!("Artifacts saved to: {}", run_dir.display());
    Ok(())
}

fn run_push(config: &EngineConfig, version: Option<SnapshotVersion>, force: bool) -> Result<()> {
    let registry = StrategyRegistry::from_config(&config.strategies)?;
    let store = open_store(config)?;
    let report = push(config, &registry, store.as_ref(), PushOptions { version, force })?;
    match report.previous {
        Some(prev) => println!("Promoted {} (was {prev})", report.version),
        None => println!("Promoted {}", report.version),
    }
    if report.attempts > 1 {
        println!("Took {} attempts", report.attempts);
    }
    if report.forced {
        println!("WARNING: TEST gate skipped (--force)");
    }
    Ok(())
}

fn run_live(config: &EngineConfig, data: &DataArgs, ticks: usize, interval_ms: u64, cash: f64) -> Result<()> {
    let registry = StrategyRegistry::from_config(&config.strategies)?;
    let loaded = load_data(config, data)?;
    let market = &loaded.data;
    let store = open_store(config)?;
    let reader: Arc<dyn SnapshotSource> = store;
    let mut trader = LiveTrader::spawn(config, &registry, reader, PaperBroker::new(cash))?;

    let first = market.len().saturating_sub(ticks.max(1));
    for tick in first..market.len() {
        let at = market.timeline()[tick];
        let out = trader.tick(market.contexts(tick, config.lifecycle.history_window), at);
        let version = out
            .snapshot_version
            .map_or_else(|| "none".to_string(), |v| v.to_string());
        for d in &out.decisions {
            println!(
                "{} [{version}] {:<6} {:<4} score {:.3} size {:.2}",
                at.format("%Y-%m-%d"),
                d.instrument,
                d.action.to_string(),
                d.aggregate_score,
                d.sizing_hint
            );
        }
        for e in &out.executions {
            println!("  -> {} {} x{:.0} @ {:.2} ({:?})", e.action, e.instrument, e.quantity, e.price, e.status);
        }
        for f in &out.failures {
            println!("  !! {}: {}", f.instrument, f.error);
        }
        if interval_ms > 0 {
            std::thread::sleep(Duration::from_millis(interval_ms));
        }
    }

    let broker = trader.adapter();
    println!();
    println!("Cash:           {:.2}", broker.cash());
    println!("Portfolio:      {:.2}", broker.portfolio_value());
    for (sym, qty) in broker.holdings() {
        println!("  {sym:<8} {qty:.0}");
    }
    Ok(())
}

fn run_rank(config: &EngineConfig, data: &DataArgs, cadence: Option<usize>, force: bool) -> Result<()> {
    let registry = StrategyRegistry::from_config(&config.strategies)?;
    let loaded = load_data(config, data)?;
    let market = &loaded.data;
    let store: Arc<dyn RankingStore> = open_store(config)?;
    let log = store.read_outcomes()?;

    let timeline = market.timeline();
    let start = timeline[0];
    let clock = ManualClock::new(log.iter().map(|s| s.signal_timestamp).max().map_or(start, |t| t.max(start)));
    let mut process = RankingProcess::new(
        config,
        &registry,
        Arc::clone(&store),
        Arc::new(clock.clone()),
        Box::new(InlineCollector::new(registry.enabled())),
    )
    .with_auto_promote(PromotionPolicy::from_config(config).forced(force));
    if config.lifecycle.require_tested && !force {
        warn!("lifecycle.require_tested is set; new snapshots stay unpromoted until tested and pushed (or rank --force)");
    }
    if let Some(cadence) = cadence {
        process = process.with_cadence(cadence);
    }
    let skipped = process.restore(&log)?;
    info!(restored = log.len() - skipped, skipped, "outcome log restored");

    let mut last = start;
    for tick in 0..market.len() {
        last = timeline[tick];
        clock.set(last);
        process.on_tick(market, tick)?;
    }
    let stats = process.finish(last)?;

    println!();
    println!("=== RANK ===");
    println!("Ticks:          {}", stats.ticks);
    println!("Samples:        {} recorded, {} rejected", stats.samples_recorded, stats.samples_rejected);
    println!("Snapshots:      {}", stats.snapshots.len());
    for rejected in &stats.rejected_candidates {
        println!("REJECTED:       {rejected}");
    }
    if !stats.withheld.is_empty() {
        println!("Withheld:       {} (no passing TEST; run `test` then `push`)", stats.withheld.len());
    }
    match stats.promoted {
        Some(v) => println!("Live:           {v}"),
        None => println!("Live:           unchanged"),
    }
    Ok(())
}

fn run_status(config: &EngineConfig, scores: bool) -> Result<()> {
    let store = open_store(config)?;
    let versions = store.list_versions()?;
    let current = store.current_version()?;

    println!("Store:          {}", store.root().display());
    println!("Outcomes:       {}", store.read_outcomes()?.len());
    println!(
        "Current:        {}",
        current.map_or_else(|| "none".to_string(), |v| v.to_string())
    );
    println!();
    if versions.is_empty() {
        println!("No snapshots finalized yet.");
    } else {
        println!("{:<8} {:<22} {:<10} {:>8} {:>10}", "Version", "Created", "Gate", "Trades", "Return");
        println!("{}", "-".repeat(62));
        for v in &versions {
            let snapshot = store.read_snapshot(*v)?;
            let (gate, trades, ret) = match store.read_evaluation(*v)? {
                Some(r) => (
                    if r.passed { "passed" } else { "failed" },
                    r.metrics.trades.to_string(),
                    format!("{:.2}%", r.metrics.total_return * 100.0),
                ),
                None => ("untested", "-".to_string(), "-".to_string()),
            };
            let marker = if Some(*v) == current { "*" } else { "" };
            println!(
                "{:<8} {:<22} {:<10} {:>8} {:>10}",
                format!("{v}{marker}"),
                snapshot.created_at.format("%Y-%m-%d %H:%M:%S"),
                gate,
                trades,
                ret
            );
        }
    }

    let board = store.read_current_scores()?;
    let live = current.map(|v| store.read_snapshot(v)).transpose()?;
    println!();
    print_board(&board, live.as_ref());
    if scores {
        println!();
        print!("{}", export_scores_csv(&board)?);
    }
    Ok(())
}

fn run_audit(config: &EngineConfig, tolerance: f64) -> Result<()> {
    let store = open_store(config)?;
    let report = audit_scores(store.as_ref(), &config.decay, tolerance)?;
    println!("Audited {} samples across {} strategies", report.samples, report.entries.len());
    for e in &report.entries {
        let stored = e.stored.map_or_else(|| "missing".to_string(), |s| format!("{s:.6}"));
        println!(
            "{} {:<16} stored {:>12} replayed {:>12.6} samples {}/{}",
            if e.matches { " " } else { "!" },
            e.strategy_id.as_str(),
            stored,
            e.replayed,
            e.stored_samples,
            e.logged_samples
        );
    }
    if !report.is_clean() {
        bail!("{} strategy score(s) disagree with the outcome log", report.mismatches().count());
    }
    Ok(())
}

/// Score board, with each strategy's rank and weight in `live` when given.
fn print_board(board: &ensemble_core::tracker::ScoreBoard, live: Option<&RankingSnapshot>) {
    if board.is_empty() {
        println!("No scores recorded.");
        return;
    }
    println!(
        "{:<16} {:>10} {:>8} {:>8} {:>10} {:>5} {:>7}",
        "Strategy", "Score", "Samples", "HitRate", "Updated", "Rank", "Weight"
    );
    println!("{}", "-".repeat(70));
    for (id, state) in board {
        let hit_rate = state
            .hit_rate()
            .map_or_else(|| "-".to_string(), |r| format!("{:.1}%", r * 100.0));
        let updated = state
            .last_update
            .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d").to_string());
        let (rank, weight) = match live {
            Some(snapshot) => (
                snapshot.rank_of(id).map_or_else(|| "-".to_string(), |r| r.to_string()),
                format!("{:.3}", snapshot.weight(id)),
            ),
            None => ("-".to_string(), "-".to_string()),
        };
        println!(
            "{:<16} {:>10.4} {:>8} {:>8} {:>10} {:>5} {:>7}",
            id.as_str(),
            state.score,
            state.sample_count,
            hit_rate,
            updated,
            rank,
            weight
        );
    }
}
