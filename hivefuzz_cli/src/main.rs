use hivefuzz_core::config::{HivefuzzConfig, StoreConfig};
use hivefuzz_core::driver::{DriverError, DriverSettings, TargetDriver};
use hivefuzz_core::executor::{InProcessExecutor, StopTest, TestCase};
use hivefuzz_core::hub::{Hub, SharedState};
use hivefuzz_core::storage::Database;
use hivefuzz_core::worker::{TargetFactory, Worker};

use anyhow::{Context, anyhow};
use clap::Parser;
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Number of worker threads; overrides `[hub] workers`.
    #[clap(short, long)]
    workers: Option<usize>,
    /// How long to fuzz before printing the summary.
    #[clap(short, long, default_value_t = 10)]
    duration_secs: u64,
    /// Persist to this directory; overrides `[store]`.
    #[clap(long, conflicts_with = "in_memory")]
    store_dir: Option<PathBuf>,
    /// Keep everything in memory; overrides `[store]`.
    #[clap(long)]
    in_memory: bool,
    /// Only fuzz the named demo targets.
    #[clap(short, long)]
    target: Vec<String>,
    /// Log filter used when RUST_LOG is unset.
    #[clap(long, default_value = "info")]
    log: String,
    #[clap(long, default_value_t = 0)]
    seed: u64,
}

type Harness = fn(&mut TestCase<'_>) -> Result<(), StopTest>;

fn bad_prefix(tc: &mut TestCase<'_>) -> Result<(), StopTest> {
    let data = tc.draw_bytes(0, 8)?;
    if data.first() == Some(&b'B') {
        tc.branch();
        if data.get(1) == Some(&b'A') {
            tc.branch();
            if data.get(2) == Some(&b'D') {
                panic!("BAD input detected by harness!");
            }
        }
    }
    Ok(())
}

fn crash_word(tc: &mut TestCase<'_>) -> Result<(), StopTest> {
    let mut matched = 0;
    for expected in b"CRASH" {
        let c = tc.draw_integer(b'A' as i64, b'Z' as i64)?;
        if c != *expected as i64 {
            break;
        }
        matched += 1;
        tc.event_with("matched", matched);
    }
    if matched == 5 {
        panic!("CRASH input detected by harness!");
    }
    Ok(())
}

fn bounded_sum(tc: &mut TestCase<'_>) -> Result<(), StopTest> {
    let n = tc.draw_integer(1, 6)?;
    let mut sum = 0i64;
    for _ in 0..n {
        sum += tc.draw_integer(0, 100)?;
    }
    tc.assume(sum > 0)?;
    tc.target("sum", sum as f64);
    if sum > 500 {
        tc.branch();
    }
    Ok(())
}

fn unit_interval(tc: &mut TestCase<'_>) -> Result<(), StopTest> {
    let x = tc.draw_float(0.0, 1.0)?;
    let flip = tc.draw_bool(0.1)?;
    if flip {
        tc.event("flipped");
    }
    tc.event_with("decile", (x * 10.0) as u32);
    Ok(())
}

const DEMO_TARGETS: &[(&str, Harness)] = &[
    ("bad_prefix", bad_prefix),
    ("crash_word", crash_word),
    ("bounded_sum", bounded_sum),
    ("unit_interval", unit_interval),
];

fn find_harness(name: &str) -> Option<Harness> {
    DEMO_TARGETS
        .iter()
        .find(|(target, _)| *target == name)
        .map(|(_, harness)| *harness)
}

fn load_config(cli: &Cli) -> Result<HivefuzzConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(path) => {
            info!(path = ?path, "loading configuration");
            HivefuzzConfig::load_from_file(path)?
        }
        None => {
            let default_path = PathBuf::from("hivefuzz.toml");
            if default_path.exists() {
                info!(path = ?default_path, "loading default configuration");
                HivefuzzConfig::load_from_file(&default_path)?
            } else {
                info!("no configuration file found, using built-in defaults");
                HivefuzzConfig::default()
            }
        }
    };

    if let Some(workers) = cli.workers {
        config.hub.workers = workers;
    }
    if let Some(dir) = &cli.store_dir {
        config.store = Some(StoreConfig::Directory { path: dir.clone() });
    } else if cli.in_memory {
        config.store = Some(StoreConfig::InMemory);
    }
    config.validate()?;
    Ok(config)
}

fn target_factory(
    store: Arc<dyn Database>,
    settings: DriverSettings,
    max_choices: usize,
) -> TargetFactory {
    Box::new(move |name: &str, seed: u64| {
        let harness =
            find_harness(name).ok_or_else(|| DriverError::UnknownTarget(name.to_string()))?;
        let executor =
            Box::new(InProcessExecutor::new(name, harness).with_max_choices(max_choices));
        TargetDriver::new(name, executor, Some(store.clone()), settings.clone(), seed)
    })
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(&cli)?;
    info!(config = ?config, "effective configuration");
    let store = config
        .open_store()
        .context("a persistent store is required: set [store] or pass --store-dir/--in-memory")?;

    let names: Vec<&str> = if cli.target.is_empty() {
        DEMO_TARGETS.iter().map(|(name, _)| *name).collect()
    } else {
        for name in &cli.target {
            if find_harness(name).is_none() {
                return Err(anyhow!("unknown target {name:?}"));
            }
        }
        cli.target.iter().map(String::as_str).collect()
    };

    let state = SharedState::new(names.iter().copied());
    let duration = Duration::from_secs(cli.duration_secs);
    let mut seeds = ChaCha8Rng::seed_from_u64(cli.seed);
    let driver_settings = DriverSettings::from(&config.fuzzer);
    let workers: Vec<Worker> = (0..config.hub.workers)
        .map(|id| {
            Worker::new(
                id,
                state.clone(),
                target_factory(store.clone(), driver_settings.clone(), config.fuzzer.max_choices),
                &config.fuzzer,
                duration,
                seeds.next_u64(),
            )
        })
        .collect();
    let mut hub = Hub::new(state.clone(), config.hub.rebalance_interval());

    println!(
        "Fuzzing {} targets with {} workers for {:?}...",
        names.len(),
        workers.len(),
        duration
    );
    let stop = AtomicBool::new(false);
    let start_time = Instant::now();
    let finished: Vec<Worker> = std::thread::scope(|scope| -> Result<Vec<Worker>, anyhow::Error> {
        let hub_handle = scope.spawn(|| hub.run(&stop));
        let handles: Vec<_> = workers
            .into_iter()
            .map(|mut worker| {
                let stop = &stop;
                scope.spawn(move || worker.run(stop).map(|()| worker))
            })
            .collect();

        std::thread::sleep(duration);
        stop.store(true, Ordering::Relaxed);

        let mut finished = Vec::new();
        for handle in handles {
            let worker = handle
                .join()
                .map_err(|_| anyhow!("worker thread panicked"))??;
            finished.push(worker);
        }
        hub_handle
            .join()
            .map_err(|_| anyhow!("hub thread panicked"))??;
        Ok(finished)
    })?;

    println!("\nFuzzing finished in {:.2?}.", start_time.elapsed());
    let mut failures = 0;
    for worker in &finished {
        println!("Worker {} ({} batches):", worker.id(), worker.batches());
        for driver in worker.drivers() {
            println!(
                "  {:<14} phase={:<8} inputs={:<8} behaviors={:<5} corpus={:<5}",
                driver.name(),
                driver.phase(),
                driver.ninputs(),
                driver.corpus().num_behaviors(),
                driver.corpus().len()
            );
            for observation in driver.corpus().failures().values() {
                failures += 1;
                println!("    failure: {}", observation.representation);
            }
        }
        for target in worker.setup_errors() {
            warn!(name = %target, "setup error");
        }
    }
    println!("Rebalances: {}, Failures: {}", hub.rebalances(), failures);
    Ok(())
}
