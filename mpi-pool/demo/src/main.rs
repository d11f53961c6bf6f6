// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use clap::Parser;
use mpi_pool_core::{choose_pool, task_fn, MapOptions, Message, PoolError, Role, TaskPool};
use mpi_pool_local_group::{LocalCommunicator, LocalGroup};
use rand::Rng;
use serde::Deserialize;
use std::fs;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "MPI_POOL_LOG";

/// Sum of squares over random pairs, spread across an in-process group
#[derive(Debug, Parser)]
struct Args {
    /// JSON configuration file
    #[arg(long, default_value = "config.json")]
    config: String,

    /// Group size, master included
    #[arg(long)]
    ranks: Option<usize>,

    /// Number of random pairs
    #[arg(long)]
    tasks: Option<usize>,

    /// Run on the calling task instead of a group
    #[arg(long)]
    serial: bool,

    /// Hand out tasks round-robin up front
    #[arg(long)]
    no_load_balance: bool,

    /// Send one batch of pairs per worker
    #[arg(long)]
    batched: bool,
}

#[derive(Debug, Deserialize)]
struct Config {
    ranks: usize,
    tasks: usize,
    sample: usize,
}

impl Config {
    fn load(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    load_balance: bool,
    batched: bool,
}

async fn sum_of_squares<P: TaskPool>(
    pool: &mut P,
    pairs: Vec<(f64, f64)>,
    settings: Settings,
) -> Result<Vec<f64>, PoolError> {
    if settings.batched {
        let batch_worker = task_fn(|batch: Vec<(f64, f64)>| {
            Ok(batch
                .into_iter()
                .map(|(a, b)| a * a + b * b)
                .collect::<Vec<f64>>())
        });
        let batches = pool.batched_map(&batch_worker, pairs).await?;
        return Ok(batches.into_iter().flatten().collect());
    }

    let worker = task_fn(|(a, b): (f64, f64)| Ok(a * a + b * b));
    let mut received = 0;
    let results = pool
        .map_with(
            &worker,
            pairs,
            MapOptions::default().load_balance(settings.load_balance),
            |_| received += 1,
        )
        .await?;
    debug!("Callback saw {} results", received);
    Ok(results.unwrap_or_default())
}

/// Runs the program on one rank; only the master has results
async fn run_rank(
    comm: Option<LocalCommunicator<Message>>,
    pairs: Vec<(f64, f64)>,
    settings: Settings,
) -> Result<Option<Vec<f64>>, PoolError> {
    match choose_pool(comm).await? {
        Role::Worker(exit) => {
            debug!("Worker {} completed {} tasks", exit.rank, exit.tasks_completed);
            Ok(None)
        }
        Role::Master(mut pool) => {
            let outcome = sum_of_squares(&mut pool, pairs, settings).await;
            pool.close();
            outcome.map(Some)
        }
    }
}

async fn run_group(
    ranks: usize,
    pairs: Vec<(f64, f64)>,
    settings: Settings,
) -> Result<Option<Vec<f64>>, Box<dyn std::error::Error>> {
    let pairs = Arc::new(pairs);
    let outputs = LocalGroup::run(ranks, move |comm: LocalCommunicator<Message>| {
        let pairs = pairs.clone();
        async move { run_rank(Some(comm), pairs.to_vec(), settings).await }
    })
    .await?;

    match outputs.into_iter().next() {
        Some(master) => Ok(master?),
        None => Ok(None),
    }
}

fn init_tracing() {
    let filter = if std::env::var(LOG_ENV).is_ok() {
        EnvFilter::from_env(LOG_ENV)
    } else {
        EnvFilter::default().add_directive(LevelFilter::WARN.into())
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();
    let start_time = Instant::now();

    let config = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args.config, e);
            eprintln!("Using default configuration...");
            Config {
                ranks: 4,
                tasks: 1_000,
                sample: 10,
            }
        }
    };
    let ranks = args.ranks.unwrap_or(config.ranks);
    let task_count = args.tasks.unwrap_or(config.tasks);
    let settings = Settings {
        load_balance: !args.no_load_balance,
        batched: args.batched,
    };

    println!("=== MPI POOL SUM OF SQUARES ===");
    println!("Configuration:");
    if args.serial {
        println!("  - Pool: serial");
    } else {
        println!("  - Pool: local group of {} ranks", ranks);
    }
    println!("  - Tasks: {}", task_count);
    println!("  - Load balancing: {}", settings.load_balance);
    println!("  - Batched: {}", settings.batched);

    let mut rng = rand::rng();
    let pairs: Vec<(f64, f64)> = (0..task_count)
        .map(|_| (rng.random::<f64>(), rng.random::<f64>()))
        .collect();

    let results = if args.serial {
        run_rank(None, pairs.clone(), settings).await?
    } else {
        run_group(ranks, pairs.clone(), settings).await?
    };
    let results = results.ok_or("rank 0 did not run as master")?;

    println!("\n=== RESULTS ===");
    for ((a, b), result) in pairs.iter().zip(&results).take(config.sample) {
        println!("  {:.4}^2 + {:.4}^2 = {:.4}", a, b, result);
    }
    println!(
        "\nComputed {} results in {:.2?}",
        results.len(),
        start_time.elapsed()
    );
    Ok(())
}
