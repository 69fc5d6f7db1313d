//! subtree-sim
//!  * --config FILE   – run a stored configuration
//!  * --random-config – draw a ClustalW configuration over the input dir
use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgGroup, Command};
use log::info;
use rand::{rngs::StdRng, SeedableRng};
use std::path::{Path, PathBuf};
use subtree_sim::{host, Pipeline, RunConfig, RunContext, RunPaths};

/// Worker count when `--threads` is absent: the scheduler's `NSLOTS`,
/// else every logical CPU.
fn default_workers() -> usize {
    std::env::var("NSLOTS")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or_else(num_cpus::get)
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env().init();
    let m = Command::new("subtree-sim")
        .about("Pairwise subtree agreement across per-file protein trees")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Run configuration in JSON format"),
        )
        .arg(
            Arg::new("random-config")
                .long("random-config")
                .help("Generate a random ClustalW configuration")
                .action(ArgAction::SetTrue),
        )
        .group(
            ArgGroup::new("source")
                .args(["config", "random-config"])
                .required(true),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .help("Root of inputs, outputs and provenance")
                .default_value("../data"),
        )
        .arg(
            Arg::new("input-dir")
                .short('i')
                .long("input-dir")
                .help("Directory holding the FASTA inputs [default: DATA/full_dataset_plasmodium]"),
        )
        .arg(
            Arg::new("threads")
                .short('t')
                .long("threads")
                .help("Stage workers [default: $NSLOTS or logical CPUs]")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("intersect-threads")
                .long("intersect-threads")
                .help("Workers for splitting large leaf-set intersections [default: --threads]")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("batch-size")
                .long("batch-size")
                .help("Similarity records per database insert")
                .value_parser(clap::value_parser!(usize))
                .default_value("10000"),
        )
        .arg(
            Arg::new("db")
                .long("db")
                .help("Similarity database [default: OUT/Similaridades/similarity.db]"),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .help("Seed for --random-config")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("keep-scratch")
                .long("keep-scratch")
                .help("Keep alignments, trees and subtrees after the run")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let data_dir = PathBuf::from(m.get_one::<String>("data-dir").context("missing --data-dir")?);
    let input_dir = m.get_one::<String>("input-dir").map(PathBuf::from);
    let paths = RunPaths::new(&data_dir, input_dir.as_deref());
    paths.create_all()?;

    /* ─────────── Configuration ─────────── */
    let config = if let Some(file) = m.get_one::<String>("config") {
        RunConfig::load(Path::new(file))?
    } else {
        let mut rng = match m.get_one::<u64>("seed") {
            Some(&seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let cfg = RunConfig::random(&paths.input, &mut rng)?;
        let saved = paths.provenance.join("config.json");
        cfg.save(&saved)?;
        info!("random configuration written to {}", saved.display());
        cfg
    };

    /* ─────────── Pools ─────────── */
    let workers = m.get_one::<usize>("threads").copied().unwrap_or_else(default_workers);
    let nested = m.get_one::<usize>("intersect-threads").copied().unwrap_or(workers);
    let h = host::summary();
    info!(
        "host: {} ({} logical / {} physical cores, {} RAM), {workers} stage worker(s)",
        h.cpu_name,
        h.cores_logical,
        h.cores_physical,
        host::format_bytes(h.ram_total_bytes)
    );

    let mut ctx = RunContext::new(config, paths, workers, nested)?
        .with_batch_size(m.get_one::<usize>("batch-size").copied().unwrap_or(10_000))
        .with_keep_scratch(m.get_flag("keep-scratch"));
    if let Some(db) = m.get_one::<String>("db") {
        ctx = ctx.with_db_path(db);
    }

    /* ─────────── Run ─────────── */
    let report = Pipeline::new(ctx).run()?;
    if let Some(failure) = report.failure {
        return Err(failure.into());
    }
    info!(
        "{} comparison(s), {} record(s) stored",
        report.comparisons.compared,
        report.store.map(|s| s.rows).unwrap_or(0)
    );
    Ok(())
}
