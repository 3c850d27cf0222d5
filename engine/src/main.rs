#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Forbid unwrap() in production code to prevent panics from corrupt data.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
use std::path::Path;
use std::process::ExitCode;

use engine::btree2::{BTree2, KeyValue, KeyValueClass, Walk};
use engine::simulation::{Simulator, SimulatorConfig};
use engine::{BTreeError, EngineConfig, FileStorage, IndexFile};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage:
  engine load <path> <count>       create <path> and insert keys 0..count
  engine dump <path>               print the tree stored in <path>
  engine simulate [seed] [ops]     run a model-checked random workload";

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment variables
    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        "Loaded configuration: node_size={}, split_percent={}, merge_percent={}, swmr_write={}",
        config.node_size,
        config.split_percent,
        config.merge_percent,
        config.swmr_write
    );

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let result = match args.as_slice() {
        ["load", path, count] => match count.parse::<u64>() {
            Ok(count) => load(&config, Path::new(path), count),
            Err(e) => Err(format!("invalid count {count}: {e}")),
        },
        ["dump", path] => dump(Path::new(path)),
        ["simulate", rest @ ..] => simulate(&config, rest),
        _ => Err(USAGE.to_string()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            tracing::error!("{message}");
            ExitCode::FAILURE
        }
    }
}

fn load(config: &EngineConfig, path: &Path, count: u64) -> Result<(), String> {
    let storage = FileStorage::create(path)
        .map_err(|e| format!("failed to create {}: {e}", path.display()))?;
    let mut file = IndexFile::create(storage, config.file_options()).map_err(|e| e.to_string())?;
    let tree = BTree2::create(&mut file, KeyValueClass, config.create_params())
        .map_err(|e| e.to_string())?;

    for key in 0..count {
        tree.insert(&mut file, &KeyValue { key, value: key })
            .map_err(|e| format!("insert {key}: {e}"))?;
    }
    tree.check_invariants(&mut file).map_err(|e| e.to_string())?;

    let depth = tree.depth(&mut file).map_err(|e| e.to_string())?;
    let size = tree.size(&mut file).map_err(|e| e.to_string())?;
    file.set_root_object(tree.address());
    tree.close(&mut file).map_err(|e| e.to_string())?;
    file.close().map_err(|e| e.to_string())?;

    tracing::info!(
        "Loaded {count} records into {}: depth={depth}, tree_bytes={size}",
        path.display()
    );
    Ok(())
}

fn dump(path: &Path) -> Result<(), String> {
    let storage = FileStorage::open(path)
        .map_err(|e| format!("failed to open {}: {e}", path.display()))?;
    let mut file = IndexFile::open(storage, false).map_err(|e| e.to_string())?;
    let root = file.root_object();
    let tree = BTree2::open(&mut file, KeyValueClass, root).map_err(|e| e.to_string())?;

    let report = tree
        .debug_dump(&mut file)
        .and_then(|dump| {
            let mut records = 0u64;
            tree.iterate(&mut file, |_| {
                records += 1;
                Walk::Continue
            })?;
            Ok::<_, BTreeError>((dump, records))
        })
        .map_err(|e| e.to_string());
    tree.close(&mut file).map_err(|e| e.to_string())?;

    let (dump, records) = report?;
    println!("{dump}");
    tracing::info!("Walked {records} records");
    Ok(())
}

fn simulate(config: &EngineConfig, args: &[&str]) -> Result<(), String> {
    let seed = match args.first() {
        Some(seed) => seed
            .parse::<u64>()
            .map_err(|e| format!("invalid seed {seed}: {e}"))?,
        None => 0,
    };
    let operations = match args.get(1) {
        Some(ops) => ops
            .parse::<u64>()
            .map_err(|e| format!("invalid operation count {ops}: {e}"))?,
        None => 10_000,
    };

    let mut sim_config = SimulatorConfig::new(seed).with_params(config.create_params());
    if config.swmr_write {
        sim_config = sim_config.with_swmr_write();
    }
    let result = Simulator::new(sim_config).run(operations);

    tracing::info!(
        "Simulation seed={seed}: operations={}, mutations={}, expected_failures={}, final_records={}, final_depth={}",
        result.operations,
        result.mutations,
        result.expected_failures,
        result.final_records,
        result.final_depth
    );
    if result.passed() {
        Ok(())
    } else {
        Err(format!(
            "simulation failed: violations={:?}, error={:?}",
            result.invariant_violations, result.error
        ))
    }
}
