//! Model selection CLI - Run a search from JSON configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use model_select::{
    checkpoint::CheckpointStore,
    schema::{
        AxisSpec, CriterionKind, FamosConfig, LedgerStatus, ProblemConfig, SearchMethod,
        SubspaceSpec,
    },
    select::{Calibrator, Problem, SyntheticCalibrator, TableCalibrator, TableEntry},
};

/// Where calibration results come from.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum CalibrationSource {
    /// Precomputed results, e.g. from an earlier run.
    Table { entries: Vec<TableEntry> },
    /// Synthetic likelihood landscape.
    Synthetic(SyntheticCalibrator),
}

impl CalibrationSource {
    fn into_calibrator(self) -> Box<dyn Calibrator> {
        match self {
            CalibrationSource::Table { entries } => Box::new(TableCalibrator::new(entries)),
            CalibrationSource::Synthetic(synthetic) => Box::new(synthetic),
        }
    }
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        if args.len() > 1 && args[1] == "--example" {
            print_example();
            return;
        }

        eprintln!(
            "Usage: {} <problem.json> <calibrations.json> [checkpoint_dir]",
            args[0]
        );
        eprintln!();
        eprintln!("Run model selection with calibrations from a table or a synthetic landscape.");
        eprintln!();
        eprintln!("Arguments:");
        eprintln!("  problem.json       Problem configuration (subspaces, criterion, method)");
        eprintln!("  calibrations.json  Calibration source");
        eprintln!("  checkpoint_dir     Resume from and checkpoint into this directory");
        eprintln!();
        eprintln!("Example files are printed with the --example flag.");
        std::process::exit(1);
    }

    let config: ProblemConfig = read_json(Path::new(&args[1]), "problem configuration");
    let source: CalibrationSource = read_json(Path::new(&args[2]), "calibration source");
    let calibrator = source.into_calibrator();

    let problem = match args.get(3).map(PathBuf::from) {
        Some(dir) => Problem::open(config, CheckpointStore::new(dir)),
        None => Problem::new(config),
    };
    let mut problem = problem.unwrap_or_else(|e| {
        eprintln!("Error setting up problem: {}", e);
        std::process::exit(1);
    });

    println!("Model Selection");
    println!("===============");
    println!(
        "Subspaces: {} ({} models before deduplication)",
        problem.model_space().all_subspaces().len(),
        problem.model_space().total_size()
    );
    println!("Method: {}", problem.config().method.name());
    println!("Criterion: {}", problem.config().criterion);
    println!();

    let result = problem
        .run_with_callback(calibrator.as_ref(), |progress| {
            let value = progress
                .incumbent_value
                .map_or_else(|| "-".to_string(), |v| format!("{v:.4}"));
            println!(
                "  Iteration {}: {} proposed, {} failed, best={}, {}",
                progress.iteration,
                progress.batch_size,
                progress.batch_failures,
                value,
                progress.phase
            );
        })
        .unwrap_or_else(|e| {
            eprintln!("Search failed: {}", e);
            std::process::exit(1);
        });

    println!();
    println!(
        "Stopped: {:?} after {} iteration(s) ({:.2}s)",
        result.stats.stop_reason, result.stats.iterations, result.stats.elapsed_seconds
    );
    println!(
        "Calibrated: {}, failed: {}",
        result.stats.calibrated, result.stats.failed
    );

    match &result.incumbent {
        Some(best) => {
            println!();
            println!("Selected model: {}", best.id());
            println!("  Subspace: {}", best.subspace_id());
            println!("  {}", best.label());
            if let Ok(value) = best.get_criterion(problem.config().criterion) {
                println!("  {}: {:.4}", value.kind, value.value);
            }
        }
        None => println!("No model could be calibrated."),
    }

    if let Ok(top) = problem.best_models(5)
        && top.len() > 1
    {
        println!();
        println!("Top models:");
        for model in top {
            if let Ok(value) = model.get_criterion(problem.config().criterion) {
                println!("  {:.4}  {}", value.value, model.label());
            }
        }
    }

    let failures: Vec<_> = result
        .ledger
        .iter()
        .filter_map(|e| match &e.status {
            LedgerStatus::Failed { reason } => Some((&e.model, reason)),
            LedgerStatus::Calibrated => None,
        })
        .collect();
    if !failures.is_empty() {
        println!();
        println!("Failed calibrations:");
        for (model, reason) in failures {
            println!("  {}: {}", model.short(), reason);
        }
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path, what: &str) -> T {
    let content = fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Error reading {} file: {}", what, e);
        std::process::exit(1);
    });
    serde_json::from_str(&content).unwrap_or_else(|e| {
        eprintln!("Error parsing {}: {}", what, e);
        std::process::exit(1);
    })
}

fn print_example() {
    let config = ProblemConfig::new(
        CriterionKind::Aicc,
        SearchMethod::Famos(FamosConfig::default()),
        vec![SubspaceSpec {
            id: "M1".to_string(),
            base: "model.xml".to_string(),
            dataset: Some("measurements.tsv".to_string()),
            axes: vec![
                AxisSpec::toggle("k1", 0.0),
                AxisSpec::toggle("k2", 0.0),
                AxisSpec::toggle("k3", 1.0),
            ],
        }],
    );
    let source = CalibrationSource::Synthetic(
        SyntheticCalibrator::new(100.0, 60)
            .with_effect("k1", -6.0)
            .with_effect("k2", -0.5)
            .with_effect("k3", -0.5)
            .with_interaction(&["k2", "k3"], -12.0),
    );

    println!("// problem.json");
    println!("{}", serde_json::to_string_pretty(&config).unwrap_or_default());
    println!("// calibrations.json");
    println!("{}", serde_json::to_string_pretty(&source).unwrap_or_default());
}
