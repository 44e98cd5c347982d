use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use paradiag_core::{CompiledScenario, ConstraintId, ConstraintSet, DiagnosisConfig, Oracle, Scenario};
use paradiag_engine::{ParallelDiagnoser, SequentialDiagnoser};

#[derive(Parser)]
#[command(name = "paradiag-cli")]
#[command(about = "Minimal diagnoses of inconsistent constraint sets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find a minimal diagnosis for a scenario file
    Diagnose {
        /// Scenario file (YAML, or JSON with a .json extension)
        #[arg(short, long)]
        scenario: PathBuf,

        /// Configuration file, layered under PARADIAG_* variables
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Run the single-threaded baseline instead
        #[arg(long)]
        sequential: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show what a scenario declares without diagnosing it
    Inspect {
        #[arg(short, long)]
        scenario: PathBuf,
    },
}

#[derive(Serialize)]
struct SequentialSummary {
    diagnosis: Vec<String>,
    oracle_invocations: u64,
    elapsed_ms: u64,
}

fn load_scenario(path: &PathBuf) -> Result<CompiledScenario> {
    let scenario = Scenario::from_path(path).with_context(|| format!("reading scenario {}", path.display()))?;
    Ok(scenario.compile()?)
}

fn check_expected(compiled: &CompiledScenario, diagnosis: &ConstraintSet) -> Result<()> {
    if let Some(expected) = &compiled.expected {
        if expected != diagnosis {
            bail!(
                "diagnosis {} differs from expected {}",
                compiled.catalog.render(diagnosis),
                compiled.catalog.render(expected)
            );
        }
        info!("Diagnosis matches the expected result");
    }
    Ok(())
}

fn diagnose(scenario: PathBuf, config: Option<PathBuf>, sequential: bool, json: bool) -> Result<()> {
    let compiled = load_scenario(&scenario)?;
    let name = |id: ConstraintId| compiled.catalog.name(id).unwrap_or("?").to_string();

    if sequential {
        let started = Instant::now();
        let mut diagnoser = SequentialDiagnoser::new(compiled.oracle.try_clone()?);
        let (diagnosis, snapshot) = diagnoser.diagnose(&compiled.candidates, &compiled.background)?;
        let summary = SequentialSummary {
            diagnosis: diagnosis.iter().map(name).collect(),
            oracle_invocations: snapshot.oracle_invocations(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        if json {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        } else {
            println!("Diagnosis: {}", compiled.catalog.render(&diagnosis));
            println!("Oracle invocations: {}", summary.oracle_invocations);
            println!("Elapsed: {}ms", summary.elapsed_ms);
        }
        return check_expected(&compiled, &diagnosis);
    }

    let config = DiagnosisConfig::load(config.as_deref())?;
    let diagnoser = ParallelDiagnoser::new(compiled.oracle.try_clone()?, config);
    let report = diagnoser.diagnose(&compiled.candidates, &compiled.background)?;
    let summary = report.summarize(name);
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Diagnosis: {}", compiled.catalog.render(&report.diagnosis));
        println!("Oracle invocations: {}", summary.oracle_invocations);
        println!(
            "Cache: {} entries ({} by oracle, {} inferred, {} pruned, {} failed)",
            summary.cache.entries, summary.cache.by_oracle, summary.cache.inferred, summary.cache.pruned, summary.cache.failed
        );
        println!("Elapsed: {}ms", summary.elapsed_ms);
    }
    check_expected(&compiled, &report.diagnosis)
}

fn inspect(scenario: PathBuf) -> Result<()> {
    let compiled = load_scenario(&scenario)?;
    println!("Candidates ({}): {}", compiled.candidates.len(), compiled.catalog.render(&compiled.candidates));
    println!("Background ({}): {}", compiled.background.len(), compiled.catalog.render(&compiled.background));
    for (i, conflict) in compiled.oracle.conflicts().iter().enumerate() {
        println!("Conflict {}: {}", i + 1, compiled.catalog.render(conflict));
    }
    match &compiled.expected {
        Some(expected) => println!("Expected diagnosis: {}", compiled.catalog.render(expected)),
        None => println!("Expected diagnosis: none given"),
    }
    let all = compiled.candidates.union(&compiled.background);
    if compiled.oracle.evaluate(&all) {
        warn!("Candidates and background are already consistent; the diagnosis is empty");
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Diagnose {
            scenario,
            config,
            sequential,
            json,
        } => diagnose(scenario, config, sequential, json)?,
        Commands::Inspect { scenario } => inspect(scenario)?,
    }

    Ok(())
}
