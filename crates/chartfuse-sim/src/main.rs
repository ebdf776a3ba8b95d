//! chartfuse-sim - synthetic chart sessions for the detection pipeline
//!
//! Usage:
//!   chartfuse-sim list
//!   chartfuse-sim generate --scenario pattern_handoff > session.jsonl
//!   chartfuse-sim benchmark --scenario all --seed 7
//!   chartfuse-sim benchmark --scenario pattern_handoff --recalibrate

use chartfuse::PipelineConfig;
use chartfuse_sim::{SimError, bench, scenarios, stream};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use tracing::{Level, info};

#[derive(Parser)]
#[command(name = "chartfuse-sim")]
#[command(about = "Synthetic chart sessions with ground truth for the detection pipeline")]
struct Cli {
    /// Debug-level logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a session as JSON lines (the format `replay` reads)
    Generate {
        #[arg(short, long, default_value = "static_head_and_shoulders")]
        scenario: String,

        #[arg(long, default_value = "7")]
        seed: u64,

        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Pipeline configuration whose reliability profiles drive the detectors
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Run scenarios through the pipeline and report flicker and accuracy
    Benchmark {
        /// Scenario name, or "all"
        #[arg(short, long, default_value = "all")]
        scenario: String,

        #[arg(long, default_value = "7")]
        seed: u64,

        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(short, long, default_value = "table")]
        format: ReportFormat,

        /// Run each scenario again with the profiles calibrated on the first run
        #[arg(long)]
        recalibrate: bool,
    },

    /// List available scenarios
    List,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum ReportFormat {
    Table,
    Json,
}

fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::WARN })
        .with_writer(io::stderr)
        .init();

    let outcome = match cli.command {
        Commands::Generate {
            scenario,
            seed,
            output,
            config,
        } => run_generate(&scenario, seed, output, config),
        Commands::Benchmark {
            scenario,
            seed,
            config,
            format,
            recalibrate,
        } => run_benchmark(&scenario, seed, config, format, recalibrate),
        Commands::List => {
            run_list();
            Ok(())
        }
    };

    if let Err(err) = outcome {
        eprintln!("chartfuse-sim: {err}");
        std::process::exit(1);
    }
}

fn load_config(path: Option<PathBuf>) -> Result<PipelineConfig, SimError> {
    Ok(match path {
        Some(p) => PipelineConfig::from_json_file(p)?,
        None => PipelineConfig::default(),
    })
}

fn find(name: &str) -> Result<scenarios::Scenario, SimError> {
    scenarios::by_name(name).ok_or_else(|| SimError::UnknownScenario(name.to_string()))
}

fn run_generate(
    name: &str,
    seed: u64,
    output: Option<PathBuf>,
    config: Option<PathBuf>,
) -> Result<(), SimError> {
    let scenario = find(name)?;
    let profiles = load_config(config)?.reliability;
    let frames = match output {
        Some(path) => stream::write_stream(&scenario, profiles, seed, BufWriter::new(File::create(path)?))?,
        None => stream::write_stream(&scenario, profiles, seed, BufWriter::new(io::stdout().lock()))?,
    };
    info!(scenario = name, frames, "session written");
    eprintln!("{frames} frames written for '{name}'");
    Ok(())
}

fn run_benchmark(
    name: &str,
    seed: u64,
    config: Option<PathBuf>,
    format: ReportFormat,
    recalibrate: bool,
) -> Result<(), SimError> {
    let config = load_config(config)?;
    let selected = if name == "all" {
        scenarios::all()
    } else {
        vec![find(name)?]
    };

    let mut reports = Vec::with_capacity(selected.len());
    for scenario in &selected {
        let report = bench::run_benchmark(scenario, config.clone(), seed)?;
        if recalibrate {
            let mut next = config.clone();
            next.reliability = report.calibrated;
            info!(
                scenario = scenario.name,
                ml_tpr = next.reliability.ml.true_positive_rate,
                ml_fpr = next.reliability.ml.false_positive_rate,
                template_tpr = next.reliability.template.true_positive_rate,
                template_fpr = next.reliability.template.false_positive_rate,
                "rerunning with calibrated profiles"
            );
            reports.push(report);
            let mut rerun = bench::run_benchmark_with(scenario, next, config.reliability, seed)?;
            rerun.scenario = format!("{} (calibrated)", scenario.name);
            reports.push(rerun);
        } else {
            reports.push(report);
        }
    }

    match format {
        ReportFormat::Json => println!("{}", serde_json::to_string_pretty(&reports)?),
        ReportFormat::Table => {
            println!(
                "{:<28} {:>6} {:>7} {:>9} {:>9} {:>8} {:>8} {:>8} {:>10}",
                "scenario", "frames", "hit%", "raw_flip", "stab_flip", "true", "false", "missed", "ttstable"
            );
            for r in &reports {
                println!(
                    "{:<28} {:>6} {:>6.1}% {:>9} {:>9} {:>8} {:>8} {:>8} {:>10}",
                    r.scenario,
                    r.frames,
                    r.hit_rate * 100.0,
                    r.raw_flicker,
                    r.stable_flicker,
                    r.true_stable_frames,
                    r.false_stable_frames,
                    r.missed_frames,
                    r.mean_time_to_stable_ms
                        .map(|ms| format!("{ms:.0}ms"))
                        .unwrap_or_else(|| "-".to_string()),
                );
            }
        }
    }
    Ok(())
}

fn run_list() {
    println!("Available scenarios:\n");
    for (name, description) in scenarios::list_scenarios() {
        println!("  {:<28} {}", name, description);
    }
}
