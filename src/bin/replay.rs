//! replay - run a recorded chart stream through a pipeline
//!
//! Usage:
//!   replay --input session.jsonl
//!   replay --input - --config pipeline.json --verbose < session.jsonl
//!
//! Each input line is a `ReplayFrame`: the frame's luma plane, the candidates
//! the host detectors produced for it and, optionally, the device state at
//! that moment. One `PipelineResult` is printed per line; a stats summary goes
//! to stderr at the end.

use chartfuse::policy::{DeviceState, PowerGovernor};
use chartfuse::{
    CandidateDetection, Frame, FramePipeline, PipelineConfig, PipelineError, PipelineResult,
    PrecomputedDetections,
};
use clap::Parser;
use serde::Deserialize;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{Level, info};

#[derive(Error, Debug)]
enum CliError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[derive(Parser)]
#[command(name = "replay")]
#[command(about = "Replay a recorded frame stream through the detection pipeline")]
struct Cli {
    /// JSON-lines frame stream, or "-" for stdin
    #[arg(short, long, default_value = "-")]
    input: String,

    /// Pipeline configuration (JSON); defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the delta tolerance in bits
    #[arg(long)]
    tolerance: Option<u32>,

    /// Print only frames that were actually processed
    #[arg(long)]
    processed_only: bool,

    /// Debug-level logging on stderr
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Deserialize)]
struct ReplayFrame {
    timestamp_ms: u64,
    width: u32,
    height: u32,
    luma: Vec<u8>,
    #[serde(default)]
    candidates: Vec<CandidateDetection>,
    #[serde(default)]
    device: Option<DeviceState>,
}

fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::WARN })
        .with_writer(io::stderr)
        .init();

    if let Err(err) = run(cli) {
        eprintln!("replay: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    let mut pipeline = FramePipeline::new(config, PrecomputedDetections::new())?;
    if let Some(bits) = cli.tolerance {
        pipeline.set_delta_tolerance(bits);
    }
    let mut governor = PowerGovernor::new(pipeline.delta_tolerance());

    let reader: Box<dyn BufRead> = if cli.input == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        Box::new(BufReader::new(File::open(&cli.input)?))
    };
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: ReplayFrame = serde_json::from_str(&line).map_err(|source| CliError::Json {
            line: index + 1,
            source,
        })?;

        if let Some(device) = &record.device {
            governor.observe(device);
        }

        let result = match Frame::new(record.timestamp_ms, record.width, record.height, record.luma) {
            Ok(frame) => {
                pipeline.adapter_mut().load(record.candidates);
                pipeline.handle_frame(&frame)
            }
            Err(err) => {
                let mut result = PipelineResult::empty(record.timestamp_ms);
                result.errors.push(err);
                result
            }
        };

        if cli.processed_only && result.was_cache_hit {
            continue;
        }
        serde_json::to_writer(&mut out, &result).map_err(|source| CliError::Json {
            line: index + 1,
            source,
        })?;
        out.write_all(b"\n")?;
    }
    out.flush()?;

    let stats = pipeline.stats();
    info!(
        frames = stats.frames,
        processed = stats.processed,
        cache_hits = stats.cache_hits,
        "replay finished"
    );
    let summary = serde_json::json!({
        "pipeline": stats,
        "delta": pipeline.delta_stats(),
        "hit_rate": stats.hit_rate(),
        "average_latency_ms": stats.average_latency_ms(),
    });
    eprintln!("{summary}");
    Ok(())
}
