//! peerenc CLI entrypoint.
//!
//! ```bash
//! peerenc -c 0 -g 1 -i input.yuv -o out.h264 -s 1920x1080 -m p2a
//! peerenc -c 0 -g 1 -i input.rgba -o null -s 1280x720 -m r2h -r 10 --json
//! ```

use std::io::IsTerminal;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use peerenc_core::error::{EngineError, Result};
use peerenc_device::{LoopbackBackend, LoopbackOptions};
use peerenc_io::{FileByteSource, input_file_size, open_output};
use peerenc_pipeline::metrics::SUMMARY_SCHEMA_VERSION;
use peerenc_pipeline::{
    PipelineConfig, PipelineController, RunSummary, SinkPolicy, StreamMode, parse_size,
};

#[derive(Parser, Debug)]
#[command(
    name = "peerenc",
    version,
    about = "Upload raw frames on one device, move them over P2P DMA and encode them on another",
    after_help = "Examples:\n  peerenc -c 0 -g 1 -i in.yuv -o out.h264 -s 1920x1080 -m p2a\n  peerenc -c 0 -g 1 -i in.rgba -o null -m r2h -r 10 --json"
)]
struct Cli {
    /// Encoder device index.
    #[arg(short = 'c', long = "card", default_value_t = 0)]
    card: u32,

    /// Source (producer) device index; must differ from --card.
    #[arg(short = 'g', long = "gpucard", default_value_t = 0)]
    gpucard: u32,

    /// Raw input file (planar YUV 4:2:0 or packed RGBA frames).
    #[arg(short = 'i', long = "input")]
    input: PathBuf,

    /// Encoded output file; `null` discards the output.
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Frame size as WIDTHxHEIGHT.
    #[arg(short = 's', long = "size", default_value = "1280x720")]
    size: String,

    /// Source format and codec: p2a, p2h, r2a or r2h.
    #[arg(short = 'm', long = "mode", default_value = "p2a")]
    mode: String,

    /// Times the input is played back to back.
    #[arg(short = 'r', long = "repeat", default_value_t = 1)]
    repeat: u32,

    /// Log level, overridden by RUST_LOG.
    #[arg(short = 'l', long = "loglevel", value_enum, default_value_t = LogLevel::Info)]
    loglevel: LogLevel,

    /// Fail the run when the output accepts fewer bytes than written.
    #[arg(long = "strict-sink")]
    strict_sink: bool,

    /// Print the run summary as JSON on stdout.
    #[arg(long = "json")]
    json: bool,

    /// Devices exposed by the loopback fabric.
    #[arg(long = "devices", default_value_t = 4)]
    devices: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    None,
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::None => "off",
            LogLevel::Fatal | LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.loglevel);
    let json = cli.json;

    match run(cli) {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            tracing::error!(error = %err, code = err.error_code(), "Command failed");
            if json {
                println!("{}", command_error_json(&err));
            }
            std::process::exit(err.exit_code());
        }
    }
}

/// Failure report printed under `--json`; `code` is the full error code.
fn command_error_json(err: &EngineError) -> serde_json::Value {
    serde_json::json!({
        "schema_version": SUMMARY_SCHEMA_VERSION,
        "ok": false,
        "code": err.error_code(),
        "error": err.to_string(),
    })
}

/// Turn the command line into a validated [`PipelineConfig`].  Nothing is
/// opened here except a stat of the input file.
fn resolve_config(cli: &Cli) -> Result<PipelineConfig> {
    if cli.card == cli.gpucard {
        return Err(EngineError::IdenticalDevices(cli.card));
    }
    let (width, height) = parse_size(&cli.size)?;
    let mode: StreamMode = cli.mode.parse()?;
    if cli.repeat == 0 {
        return Err(EngineError::Config("repeat count must be at least 1".into()));
    }
    input_file_size(&cli.input)?;

    let config = PipelineConfig {
        width,
        height,
        format: mode.format,
        codec: mode.codec,
        repeat: cli.repeat,
        source_device: cli.gpucard,
        encoder_device: cli.card,
        sink_policy: if cli.strict_sink {
            SinkPolicy::Strict
        } else {
            SinkPolicy::Warn
        },
        ..PipelineConfig::default()
    };
    config.validate()?;
    Ok(config)
}

fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(&cli)?;
    let controller = PipelineController::new(config)?;

    let source = FileByteSource::open(cli.input.clone())?;
    let mut sink = open_output(&cli.output)?;
    let mut backend = LoopbackBackend::new(LoopbackOptions {
        device_count: cli.devices,
        ..LoopbackOptions::default()
    });

    let summary = controller.run(&mut backend, source, sink.as_mut())?;
    if cli.json {
        print_summary_json(&summary)?;
    }
    Ok(())
}

fn print_summary_json(summary: &RunSummary) -> Result<()> {
    let json = serde_json::to_string(summary)
        .map_err(|e| EngineError::Config(format!("summary serialization failed: {e}")))?;
    println!("{json}");
    Ok(())
}

fn init_tracing(level: LogLevel) {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive())),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}
