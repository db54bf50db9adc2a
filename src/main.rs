//! `upscale input_path output_path [scale]` - single-image super-resolution

use clap::error::ErrorKind;
use clap::Parser;
use realesr_runner::config::Config;
use realesr_runner::model::{CandleLoader, HttpFetcher};
use realesr_runner::pipeline::{self, Services, UpscaleRequest, DEFAULT_SCALE, USAGE};
use realesr_runner::progress::Reporter;
use realesr_runner::telemetry;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

/// Upscale one image with Real-ESRGAN
#[derive(Parser, Debug)]
#[command(name = "upscale", version, about)]
struct Cli {
    /// Image to read
    input_path: PathBuf,
    /// Image to write; format follows the extension
    output_path: PathBuf,
    /// Output magnification relative to the input
    #[arg(value_parser = clap::value_parser!(u32).range(1..))]
    scale: Option<u32>,
}

fn main() -> ExitCode {
    let mut reporter = Reporter::new(io::stdout().lock());

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            reporter.plain(&e);
            return ExitCode::SUCCESS;
        }
        Err(_) => {
            reporter.plain(&USAGE);
            return ExitCode::FAILURE;
        }
    };

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            reporter.error(&format_args!("{e:#}"));
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = telemetry::init(&config.telemetry) {
        reporter.error(&format_args!("{e:#}"));
        return ExitCode::FAILURE;
    }
    tracing::info!("upscale starting");

    let request = UpscaleRequest {
        input: cli.input_path,
        output: cli.output_path,
        scale: cli.scale.unwrap_or(DEFAULT_SCALE),
    };
    let services = Services {
        fetcher: &HttpFetcher,
        loader: &CandleLoader,
    };

    if pipeline::run(&request, &config.model, services, &mut reporter) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
