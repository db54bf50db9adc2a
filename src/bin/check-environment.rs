//! `check-environment` - report missing or outdated Real-ESRGAN packages

use clap::error::ErrorKind;
use clap::Parser;
use realesr_runner::config::{executable_dir, Config};
use realesr_runner::environment::{self, PythonResolver};
use realesr_runner::progress::Reporter;
use realesr_runner::telemetry;
use std::io;
use std::process::ExitCode;

/// Report whether the Real-ESRGAN packages are installed at acceptable versions
#[derive(Parser, Debug)]
#[command(name = "check-environment", version, about)]
struct Cli {}

fn main() -> ExitCode {
    let mut stdout = io::stdout().lock();

    match Cli::try_parse() {
        Ok(Cli {}) => {}
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            Reporter::new(stdout).plain(&e);
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let reason = e.kind().as_str().unwrap_or("invalid arguments");
            return fail(stdout, &reason);
        }
    }

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => return fail(stdout, &format_args!("{e:#}")),
    };

    if let Err(e) = telemetry::init(&config.telemetry) {
        return fail(stdout, &format_args!("{e:#}"));
    }

    let script_dir = match executable_dir() {
        Ok(dir) => dir,
        Err(e) => return fail(stdout, &format_args!("{e:#}")),
    };

    let resolver = match PythonResolver::probe(&config.environment.interpreter) {
        Ok(resolver) => resolver,
        Err(e) => return fail(stdout, &e),
    };

    let result = environment::run(
        &config.environment.requirements,
        &resolver,
        &script_dir,
        &mut stdout,
    );

    match result {
        Ok(report) => ExitCode::from(report.exit_code()),
        Err(e) => fail(stdout, &e),
    }
}

fn fail(out: io::StdoutLock<'_>, message: &dyn std::fmt::Display) -> ExitCode {
    tracing::error!(error = %message, "environment check failed");
    Reporter::new(out).error(message);
    ExitCode::FAILURE
}
