use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use fdgrow::cli::Args;
use fdgrow::error::{HarnessError, EXIT_FATAL};
use fdgrow::logger;
use fdgrow::oracle::detect_oracle;
use fdgrow::orchestrator::Orchestrator;

fn run() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;

    logger::init(&config.log_file, config.console_level)
        .with_context(|| format!("opening log file {}", config.log_file.display()))?;
    log::info!(
        "fdgrow {} starting: mode {}, {} descriptors, log {}",
        env!("CARGO_PKG_VERSION"),
        config.mode,
        config.count,
        config.log_file.display()
    );

    let oracle = match detect_oracle() {
        Ok(oracle) => Some(oracle),
        Err(e) => {
            log::warn!("{}; running without table snapshots", e);
            None
        }
    };

    let mode = config.mode;
    Orchestrator::new(config, oracle)
        .run()
        .with_context(|| format!("{} run failed", mode))?;
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e
                .downcast_ref::<HarnessError>()
                .map_or(EXIT_FATAL, HarnessError::exit_code);
            log::error!("{:#}", e);
            if !logger::reaches_console(log::Level::Error) {
                eprintln!("error: {:#}", e);
            }
            ExitCode::from(code as u8)
        }
    }
}
