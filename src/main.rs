mod calibration;
mod cli;
mod error;
mod ledger;
mod pipeline;
mod present;
mod render;
#[cfg(test)]
mod testing;
mod types;

use std::process::ExitCode;

use clap::Parser;

use cli::Cli;
use pipeline::{SessionConfig, SimulatedDriver, run_session};

fn main() -> ExitCode {
    env_logger::init();

    let config = match SessionConfig::try_from(Cli::parse()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid arguments: {err:?}");
            return ExitCode::FAILURE;
        }
    };

    let driver = SimulatedDriver::new(1).realtime();
    match run_session(&config, &driver) {
        Ok(completion) => {
            log::info!("finished: {completion:?}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{:?}", anyhow::Error::new(err));
            ExitCode::FAILURE
        }
    }
}
