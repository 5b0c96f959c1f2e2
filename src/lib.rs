pub mod app;

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use app::cli::{execute, read_config, Cli};
use app::logging::init_logging;

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let logging = read_config(cli.config.as_ref(), None)
        .map(|config| config.logging)
        .unwrap_or_default();
    init_logging(&logging);

    match execute(cli) {
        Ok(body) => {
            println!("{body}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(trace_id = %err.trace_id, code = %err.code, "{}", err.error);
            eprintln!(
                "{}",
                serde_json::to_string_pretty(&err).unwrap_or_else(|_| err.to_string())
            );
            ExitCode::from(exit_code_for(&err.code))
        }
    }
}

fn exit_code_for(code: &str) -> u8 {
    match code {
        app::error::ERR_VALIDATION => 2,
        app::error::ERR_TRANSPORT => 3,
        app::error::ERR_TIMEOUT => 4,
        _ => 1,
    }
}
