//! CLI entry point (§6, C13/C14): initializes logging before configuration
//! parsing can fail, parses `Config`, and runs the reactor master to
//! completion.

use std::process::ExitCode;

use reactord::config::Config;
use reactord::master;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse_args();

    match master::run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "fatal setup failure");
            ExitCode::FAILURE
        }
    }
}
