use std::process::ExitCode;

use clap::Parser;
use swince_service::app::App;
use swince_service::config::Args;
use swince_service::{lifecycle, logging};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(err) = logging::init(&args.log_settings()) {
        eprintln!("{err:#}");
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting swincebot");

    let config = args.app_config();
    let result = lifecycle::run(
        move |errors| App::init(config, errors),
        lifecycle::termination_signal(),
        args.grace_timeout,
    )
    .await;

    match result {
        Ok(outcome) => {
            tracing::info!(?outcome, "swincebot stopped");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(error = %err, "program quit unexpectedly");
            ExitCode::FAILURE
        }
    }
}
