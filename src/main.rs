//! wgcheck - End-to-end check of HTTP over a userspace WireGuard network
//!
//! Runs the fixed scenario once. Exits 0 when nginx answered 200 through
//! the tunnel, 1 otherwise.

use std::process::ExitCode;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wgcheck::{CheckConfig, RunContext};

/// Filter used unless RUST_LOG says otherwise
const DEFAULT_LOG_FILTER: &str = "wgcheck=debug,wgnet=debug,info";

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let outcome = match RunContext::new() {
        Ok(ctx) => wgcheck::run(&ctx, &CheckConfig::default()).await,
        Err(e) => Err(e),
    };
    wgcheck::run::report(&outcome);

    if outcome.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Initialize logging
fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
