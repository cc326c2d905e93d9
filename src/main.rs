//! Process entry point.
//!
//! Startup order matters: configuration is validated before anything else
//! so that a missing OAuth token (exit 129) or a malformed port (exit 128)
//! terminates the process before the HTTP listener binds. Worker panics
//! are routed to the logger and never terminate the process.

use dispatch::{config, logging, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("dispatch: {}", err.message());
            std::process::exit(err.exit_code());
        }
    };

    logging::init(&config.root, config.raw_log)?;

    // Panics inside spawned workers are already trapped by the task
    // engine; the hook routes everything else to the logger instead of
    // bare stderr.
    std::panic::set_hook(Box::new(|info| {
        tracing::error!(%info, "uncaught panic");
    }));

    let state = server::AppState::new(config);

    // Warm the site catalogue; a failure here is degraded, not fatal —
    // the first lookup will retry.
    if let Err(err) = state.sites.refresh().await {
        tracing::warn!(error = %err, "initial site catalogue fetch failed");
    }

    server::run_server(state).await
}
