use anyhow::Context;
use clap::Parser;
use tracing::info;

use huddle_relay::app;
use huddle_relay::cli::Cli;
use huddle_relay::config::Config;
use huddle_relay::ws::RelayState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to WARN if RUST_LOG is not set.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }

    let state = RelayState::new();
    let router = app(state);

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("huddle relay listening on {addr}");

    axum::serve(listener, router).await?;
    Ok(())
}
