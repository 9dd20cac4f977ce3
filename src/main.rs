use clap::Parser;
use dotenv::dotenv;
use rustci_engine::cli::Cli;
use rustci_engine::config::Config;
use rustci_engine::AppState;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::init();
    let state = AppState::connect(config).await;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupt received, cancelling");
            on_signal.cancel();
        }
    });

    let code = match cli.execute(&state, cancel).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("❌ {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}
