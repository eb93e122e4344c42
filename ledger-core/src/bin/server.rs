//! Ledger server binary

use ledger_core::{rpc, AccountantExport, Config, Ledger, Metrics, RocksStore};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    tracing::info!("Starting ledger server");

    // Load configuration: optional file path as first argument, then env overrides
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    }
    .with_env_overrides()?;

    let store = Arc::new(RocksStore::open(&config)?);
    for username in &config.seed.users {
        store.register_user(username)?;
    }
    for ticker in &config.seed.contracts {
        store.register_contract(ticker)?;
    }

    let metrics = Metrics::new()?;
    let ledger = Ledger::new(store, config.group_timeout(), metrics);
    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        group_timeout_ms = ?config.group_timeout_ms,
        "Ledger opened successfully"
    );

    let listener = TcpListener::bind(&config.listen_addr).await?;
    let export = AccountantExport::new(ledger);

    tokio::select! {
        result = rpc::serve(listener, export) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down ledger server");
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    if std::env::var("LEDGER_LOG_JSON").is_ok_and(|v| v == "1") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
