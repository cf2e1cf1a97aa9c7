mod api;
mod config;
mod db;
mod error;
mod indexer;
mod notify;
mod source;
mod types;

use std::future::IntoFuture;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::routes::{router, ApiState};
use crate::config::{Config, BROADCAST_CAPACITY};
use crate::db::store::Store;
use crate::error::{AppError, Result};
use crate::indexer::Indexer;
use crate::notify::BroadcastPublisher;
use crate::source::RpcSource;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let store = Store::connect(&cfg.db_path).await?;
    info!("Database ready at {}", cfg.db_path);

    // --- Chain source + settlement fan-out ---
    let source = Arc::new(RpcSource::new(&cfg)?);
    let updates = Arc::new(BroadcastPublisher::new(BROADCAST_CAPACITY));
    info!(
        contract = %cfg.contract_address,
        rpc = %cfg.rpc_url,
        ws = %cfg.ws_rpc_url,
        lookback = cfg.lookback_blocks,
        "Indexer configured"
    );

    // --- Indexer + HTTP API server ---
    let indexer = Arc::new(Indexer::new(
        store.clone(),
        source,
        Arc::clone(&updates) as Arc<dyn notify::SettlementPublisher>,
        cfg.lookback_blocks,
    ));
    let app = router(ApiState { store, updates });
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    // Either side ending takes the process down.
    tokio::select! {
        res = indexer.run() => {
            res?;
            return Err(AppError::Rpc("live event feed closed".to_string()));
        }
        res = axum::serve(listener, app).into_future() => res?,
    }

    Ok(())
}
