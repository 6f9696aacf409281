use mirrorledger::ledger::SubscriptionOptions;
use mirrorledger::{
    api, config::Config, db::init_db, Indexer, IndexerSettings, JsonRpcLedgerClient,
    LedgerClient, Projector, Repository, Settler,
};
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let port = config.port;

    // Initialize database and dependencies
    let pool = match init_db(&config.database_path).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let repo = Arc::new(Repository::new(pool));
    let ledger: Arc<dyn LedgerClient> = Arc::new(JsonRpcLedgerClient::new(
        config.ledger_rpc_url.clone(),
        config.contract_address.clone(),
        config.settlement_sender.clone(),
    ));
    let settler = Arc::new(Settler::new(
        repo.clone(),
        ledger.clone(),
        config.settlement_timeout,
        config.settlement_max_attempts,
    ));
    let projector = Arc::new(Projector::new(
        repo.clone(),
        ledger.clone(),
        settler.clone(),
        config.ledger_decimals,
        config.read_timeout,
    ));
    let indexer = Arc::new(Indexer::new(
        repo.clone(),
        ledger,
        projector,
        settler,
        IndexerSettings {
            start_block: config.start_block,
            subscription: SubscriptionOptions {
                poll_interval: config.poll_interval,
                max_block_range: config.log_block_range,
            },
            sweep_interval: config.sweep_interval,
            read_timeout: config.read_timeout,
        },
    ));

    // Start background work
    let mut tasks = indexer.spawn_watchers();
    tasks.push(indexer.spawn_sweeper());

    // Create router
    let app = api::create_router(api::AppState::new(repo, indexer, config));

    // Bind to address
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Server listening on {}", addr);

    // Run server
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    for task in &tasks {
        task.abort();
    }

    if let Err(e) = result {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
    tracing::info!("Shut down");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
