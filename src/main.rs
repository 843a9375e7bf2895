use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use paycore::adapters::{PostgresOrderLedger, PostgresTransactionStore};
use paycore::cli::{Cli, Commands, DbCommands, TxCommands};
use paycore::config::Config;
use paycore::engine::{ReconciliationEngine, reconciler};
use paycore::gateway::{GatewayAdapter, HostedCheckoutGateway};
use paycore::ports::{OrderLedger, TransactionStore};
use paycore::{AppState, cli, create_app, db};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    // Setup logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    match args.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Tx(TxCommands::Poll { transaction_id }) => {
            cli::handle_tx_poll(&config, &transaction_id).await
        }
        Commands::Tx(TxCommands::Show { transaction_id }) => {
            cli::handle_tx_show(&config, &transaction_id).await
        }
        Commands::Db(DbCommands::Migrate) => cli::handle_db_migrate(&config).await,
        Commands::Config => cli::handle_config_validate(&config),
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    // Database pool
    let pool = db::create_pool(&config).await?;

    // Run migrations
    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations completed");

    let store: Arc<dyn TransactionStore> = Arc::new(PostgresTransactionStore::new(pool.clone()));
    let ledger: Arc<dyn OrderLedger> = Arc::new(PostgresOrderLedger::new(pool));
    let gateway: Arc<dyn GatewayAdapter> = Arc::new(HostedCheckoutGateway::new(
        config.gateway_base_url.clone(),
        config.gateway_merchant_id.clone(),
        config.gateway_api_secret.clone(),
        Duration::from_secs(config.gateway_timeout_secs),
    ));
    tracing::info!(
        "Hosted checkout gateway client initialized with URL: {}",
        config.gateway_base_url
    );

    let engine = Arc::new(ReconciliationEngine::new(
        store.clone(),
        ledger,
        gateway.clone(),
        config.engine_config(),
    ));

    // Background reconciler keeps polling transactions the callbacks missed
    tokio::spawn(reconciler::run(
        engine.clone(),
        Duration::from_secs(config.reconciler_tick_secs),
        config.reconciler_batch,
    ));

    let port = config.server_port;
    let state = AppState {
        engine,
        store,
        gateway,
        config: Arc::new(config),
    };
    let app = create_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
