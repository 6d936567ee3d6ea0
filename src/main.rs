use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use std::sync::Arc;
use std::time::Duration;

mod api;
mod blockchain;
mod config;

use blockchain::{Blockchain, LedgerConfig, LedgerStorage, NodeRegistry, ProofOfEnergy};
use config::{AppConfig, Cli};

// Open the configured database; only an explicit in-memory setup runs without one
fn open_storage(config: &LedgerConfig) -> anyhow::Result<Option<Arc<LedgerStorage>>> {
    let data_dir = match &config.data_dir {
        Some(data_dir) => data_dir,
        None => {
            warn!("Running in memory, nothing will survive a restart");
            return Ok(None);
        }
    };

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
    let storage = LedgerStorage::new(data_dir)
        .with_context(|| format!("Failed to open ledger storage at {}", data_dir.display()))?;

    info!("Opened ledger storage at {}", data_dir.display());
    Ok(Some(Arc::new(storage)))
}

// Mine from the node registry every `interval`
fn spawn_miner(blockchain: web::Data<Blockchain>, registry: web::Data<NodeRegistry>, interval: Duration) {
    actix_web::rt::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let blockchain = blockchain.clone();
            let registry = registry.clone();
            match web::block(move || blockchain.mine_from_registry(&registry)).await {
                Ok(Ok(Some(block))) => info!("Periodic mining produced block {}", block.index),
                Ok(Ok(None)) => info!("Periodic mining: nothing to mine"),
                Ok(Err(err)) => warn!("Periodic mining failed: {}", err),
                Err(err) => error!("Periodic mining task failed: {}", err),
            }
        }
    });
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_chain,
        api::handlers::validate_chain,
        api::handlers::get_pending_transactions,
        api::handlers::new_transaction,
        api::handlers::mine_block,
        api::handlers::get_wallet_balance,
        api::handlers::get_wallet_utxos,
        api::handlers::get_wallet_transactions,
        api::handlers::register_node,
        api::handlers::record_energy
    ),
    components(
        schemas(
            blockchain::Block,
            blockchain::Transaction,
            blockchain::TxInput,
            blockchain::TxOutput,
            blockchain::OutputRef,
            blockchain::UtxoRecord,
            blockchain::DailyData,
            blockchain::NodeRecord,
            blockchain::EnergyReading,
            blockchain::HistoryEntry,
            blockchain::history::Direction,
            blockchain::history::EntryStatus,
            blockchain::transaction::TransactionKind,
            blockchain::crypto::Address,
            blockchain::crypto::DigitalSignature,
            api::handlers::ChainResponse,
            api::handlers::TransactionResponse,
            api::handlers::MineResponse,
            api::handlers::BalanceResponse,
            api::handlers::HistoryResponse,
            api::handlers::RegisterNodeRequest,
            api::handlers::EnergyRequest
        )
    ),
    tags(
        (name = "ledger", description = "Energy ledger API endpoints")
    ),
    info(
        title = "Energy Ledger API",
        version = "1.0.0",
        description = "An energy-backed UTXO ledger",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = Cli::parse();
    let config = AppConfig::load(&cli).context("Failed to load configuration")?;

    let consensus = Arc::new(ProofOfEnergy::new(config.ledger.energy_tolerance));
    let storage = open_storage(&config.ledger)?;

    let registry = match &storage {
        Some(storage) => NodeRegistry::with_storage(storage.clone(), consensus.clone())
            .context("Failed to load the node registry")?,
        None => NodeRegistry::new(consensus.clone()),
    };

    let blockchain = Blockchain::open(config.ledger.clone(), consensus, storage)
        .context("Failed to open the ledger")?;
    info!(
        "Ledger ready at height {}, rewards paid to {}",
        blockchain.height(),
        config.ledger.reward_address()
    );

    let blockchain = web::Data::new(blockchain);
    let registry = web::Data::new(registry);

    if let Some(secs) = config.server.mining_interval_secs.filter(|secs| *secs > 0) {
        info!("Mining every {} seconds", secs);
        spawn_miner(blockchain.clone(), registry.clone(), Duration::from_secs(secs));
    }

    let (host, port) = (config.server.host.clone(), config.server.port);
    info!("Starting HTTP server at http://{}:{}", host, port);

    // Start HTTP server
    HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        // Configure OpenAPI documentation
        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(blockchain.clone())
            .app_data(registry.clone())
            // API routes
            .configure(api::configure_routes)
            // Swagger UI
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone())
            )
    })
    .bind((host, port))?
    .run()
    .await?;

    Ok(())
}
