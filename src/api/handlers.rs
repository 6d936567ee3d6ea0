use actix_web::{web, HttpResponse, Responder};
use chrono::{DateTime, Utc};
use log::error;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::blockchain::nodes::NodeError;
use crate::blockchain::{
    Address, Block, Blockchain, BlockchainError, DailyData, EnergyReading, HistoryEntry, NodeRegistry,
    Transaction,
};

/// Shared ledger state
pub type BlockchainData = web::Data<Blockchain>;

/// Shared node registry
pub type RegistryData = web::Data<NodeRegistry>;

/// Response for the chain endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChainResponse {
    /// The length of the chain
    pub length: usize,

    /// The blocks in the chain
    pub chain: Vec<Block>,

    /// Whether the chain is valid
    pub is_valid: bool,
}

/// Response for the transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionResponse {
    pub message: String,

    /// Id of the admitted transaction
    pub transaction_id: String,
}

/// Response for the mine endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MineResponse {
    pub message: String,

    /// The newly mined block, absent when there was nothing to mine
    pub block: Option<Block>,
}

/// Response for the balance endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct BalanceResponse {
    pub address: Address,

    /// Balance including pending transactions
    pub balance: f64,

    /// Balance of the confirmed chain only
    pub confirmed_balance: f64,
}

/// Response for the wallet history endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct HistoryResponse {
    pub address: Address,

    /// Sent and received transactions, newest first
    pub transactions: Vec<HistoryEntry>,
}

/// Request for the node registration endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct RegisterNodeRequest {
    pub node_id: String,

    /// Wallet the node's owner is paid to
    pub wallet: Address,
}

/// Request for the energy reporting endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct EnergyRequest {
    /// Energy produced, in Wh
    pub energy: f64,

    /// Time of the measurement, now when absent
    #[serde(default)]
    #[schema(value_type = Option<String>, example = "2023-01-01T12:00:00Z")]
    pub timestamp: Option<DateTime<Utc>>,
}

fn error_response(err: &BlockchainError) -> HttpResponse {
    let body = serde_json::json!({ "error": err.to_string() });

    match err {
        BlockchainError::InvalidTransaction(_) => HttpResponse::BadRequest().json(body),
        BlockchainError::PoolFull { .. } => HttpResponse::ServiceUnavailable().json(body),
        BlockchainError::ConsensusRejected { .. } => HttpResponse::Conflict().json(body),
        _ => {
            error!("Ledger failure: {}", err);
            HttpResponse::InternalServerError().json(body)
        }
    }
}

/// Get the full chain
///
/// Returns the entire chain and its validity status
#[utoipa::path(
    get,
    path = "/api/v1/chain",
    responses(
        (status = 200, description = "Chain retrieved successfully", body = ChainResponse)
    )
)]
pub async fn get_chain(blockchain: BlockchainData) -> impl Responder {
    let chain = blockchain.get_chain();
    let is_valid = blockchain.is_valid();

    let response = ChainResponse {
        length: chain.len(),
        chain,
        is_valid,
    };

    HttpResponse::Ok().json(response)
}

/// Check if the chain is valid
#[utoipa::path(
    get,
    path = "/api/v1/validate",
    responses(
        (status = 200, description = "Chain validation result")
    )
)]
pub async fn validate_chain(blockchain: BlockchainData) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "is_valid": blockchain.is_valid(),
        "height": blockchain.height(),
    }))
}

/// Get all pending transactions
///
/// Returns all transactions waiting to be included in a block, in admission order
#[utoipa::path(
    get,
    path = "/api/v1/transactions/pending",
    responses(
        (status = 200, description = "Pending transactions retrieved successfully", body = Vec<Transaction>)
    )
)]
pub async fn get_pending_transactions(blockchain: BlockchainData) -> impl Responder {
    HttpResponse::Ok().json(blockchain.get_pending_transactions())
}

/// Submit a signed transaction
#[utoipa::path(
    post,
    path = "/api/v1/transactions/new",
    request_body = Transaction,
    responses(
        (status = 201, description = "Transaction admitted", body = TransactionResponse),
        (status = 400, description = "Invalid transaction"),
        (status = 503, description = "Mempool is full"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn new_transaction(
    blockchain: BlockchainData,
    transaction: web::Json<Transaction>,
) -> impl Responder {
    match blockchain.submit(transaction.into_inner()) {
        Ok(transaction_id) => HttpResponse::Created().json(TransactionResponse {
            message: "Transaction added to the mempool".to_string(),
            transaction_id,
        }),
        Err(err) => error_response(&err),
    }
}

/// Mine a new block
///
/// Uses the posted daily data, or aggregates the registered nodes' energy when the body is empty
#[utoipa::path(
    post,
    path = "/api/v1/mine",
    request_body = DailyData,
    responses(
        (status = 200, description = "Mining cycle completed", body = MineResponse),
        (status = 400, description = "Malformed daily data"),
        (status = 409, description = "Energy rejected by consensus"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn mine_block(
    blockchain: BlockchainData,
    registry: RegistryData,
    body: web::Bytes,
) -> impl Responder {
    let result = if body.iter().all(|byte| byte.is_ascii_whitespace()) {
        blockchain.mine_from_registry(&registry)
    } else {
        match serde_json::from_slice::<DailyData>(&body) {
            Ok(daily) => blockchain.mine(daily),
            Err(err) => {
                return HttpResponse::BadRequest().json(serde_json::json!({
                    "error": format!("Invalid daily data: {}", err)
                }))
            }
        }
    };

    match result {
        Ok(Some(block)) => HttpResponse::Ok().json(MineResponse {
            message: "New Block Mined".to_string(),
            block: Some(block),
        }),
        Ok(None) => HttpResponse::Ok().json(MineResponse {
            message: "Nothing to mine".to_string(),
            block: None,
        }),
        Err(err) => error_response(&err),
    }
}

/// Get wallet balance
#[utoipa::path(
    get,
    path = "/api/v1/wallet/balance/{address}",
    params(("address" = String, Path, description = "Wallet address")),
    responses(
        (status = 200, description = "Wallet balance retrieved successfully", body = BalanceResponse)
    )
)]
pub async fn get_wallet_balance(
    blockchain: BlockchainData,
    address: web::Path<String>,
) -> impl Responder {
    let address = Address(address.into_inner());

    HttpResponse::Ok().json(BalanceResponse {
        balance: blockchain.balance_of(&address),
        confirmed_balance: blockchain.confirmed_balance_of(&address),
        address,
    })
}

/// Get the unspent outputs of a wallet
#[utoipa::path(
    get,
    path = "/api/v1/wallet/utxos/{address}",
    params(("address" = String, Path, description = "Wallet address")),
    responses(
        (status = 200, description = "Unspent outputs retrieved successfully", body = Vec<crate::blockchain::UtxoRecord>)
    )
)]
pub async fn get_wallet_utxos(
    blockchain: BlockchainData,
    address: web::Path<String>,
) -> impl Responder {
    let address = Address(address.into_inner());
    HttpResponse::Ok().json(blockchain.utxos_of(&address))
}

/// Get the transaction history of a wallet
///
/// Confirmed and pending transactions that sent or received value, newest first
#[utoipa::path(
    get,
    path = "/api/v1/wallet/transactions/{address}",
    params(("address" = String, Path, description = "Wallet address")),
    responses(
        (status = 200, description = "Wallet history retrieved successfully", body = HistoryResponse)
    )
)]
pub async fn get_wallet_transactions(
    blockchain: BlockchainData,
    address: web::Path<String>,
) -> impl Responder {
    let address = Address(address.into_inner());

    HttpResponse::Ok().json(HistoryResponse {
        transactions: blockchain.history_of(&address),
        address,
    })
}

/// Register an energy node
#[utoipa::path(
    post,
    path = "/api/v1/nodes/register",
    request_body = RegisterNodeRequest,
    responses(
        (status = 201, description = "Node registered", body = crate::blockchain::NodeRecord),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn register_node(
    registry: RegistryData,
    request: web::Json<RegisterNodeRequest>,
) -> impl Responder {
    let request = request.into_inner();

    match registry.register_node(&request.node_id, request.wallet) {
        Ok(node) => HttpResponse::Created().json(node),
        Err(err) => {
            error!("Failed to register node {}: {}", request.node_id, err);
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": err.to_string()
            }))
        }
    }
}

/// Report energy produced by a node
#[utoipa::path(
    post,
    path = "/api/v1/nodes/{node_id}/energy",
    params(("node_id" = String, Path, description = "Node id")),
    request_body = EnergyRequest,
    responses(
        (status = 200, description = "Reading recorded"),
        (status = 400, description = "Invalid reading"),
        (status = 404, description = "Unknown node")
    )
)]
pub async fn record_energy(
    registry: RegistryData,
    node_id: web::Path<String>,
    request: web::Json<EnergyRequest>,
) -> impl Responder {
    let node_id = node_id.into_inner();
    let reading = EnergyReading {
        timestamp: request.timestamp.unwrap_or_else(Utc::now),
        energy: request.energy,
    };

    match registry.record_energy(&node_id, reading) {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({
            "message": format!("Recorded {} Wh for node {}", request.energy, node_id)
        })),
        Err(err @ NodeError::UnknownNode(_)) => HttpResponse::NotFound().json(serde_json::json!({
            "error": err.to_string()
        })),
        Err(err @ NodeError::InvalidReading(_)) => HttpResponse::BadRequest().json(serde_json::json!({
            "error": err.to_string()
        })),
        Err(err) => {
            error!("Failed to record energy for {}: {}", node_id, err);
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": err.to_string()
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::configure_routes;
    use crate::blockchain::config::GenesisConfig;
    use crate::blockchain::crypto::Wallet;
    use crate::blockchain::history::Direction;
    use crate::blockchain::{LedgerConfig, OutputRef, ProofOfEnergy, TxInput, TxOutput};
    use actix_web::{http::StatusCode, test, App};
    use std::sync::Arc;

    fn state(owner: &Wallet) -> (BlockchainData, RegistryData) {
        let config = LedgerConfig {
            genesis: GenesisConfig {
                address: owner.address().clone(),
                public_key: owner.public_key_hex(),
                amount: 1000.0,
            },
            ..LedgerConfig::default()
        };
        let consensus = Arc::new(ProofOfEnergy::default());
        let blockchain = Blockchain::open(config, consensus.clone(), None).unwrap();
        (web::Data::new(blockchain), web::Data::new(NodeRegistry::new(consensus)))
    }

    #[actix_web::test]
    async fn test_submit_and_mine() {
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();
        let (blockchain, registry) = state(&alice);
        let app = test::init_service(
            App::new()
                .app_data(blockchain.clone())
                .app_data(registry.clone())
                .configure(configure_routes),
        )
        .await;

        let source = OutputRef::new(blockchain.get_chain()[0].transactions[0].id.clone(), 0);
        let mut tx = Transaction::new(
            vec![TxInput::new(source, alice.public_key_hex())],
            vec![
                TxOutput::new(bob.address().clone(), 400.0, ""),
                TxOutput::new(alice.address().clone(), 600.0, alice.public_key_hex()),
            ],
            0.0,
        );
        tx.sign(&alice).unwrap();

        let req = test::TestRequest::post()
            .uri("/api/v1/transactions/new")
            .set_json(&tx)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        // The same transaction again spends an output already spent in the pool
        let req = test::TestRequest::post()
            .uri("/api/v1/transactions/new")
            .set_json(&tx)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/api/v1/mine")
            .set_json(DailyData::default())
            .to_request();
        let body: MineResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body.block.map(|block| block.index), Some(1));

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/wallet/balance/{}", bob.address()))
            .to_request();
        let body: BalanceResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body.confirmed_balance, 400.0);

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/wallet/transactions/{}", bob.address()))
            .to_request();
        let body: HistoryResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body.transactions.len(), 1);
        assert_eq!(body.transactions[0].txid, tx.id);
        assert_eq!(body.transactions[0].direction, Direction::Received);
        assert_eq!(body.transactions[0].amount, 400.0);
        assert_eq!(body.transactions[0].block_index, Some(1));
    }

    #[actix_web::test]
    async fn test_nodes_feed_mining() {
        let alice = Wallet::new().unwrap();
        let (blockchain, registry) = state(&alice);
        let app = test::init_service(
            App::new()
                .app_data(blockchain.clone())
                .app_data(registry.clone())
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/nodes/register")
            .set_json(serde_json::json!({ "node_id": "panel-1", "wallet": alice.address() }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CREATED);

        let req = test::TestRequest::post()
            .uri("/api/v1/nodes/panel-1/energy")
            .set_json(serde_json::json!({ "energy": 20000.0 }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        let req = test::TestRequest::post()
            .uri("/api/v1/nodes/unknown/energy")
            .set_json(serde_json::json!({ "energy": 1.0 }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::post().uri("/api/v1/mine").to_request();
        let body: MineResponse = test::call_and_read_body_json(&app, req).await;
        let block = body.block.unwrap();
        assert_eq!(block.consolidated_energy, 20000.0);
        assert_eq!(block.reward, 1.0);
        assert_eq!(block.node_count, 1);
    }

    #[actix_web::test]
    async fn test_malformed_daily_data_is_rejected() {
        let alice = Wallet::new().unwrap();
        let (blockchain, registry) = state(&alice);
        let app = test::init_service(
            App::new()
                .app_data(blockchain.clone())
                .app_data(registry.clone())
                .configure(configure_routes),
        )
        .await;

        registry.register_node("panel-1", alice.address().clone()).unwrap();
        registry
            .record_energy(
                "panel-1",
                EnergyReading {
                    timestamp: Utc::now(),
                    energy: 20000.0,
                },
            )
            .unwrap();

        let req = test::TestRequest::post()
            .uri("/api/v1/mine")
            .insert_header(("content-type", "application/json"))
            .set_payload(r#"{"total_energy":"lots","valid_node_count":1}"#)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        // Neither the chain nor the node's readings were touched
        assert_eq!(blockchain.get_chain().len(), 1);
        assert_eq!(registry.get_node("panel-1").unwrap().energy_history.len(), 1);
    }
}
