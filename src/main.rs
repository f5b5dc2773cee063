use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use log::{info, warn};
use tokio::sync::broadcast::error::RecvError;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod api;
mod config;
mod token;

use config::TokenConfig;
use token::{Ledger, Wallet};

// Resolve the deploying account, generating one if none is configured
fn owner_wallet(config: &TokenConfig) -> anyhow::Result<Wallet> {
    match &config.owner_secret_key {
        Some(secret) => {
            Wallet::from_secret_hex(secret).context("TOKEN_OWNER_KEY is not a valid secret key")
        }
        None => {
            let wallet = Wallet::new();
            warn!("No owner key configured, generated a fresh owner wallet");
            info!(
                "Owner wallet private key: {}",
                hex::encode(wallet.export_secret_key())
            );
            Ok(wallet)
        }
    }
}

// Deploy the token with the whole supply credited to the owner
fn initialize_ledger(config: &TokenConfig) -> anyhow::Result<Ledger> {
    let owner = owner_wallet(config)?;
    info!("Owner address: {}", owner.address());

    let ledger = Ledger::with_metadata(
        config.name.clone(),
        config.symbol.clone(),
        config.decimals,
        config.initial_supply,
        owner.address().clone(),
        config.event_buffer,
        config.event_log_limit,
    );

    ledger
        .check_invariants()
        .context("genesis state violates ledger invariants")?;

    Ok(ledger)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_token_info,
        api::handlers::get_total_supply,
        api::handlers::get_balance,
        api::handlers::transfer,
        api::handlers::get_events,
        api::handlers::get_accounts,
        api::handlers::validate_ledger,
        api::handlers::create_wallet
    ),
    components(
        schemas(
            token::Address,
            token::DigitalSignature,
            token::TransferEvent,
            token::TransferRequest,
            api::handlers::ErrorResponse,
            api::handlers::TokenInfoResponse,
            api::handlers::TotalSupplyResponse,
            api::handlers::BalanceResponse,
            api::handlers::TransferResponse,
            api::handlers::AccountResponse,
            api::handlers::ValidateResponse,
            api::handlers::WalletResponse
        )
    ),
    tags(
        (name = "token", description = "Token ledger API endpoints")
    ),
    info(
        title = "Token Ledger API",
        version = "1.0.0",
        description = "A fixed-supply fungible token ledger",
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

    let config = TokenConfig::load().context("failed to load configuration")?;
    let service = web::Data::new(api::TokenService::new(initialize_ledger(&config)?));

    // Log live transfers for operators tailing the output
    let mut events = service.ledger.subscribe();
    actix_web::rt::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(
                    "Transfer #{}: {} -> {} amount {}",
                    event.sequence, event.from, event.to, event.amount
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event logger lagged, skipped {} transfers", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!("Starting HTTP server at http://{}:{}", config.host, config.port);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(service.clone())
            .configure(api::configure_routes)
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone())
            )
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await?;

    Ok(())
}
