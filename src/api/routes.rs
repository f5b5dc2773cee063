use actix_web::web;

use super::handlers;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/token", web::get().to(handlers::get_token_info))
            .route("/token/total-supply", web::get().to(handlers::get_total_supply))
            .route("/balance/{address}", web::get().to(handlers::get_balance))
            .route("/transfer", web::post().to(handlers::transfer))
            .route("/events", web::get().to(handlers::get_events))
            .route("/accounts", web::get().to(handlers::get_accounts))
            .route("/validate", web::get().to(handlers::validate_ledger))
            .route("/wallet/new", web::post().to(handlers::create_wallet))
    );
}
