// API module
//
// This module contains the REST API for the token ledger

pub mod handlers;
pub mod routes;

// Re-export main components for easier access
pub use handlers::TokenService;
pub use routes::configure_routes;
