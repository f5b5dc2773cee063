use actix_web::{web, HttpResponse, Responder};
use log::warn;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::token::{
    Address, CallerError, CallerResolver, Ledger, LedgerError, SignatureResolver, TokenAmount,
    TransferEvent, TransferRequest, Wallet,
};

/// The ledger together with the layer that authenticates its callers
#[derive(Debug)]
pub struct TokenService {
    pub ledger: Ledger,
    pub resolver: SignatureResolver,
}

impl TokenService {
    pub fn new(ledger: Ledger) -> Self {
        TokenService {
            ledger,
            resolver: SignatureResolver::new(),
        }
    }
}

/// Shared service state
pub type TokenData = web::Data<TokenService>;

/// Error payload returned by every endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Human-readable message
    pub error: String,

    /// Stable error kind, e.g. `InsufficientBalance`
    pub kind: String,
}

impl ErrorResponse {
    fn new(kind: &str, error: impl ToString) -> Self {
        ErrorResponse {
            error: error.to_string(),
            kind: kind.to_string(),
        }
    }
}

/// Response for the token endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TokenInfoResponse {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,

    #[schema(value_type = String, example = "1000000000000000000000")]
    pub total_supply: TokenAmount,
}

/// Response for the total supply endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TotalSupplyResponse {
    #[schema(value_type = String, example = "1000000000000000000000")]
    pub total_supply: TokenAmount,
}

/// Response for the balance endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BalanceResponse {
    pub address: Address,

    #[schema(value_type = String, example = "50")]
    pub balance: TokenAmount,

    /// The nonce the account's next transfer must carry
    pub nonce: u64,
}

/// Response for the transfer endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TransferResponse {
    pub message: String,
    pub event: TransferEvent,
}

/// Query for the events endpoint
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub account: Option<String>,
}

/// Response for the accounts endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AccountResponse {
    pub address: Address,

    #[schema(value_type = String, example = "50")]
    pub balance: TokenAmount,
}

/// Response for the validate endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ValidateResponse {
    pub valid: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response for the create wallet endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WalletResponse {
    /// The wallet's address
    pub address: String,

    /// The wallet's private key (hex encoded)
    pub private_key: String,
}

fn parse_address(raw: &str) -> Result<Address, HttpResponse> {
    raw.parse::<Address>().map_err(|err| {
        HttpResponse::BadRequest().json(ErrorResponse::new("InvalidAddress", err))
    })
}

fn ledger_error_response(err: LedgerError) -> HttpResponse {
    let body = ErrorResponse::new(err.kind(), &err);
    match err {
        LedgerError::InsufficientBalance { .. } | LedgerError::InvalidRecipient(_) => {
            HttpResponse::BadRequest().json(body)
        }
        LedgerError::BalanceOverflow { .. } => HttpResponse::InternalServerError().json(body),
    }
}

fn caller_error_response(err: CallerError) -> HttpResponse {
    match err {
        CallerError::InvalidNonce { .. } => {
            HttpResponse::Conflict().json(ErrorResponse::new("InvalidNonce", err))
        }
        CallerError::InvalidSignature | CallerError::CryptoError(_) => {
            HttpResponse::Unauthorized().json(ErrorResponse::new("Unauthorized", err))
        }
        CallerError::SerializationError(_) => {
            HttpResponse::InternalServerError().json(ErrorResponse::new("Internal", err))
        }
    }
}

/// Get token metadata
///
/// Returns the name, symbol, decimals and total supply
#[utoipa::path(
    get,
    path = "/api/v1/token",
    responses(
        (status = 200, description = "Token metadata", body = TokenInfoResponse)
    )
)]
pub async fn get_token_info(service: TokenData) -> impl Responder {
    let ledger = &service.ledger;

    HttpResponse::Ok().json(TokenInfoResponse {
        name: ledger.name().to_string(),
        symbol: ledger.symbol().to_string(),
        decimals: ledger.decimals(),
        total_supply: ledger.total_supply(),
    })
}

/// Get the total supply
#[utoipa::path(
    get,
    path = "/api/v1/token/total-supply",
    responses(
        (status = 200, description = "Total supply", body = TotalSupplyResponse)
    )
)]
pub async fn get_total_supply(service: TokenData) -> impl Responder {
    HttpResponse::Ok().json(TotalSupplyResponse {
        total_supply: service.ledger.total_supply(),
    })
}

/// Get an account balance
///
/// Accounts that never received tokens have a balance of zero
#[utoipa::path(
    get,
    path = "/api/v1/balance/{address}",
    params(
        ("address" = String, Path, description = "Base58 account address")
    ),
    responses(
        (status = 200, description = "Balance retrieved successfully", body = BalanceResponse),
        (status = 400, description = "Invalid address", body = ErrorResponse)
    )
)]
pub async fn get_balance(service: TokenData, address: web::Path<String>) -> impl Responder {
    let address = match parse_address(&address.into_inner()) {
        Ok(address) => address,
        Err(response) => return response,
    };

    let balance = service.ledger.balance_of(&address);
    let nonce = service.resolver.next_nonce(&address);

    HttpResponse::Ok().json(BalanceResponse {
        address,
        balance,
        nonce,
    })
}

/// Transfer tokens
///
/// The sender is the account whose key signed the request
#[utoipa::path(
    post,
    path = "/api/v1/transfer",
    request_body = TransferRequest,
    responses(
        (status = 200, description = "Transfer applied", body = TransferResponse),
        (status = 400, description = "Transfer rejected by the ledger, or sender holds no tokens", body = ErrorResponse),
        (status = 401, description = "Missing or invalid signature", body = ErrorResponse),
        (status = 409, description = "Unexpected nonce", body = ErrorResponse)
    )
)]
pub async fn transfer(
    service: TokenData,
    request: web::Json<TransferRequest>,
) -> impl Responder {
    let request = request.into_inner();

    if let Err(response) = parse_address(&request.to.0) {
        return response;
    }

    // Reject before the resolver opens a nonce slot, so requests that cannot
    // succeed leave no state behind
    if let Err(err) = service
        .ledger
        .validate_transfer(&request.from, &request.to, request.amount)
    {
        return ledger_error_response(err);
    }
    if service.ledger.balance_of(&request.from).is_zero() {
        return HttpResponse::BadRequest()
            .json(ErrorResponse::new("EmptySender", "sender holds no tokens"));
    }

    let caller = match service.resolver.resolve(&request) {
        Ok(caller) => caller,
        Err(err) => {
            warn!("Rejected transfer request from {}: {}", request.from, err);
            return caller_error_response(err);
        }
    };

    match service.ledger.transfer(caller.address(), &request.to, request.amount) {
        Ok(event) => HttpResponse::Ok().json(TransferResponse {
            message: "Transfer applied".to_string(),
            event,
        }),
        Err(err) => ledger_error_response(err),
    }
}

/// Get transfer events
///
/// Returns the audit log, optionally only events involving one account
#[utoipa::path(
    get,
    path = "/api/v1/events",
    params(
        ("account" = Option<String>, Query, description = "Only events sent or received by this address")
    ),
    responses(
        (status = 200, description = "Events retrieved successfully", body = Vec<TransferEvent>),
        (status = 400, description = "Invalid address", body = ErrorResponse)
    )
)]
pub async fn get_events(service: TokenData, query: web::Query<EventsQuery>) -> impl Responder {
    let account = match query.account.as_deref().map(parse_address).transpose() {
        Ok(account) => account,
        Err(response) => return response,
    };

    HttpResponse::Ok().json(service.ledger.events(account.as_ref()))
}

/// Get all token holders
///
/// Returns every account with a non-zero balance
#[utoipa::path(
    get,
    path = "/api/v1/accounts",
    responses(
        (status = 200, description = "Accounts retrieved successfully", body = Vec<AccountResponse>)
    )
)]
pub async fn get_accounts(service: TokenData) -> impl Responder {
    let accounts: Vec<AccountResponse> = service
        .ledger
        .holders()
        .into_iter()
        .map(|(address, balance)| AccountResponse { address, balance })
        .collect();

    HttpResponse::Ok().json(accounts)
}

/// Check the ledger invariants
///
/// Verifies that balances add up to the total supply
#[utoipa::path(
    get,
    path = "/api/v1/validate",
    responses(
        (status = 200, description = "Ledger validation status", body = ValidateResponse)
    )
)]
pub async fn validate_ledger(service: TokenData) -> impl Responder {
    let response = match service.ledger.check_invariants() {
        Ok(()) => ValidateResponse {
            valid: true,
            error: None,
        },
        Err(err) => ValidateResponse {
            valid: false,
            error: Some(err.to_string()),
        },
    };

    HttpResponse::Ok().json(response)
}

/// Create a new wallet
///
/// Creates a new wallet with a random keypair
///
/// The private key must be stored by your own
#[utoipa::path(
    post,
    path = "/api/v1/wallet/new",
    responses(
        (status = 201, description = "Wallet created successfully", body = WalletResponse)
    )
)]
pub async fn create_wallet() -> impl Responder {
    let wallet = Wallet::new();

    HttpResponse::Created().json(WalletResponse {
        address: wallet.address().0.clone(),
        private_key: hex::encode(wallet.export_secret_key()),
    })
}
