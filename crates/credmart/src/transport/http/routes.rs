//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, patch, post, put},
};
use serde::Deserialize;
use serde_json::json;

use crate::gateway::GatewayEvent;
use crate::health::HealthReport;
use crate::model::{CategoryFilter, NewResource, ResourceId, ResourcePatch, UserId};
use crate::service::{MarketService, ServiceError};
use crate::session::{LoginOutcome, LoginRequest};
use crate::settlement::{Buyer, SettlementError};

type ApiResult = Result<(StatusCode, Json<serde_json::Value>), ServiceError>;

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) | Self::InsufficientFunds(_) => StatusCode::CONFLICT,
            Self::Purchase(e) => match e {
                SettlementError::InvalidId => StatusCode::NOT_FOUND,
                SettlementError::InsufficientCredits => StatusCode::PAYMENT_REQUIRED,
                _ => StatusCode::CONFLICT,
            },
            Self::ExternalSession(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = json!({
            "error": self.kind(),
            "message": self.public_message(),
        });
        (status, Json(body)).into_response()
    }
}

fn ok(body: serde_json::Value) -> ApiResult {
    Ok((StatusCode::OK, Json(body)))
}

fn parse_resource_id(raw: &str) -> Result<ResourceId, ServiceError> {
    raw.parse()
        .map_err(|_| ServiceError::Validation(format!("malformed resource id {raw:?}")))
}

#[derive(Debug, Deserialize)]
pub struct BuyerBody {
    pub user_id: UserId,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl BuyerBody {
    fn buyer(self) -> Buyer {
        Buyer::new(self.user_id, self.display_name)
    }
}

#[derive(Debug, Deserialize)]
pub struct CategoryPurchase {
    #[serde(flatten)]
    pub buyer: BuyerBody,
    pub region: String,
    #[serde(default)]
    pub tier: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GroupPurchase {
    #[serde(flatten)]
    pub buyer: BuyerBody,
    pub region: String,
    #[serde(default)]
    pub tier: Option<String>,
    pub price: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreditsBody {
    pub amount: i64,
    pub by_admin: UserId,
}

#[derive(Debug, Deserialize)]
pub struct TokenGrant {
    pub delta: i64,
}

#[derive(Debug, Deserialize)]
pub struct TokenSet {
    pub tokens: u32,
}

#[derive(Debug, Deserialize)]
pub struct BulkDiscount {
    pub percent: u8,
}

#[derive(Debug, Deserialize)]
pub struct MonitorBody {
    pub admin_id: UserId,
}

/// Who is acting on a resource's devices.
#[derive(Debug, Deserialize)]
pub struct DeviceActor {
    pub user_id: UserId,
}

#[derive(Debug, Deserialize)]
pub struct LoginBegin {
    pub api_id: i64,
    pub api_hash: String,
    pub phone: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginCode {
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginPassword {
    pub password: String,
}

async fn health_check(State(service): State<Arc<MarketService>>) -> Json<HealthReport> {
    Json(service.health().await)
}

async fn shutdown(State(service): State<Arc<MarketService>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    service.trigger_shutdown();
    (StatusCode::OK, Json(json!({})))
}

async fn buy_by_category(
    State(service): State<Arc<MarketService>>,
    Json(body): Json<CategoryPurchase>,
) -> ApiResult {
    let filter = CategoryFilter::new(body.region, body.tier);
    let receipt = service.buy_by_category(body.buyer.buyer(), filter).await?;
    ok(receipt.to_response())
}

async fn buy_by_group(
    State(service): State<Arc<MarketService>>,
    Json(body): Json<GroupPurchase>,
) -> ApiResult {
    let filter = CategoryFilter::new(body.region, body.tier);
    let receipt = service
        .buy_by_group(body.buyer.buyer(), filter, body.price)
        .await?;
    ok(receipt.to_response())
}

async fn buy_by_id(
    State(service): State<Arc<MarketService>>,
    Path(id): Path<String>,
    Json(body): Json<BuyerBody>,
) -> ApiResult {
    let receipt = service.buy_by_id(body.buyer(), &id).await?;
    ok(receipt.to_response())
}

async fn grant_credits(
    State(service): State<Arc<MarketService>>,
    Path(user): Path<UserId>,
    Json(body): Json<CreditsBody>,
) -> ApiResult {
    let account = service
        .grant_credits(user, body.amount, body.by_admin)
        .await?;
    ok(json!(account))
}

async fn set_credits(
    State(service): State<Arc<MarketService>>,
    Path(user): Path<UserId>,
    Json(body): Json<CreditsBody>,
) -> ApiResult {
    let account = service.set_credits(user, body.amount, body.by_admin).await?;
    ok(json!(account))
}

async fn grant_tokens(
    State(service): State<Arc<MarketService>>,
    Path(user): Path<UserId>,
    Json(body): Json<TokenGrant>,
) -> ApiResult {
    let tokens = service.grant_tokens(user, body.delta).await?;
    ok(json!({ "user_id": user, "tokens": tokens }))
}

async fn set_tokens(
    State(service): State<Arc<MarketService>>,
    Path(user): Path<UserId>,
    Json(body): Json<TokenSet>,
) -> ApiResult {
    let tokens = service.set_tokens(user, body.tokens).await?;
    ok(json!({ "user_id": user, "tokens": tokens }))
}

async fn add_resource(
    State(service): State<Arc<MarketService>>,
    Json(body): Json<NewResource>,
) -> ApiResult {
    let record = service.add_resource(body).await?;
    Ok((StatusCode::CREATED, Json(record.to_public())))
}

async fn edit_resource(
    State(service): State<Arc<MarketService>>,
    Path(id): Path<String>,
    Json(body): Json<ResourcePatch>,
) -> ApiResult {
    let record = service.edit_resource(parse_resource_id(&id)?, body).await?;
    ok(record.to_public())
}

async fn delete_resource(
    State(service): State<Arc<MarketService>>,
    Path(id): Path<String>,
) -> ApiResult {
    service.delete_resource(parse_resource_id(&id)?).await?;
    ok(json!({}))
}

async fn apply_bulk_discount(
    State(service): State<Arc<MarketService>>,
    Json(body): Json<BulkDiscount>,
) -> ApiResult {
    let repriced = service.apply_bulk_discount(body.percent).await?;
    ok(json!({ "repriced": repriced }))
}

async fn reset_bulk_discount(State(service): State<Arc<MarketService>>) -> ApiResult {
    let restored = service.reset_bulk_discount().await?;
    ok(json!({ "restored": restored }))
}

async fn session_status(
    State(service): State<Arc<MarketService>>,
    Path(id): Path<String>,
) -> ApiResult {
    let id = parse_resource_id(&id)?;
    match service.session_status(id).await {
        Some(status) => ok(json!(status)),
        None => Err(ServiceError::NotFound(format!("no session for {id}"))),
    }
}

async fn start_monitor(
    State(service): State<Arc<MarketService>>,
    Path(id): Path<String>,
    Json(body): Json<MonitorBody>,
) -> ApiResult {
    let status = service
        .start_monitor(parse_resource_id(&id)?, body.admin_id)
        .await?;
    ok(json!(status))
}

async fn stop_monitor(
    State(service): State<Arc<MarketService>>,
    Path(id): Path<String>,
) -> ApiResult {
    let stopped = service.stop_monitor(parse_resource_id(&id)?).await;
    ok(json!({ "stopped": stopped }))
}

async fn disconnect_session(
    State(service): State<Arc<MarketService>>,
    Path(id): Path<String>,
) -> ApiResult {
    let disconnected = service.disconnect_session(parse_resource_id(&id)?).await;
    ok(json!({ "disconnected": disconnected }))
}

async fn list_devices(
    State(service): State<Arc<MarketService>>,
    Path(id): Path<String>,
    Query(actor): Query<DeviceActor>,
) -> ApiResult {
    let devices = service
        .list_devices(parse_resource_id(&id)?, actor.user_id)
        .await?;
    let devices: Vec<serde_json::Value> = devices
        .iter()
        .enumerate()
        .map(|(i, device)| {
            let mut entry = json!(device);
            entry["label"] = json!(device.label(i + 1));
            entry
        })
        .collect();
    ok(json!({ "devices": devices }))
}

async fn reset_device(
    State(service): State<Arc<MarketService>>,
    Path((id, hash)): Path<(String, i64)>,
    Query(actor): Query<DeviceActor>,
) -> ApiResult {
    service
        .reset_device(parse_resource_id(&id)?, actor.user_id, hash)
        .await?;
    ok(json!({ "logged_out": hash }))
}

async fn log_out_session(
    State(service): State<Arc<MarketService>>,
    Path(id): Path<String>,
    Json(actor): Json<DeviceActor>,
) -> ApiResult {
    service
        .log_out_session(parse_resource_id(&id)?, actor.user_id)
        .await?;
    ok(json!({}))
}

fn login_response(outcome: LoginOutcome) -> ApiResult {
    let mut body = json!({ "status": outcome.as_str() });
    if let LoginOutcome::Ok(session) = outcome {
        body["session"] = json!(session);
        body["credentials"] = json!(session.credentials);
    }
    ok(body)
}

async fn begin_login(
    State(service): State<Arc<MarketService>>,
    Path(admin): Path<UserId>,
    Json(body): Json<LoginBegin>,
) -> ApiResult {
    let request = LoginRequest {
        api_id: body.api_id,
        api_hash: body.api_hash,
        phone: body.phone,
    };
    service.begin_login(admin, request).await?;
    ok(json!({ "status": "code_sent" }))
}

async fn login_code(
    State(service): State<Arc<MarketService>>,
    Path(admin): Path<UserId>,
    Json(body): Json<LoginCode>,
) -> ApiResult {
    login_response(service.complete_login_code(admin, &body.code).await?)
}

async fn login_password(
    State(service): State<Arc<MarketService>>,
    Path(admin): Path<UserId>,
    Json(body): Json<LoginPassword>,
) -> ApiResult {
    login_response(service.complete_login_password(admin, &body.password).await?)
}

async fn cancel_login(
    State(service): State<Arc<MarketService>>,
    Path(admin): Path<UserId>,
) -> ApiResult {
    let cancelled = service.cancel_login(admin).await;
    ok(json!({ "cancelled": cancelled }))
}

async fn gateway_event(
    State(service): State<Arc<MarketService>>,
    Path(id): Path<String>,
    Json(event): Json<GatewayEvent>,
) -> ApiResult {
    service.dispatch_event(parse_resource_id(&id)?, event).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({}))))
}

pub fn routes(service: Arc<MarketService>) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/shutdown", post(shutdown))
        .route("/purchases/category", post(buy_by_category))
        .route("/purchases/group", post(buy_by_group))
        .route("/purchases/resource/{id}", post(buy_by_id))
        .route("/users/{id}/credits", post(grant_credits).put(set_credits))
        .route("/users/{id}/tokens", post(grant_tokens).put(set_tokens))
        .route("/resources", post(add_resource))
        .route(
            "/resources/bulk-discount",
            post(apply_bulk_discount).delete(reset_bulk_discount),
        )
        .route("/resources/{id}", patch(edit_resource).delete(delete_resource))
        .route("/sessions/{id}", get(session_status).delete(disconnect_session))
        .route("/sessions/{id}/monitor", put(start_monitor).delete(stop_monitor))
        .route("/sessions/{id}/devices", get(list_devices))
        .route("/sessions/{id}/devices/{hash}", delete(reset_device))
        .route("/sessions/{id}/logout", post(log_out_session))
        .route("/logins/{admin}", post(begin_login).delete(cancel_login))
        .route("/logins/{admin}/code", post(login_code))
        .route("/logins/{admin}/password", post(login_password))
        .route("/gateway/sessions/{id}/events", post(gateway_event))
        .with_state(service)
}
