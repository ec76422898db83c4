use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use clap::Parser;
use rule_ledger_api::{
    MoveTarget, Placement, RuleLedgerApi, RulePage, API_CONTRACT_VERSION,
};
use rule_ledger_core::{Endpoint, LedgerError, Rule, RuleId, RulePayload};
use serde::{Deserialize, Serialize};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Clone)]
struct ServiceState {
    ledger: Arc<Mutex<RuleLedgerApi>>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorBody {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug)]
struct ServiceError {
    status: StatusCode,
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ListParams {
    #[serde(default = "default_page")]
    page: u64,
    #[serde(default = "default_page_size")]
    page_size: u64,
}

fn default_page() -> u64 {
    1
}

fn default_page_size() -> u64 {
    50
}

#[derive(Debug, Clone, Deserialize)]
struct CreateRuleBody {
    name: String,
    #[serde(default)]
    sources: Vec<Endpoint>,
    #[serde(default)]
    destinations: Vec<Endpoint>,
    #[serde(default)]
    placement: Option<PlacementBody>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
enum PlacementBody {
    First,
    Last,
    Before { before: String },
}

#[derive(Debug, Clone, Deserialize)]
struct UpdateRuleBody {
    name: String,
    #[serde(default)]
    sources: Vec<Endpoint>,
    #[serde(default)]
    destinations: Vec<Endpoint>,
}

#[derive(Debug, Clone, Deserialize)]
struct ReorderBody {
    id: String,
    before_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RenormalizeBody {
    #[serde(default)]
    only_if_needed: bool,
}

#[derive(Debug, Clone, Serialize)]
struct RenormalizeResponse {
    ran: bool,
    rules: u64,
}

#[derive(Debug, Clone, Serialize)]
struct CountResponse {
    total: u64,
}

#[derive(Debug, Clone, Serialize)]
struct DeleteResponse {
    deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "rule-ledger-service")]
#[command(about = "Local HTTP service for the rule ledger")]
struct Args {
    #[arg(long, default_value = "./rule_ledger.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }
}

impl From<LedgerError> for ServiceError {
    fn from(err: LedgerError) -> Self {
        let status = match err {
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::InvalidOperation(_) | LedgerError::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            LedgerError::Conflict | LedgerError::Exhausted { .. } => StatusCode::CONFLICT,
            LedgerError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let body = ServiceErrorBody {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl ServiceState {
    fn ledger(&self) -> Result<MutexGuard<'_, RuleLedgerApi>, ServiceError> {
        self.ledger.lock().map_err(|_| {
            ServiceError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "ledger lock poisoned by an earlier panic",
            )
        })
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn parse_rule_id(raw: &str) -> Result<RuleId, ServiceError> {
    RuleId::from_str(raw).map_err(ServiceError::from)
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", get(db_schema_version))
        .route("/v1/rules", get(rules_list).post(rules_create))
        .route("/v1/rules/count", get(rules_count))
        .route("/v1/rules/renormalize", post(rules_renormalize))
        .route("/v1/rules/reorder", patch(rules_reorder))
        .route("/v1/rules/:id", get(rules_show).put(rules_update).delete(rules_delete))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let ledger = RuleLedgerApi::open(&args.db)?;
    let state = ServiceState { ledger: Arc::new(Mutex::new(ledger)) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<rule_ledger_store_sqlite::SchemaStatus>>, ServiceError> {
    let status = state.ledger()?.schema_status()?;
    Ok(Json(envelope(status)))
}

async fn rules_list(
    State(state): State<ServiceState>,
    Query(params): Query<ListParams>,
) -> Result<Json<ServiceEnvelope<RulePage>>, ServiceError> {
    let page = state.ledger()?.list_page(params.page, params.page_size)?;
    Ok(Json(envelope(page)))
}

async fn rules_create(
    State(state): State<ServiceState>,
    Json(body): Json<CreateRuleBody>,
) -> Result<Json<ServiceEnvelope<Rule>>, ServiceError> {
    let placement = match body.placement {
        None | Some(PlacementBody::Last) => Placement::Last,
        Some(PlacementBody::First) => Placement::First,
        Some(PlacementBody::Before { before }) => Placement::Before(parse_rule_id(&before)?),
    };
    let payload = RulePayload {
        name: body.name,
        sources: body.sources,
        destinations: body.destinations,
    };
    let rule = state.ledger()?.create_rule(payload, placement)?;
    Ok(Json(envelope(rule)))
}

async fn rules_count(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<CountResponse>>, ServiceError> {
    let total = state.ledger()?.count_rules()?;
    Ok(Json(envelope(CountResponse { total })))
}

async fn rules_renormalize(
    State(state): State<ServiceState>,
    Json(body): Json<RenormalizeBody>,
) -> Result<Json<ServiceEnvelope<RenormalizeResponse>>, ServiceError> {
    let mut ledger = state.ledger()?;
    let response = if body.only_if_needed {
        let ran = ledger.renormalize_if_needed()?;
        let rules = if ran { ledger.count_rules()? } else { 0 };
        RenormalizeResponse { ran, rules }
    } else {
        let renumbered = ledger.renormalize()?;
        RenormalizeResponse { ran: true, rules: u64::try_from(renumbered).unwrap_or(u64::MAX) }
    };
    Ok(Json(envelope(response)))
}

async fn rules_reorder(
    State(state): State<ServiceState>,
    Json(body): Json<ReorderBody>,
) -> Result<Json<ServiceEnvelope<Rule>>, ServiceError> {
    let id = parse_rule_id(&body.id)?;
    let target = match body.before_id {
        None => MoveTarget::End,
        Some(before_id) => MoveTarget::Before(parse_rule_id(&before_id)?),
    };
    let rule = state.ledger()?.move_rule(id, target)?;
    Ok(Json(envelope(rule)))
}

async fn rules_show(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceEnvelope<Rule>>, ServiceError> {
    let rule = state.ledger()?.get_rule(parse_rule_id(&id)?)?;
    Ok(Json(envelope(rule)))
}

async fn rules_update(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateRuleBody>,
) -> Result<Json<ServiceEnvelope<Rule>>, ServiceError> {
    let payload = RulePayload {
        name: body.name,
        sources: body.sources,
        destinations: body.destinations,
    };
    let rule = state.ledger()?.update_rule(parse_rule_id(&id)?, payload)?;
    Ok(Json(envelope(rule)))
}

async fn rules_delete(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceEnvelope<DeleteResponse>>, ServiceError> {
    state.ledger()?.delete_rule(parse_rule_id(&id)?)?;
    Ok(Json(envelope(DeleteResponse { deleted: true })))
}
