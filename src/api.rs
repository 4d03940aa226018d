//! HTTP management API for accounts, groups and chat destinations.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::channel::{Destination, NotificationChannel};
use crate::model::{MonitoredAccount, NotificationGroup, Platform};
use crate::storage::StorageFactory;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<StorageFactory>,
    pub channel: Arc<dyn NotificationChannel>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing {0}")]
    Missing(&'static str),
    #[error("Unknown platform: {0}")]
    UnknownPlatform(String),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{context}")]
    Internal {
        context: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl ApiError {
    fn internal(context: &'static str) -> impl FnOnce(anyhow::Error) -> Self {
        move |source| ApiError::Internal { context, source }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(err) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() }))).into_response()
            }
            ApiError::Internal { context, source } => {
                error!(err = ?source, "{context}");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": context }))).into_response()
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct NewAccount {
    pub username: Option<String>,
    pub platform: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewGroup {
    pub name: Option<String>,
    pub platform: Option<String>,
    pub group_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GroupQuery {
    pub platform: Option<String>,
}

fn required<'a>(value: &'a Option<String>, field: &'static str) -> Result<&'a str, ValidationError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ValidationError::Missing(field))
}

fn platform(raw: &str) -> Result<Platform, ValidationError> {
    raw.parse()
        .map_err(|_| ValidationError::UnknownPlatform(raw.to_string()))
}

pub fn router(storage: Arc<StorageFactory>, channel: Arc<dyn NotificationChannel>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/accounts", get(list_accounts).post(create_account))
        .route("/api/groups", get(list_groups).post(create_group))
        .route("/api/telegram/groups", get(list_destinations))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { storage, channel })
}

async fn root() -> &'static str {
    "Social media notification relay is running"
}

async fn list_accounts(
    State(AppState { storage, .. }): State<AppState>,
) -> Result<Json<Vec<MonitoredAccount>>, ApiError> {
    let accounts = storage
        .get_storage()
        .await
        .list_accounts()
        .await
        .map_err(ApiError::internal("DB Error"))?;
    Ok(Json(accounts))
}

async fn create_account(
    State(AppState { storage, .. }): State<AppState>,
    Json(req): Json<NewAccount>,
) -> Result<Json<MonitoredAccount>, ApiError> {
    let username = required(&req.username, "username")?;
    let platform = platform(required(&req.platform, "platform")?)?;
    let account = storage
        .get_storage()
        .await
        .add_account(username, platform)
        .await
        .map_err(ApiError::internal("Failed to create account"))?;
    Ok(Json(account))
}

async fn list_groups(
    State(AppState { storage, .. }): State<AppState>,
    Query(query): Query<GroupQuery>,
) -> Result<Json<Vec<NotificationGroup>>, ApiError> {
    let filter = match query.platform.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => Some(platform(raw)?),
        _ => None,
    };
    let groups = storage
        .get_storage()
        .await
        .list_groups(filter)
        .await
        .map_err(ApiError::internal("DB Error"))?;
    Ok(Json(groups))
}

async fn list_destinations(
    State(AppState { channel, .. }): State<AppState>,
) -> Json<Vec<Destination>> {
    Json(channel.list_destinations().await)
}

async fn create_group(
    State(AppState { storage, .. }): State<AppState>,
    Json(req): Json<NewGroup>,
) -> Result<Json<NotificationGroup>, ApiError> {
    let name = required(&req.name, "name")?;
    let platform = platform(required(&req.platform, "platform")?)?;
    let destination_id = required(&req.group_id, "groupId")?;
    let group = storage
        .get_storage()
        .await
        .add_group(name, platform, destination_id)
        .await
        .map_err(ApiError::internal("Failed to create group"))?;
    Ok(Json(group))
}
