//! REST provisioning API.
//!
//! Directory mutations and login live here; everything real-time goes over
//! the signaling socket. Password hashes never leave the store.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::directory::Device;
use crate::errors::CoordinatorError;
use crate::AppState;

/// Router for the provisioning endpoints.
pub fn rest_router(state: AppState) -> Router {
    Router::new()
        .route("/api/companies", post(create_company))
        .route("/api/companies/:id", get(get_company))
        .route("/api/devices", post(create_device))
        .route("/api/devices/:id", get(get_device))
        .route("/api/channels", post(create_channel))
        .route("/api/channels/:id", get(get_channel))
        .route("/api/channels/:channel_id/members", post(add_member))
        .route(
            "/api/channels/:channel_id/members/:device_id",
            delete(remove_member),
        )
        .route("/api/login", post(login))
        .route("/api/presence", get(presence))
        .with_state(state)
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(target: "ptt.rest", error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.client_message() }))).into_response()
    }
}

/// Device as exposed over REST: everything but the password hash.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceView {
    id: String,
    company_id: String,
    name: String,
    account_number: String,
    created_at: DateTime<Utc>,
}

impl From<Device> for DeviceView {
    fn from(device: Device) -> Self {
        Self {
            id: device.id,
            company_id: device.company_id,
            name: device.name,
            account_number: device.account_number,
            created_at: device.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateCompanyRequest {
    name: String,
}

async fn create_company(
    State(state): State<AppState>,
    Json(request): Json<CreateCompanyRequest>,
) -> Result<Response, CoordinatorError> {
    let company = state.directory.create_company(&request.name).await?;
    info!(target: "ptt.rest", company_id = %company.id, "Company created");
    Ok((StatusCode::CREATED, Json(company)).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateDeviceRequest {
    company_id: String,
    name: String,
    password: String,
}

async fn create_device(
    State(state): State<AppState>,
    Json(request): Json<CreateDeviceRequest>,
) -> Result<Response, CoordinatorError> {
    let device = state
        .directory
        .create_device(&request.company_id, &request.name, &request.password)
        .await?;
    info!(target: "ptt.rest", device_id = %device.id, "Device created");
    Ok((StatusCode::CREATED, Json(DeviceView::from(device))).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateChannelRequest {
    company_id: String,
    name: String,
}

async fn create_channel(
    State(state): State<AppState>,
    Json(request): Json<CreateChannelRequest>,
) -> Result<Response, CoordinatorError> {
    let channel = state
        .directory
        .create_channel(&request.company_id, &request.name)
        .await?;
    info!(target: "ptt.rest", channel_id = %channel.id, "Channel created");
    Ok((StatusCode::CREATED, Json(channel)).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddMemberRequest {
    device_id: String,
}

async fn add_member(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Json(request): Json<AddMemberRequest>,
) -> Result<StatusCode, CoordinatorError> {
    state
        .directory
        .add_member(&channel_id, &request.device_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_member(
    State(state): State<AppState>,
    Path((channel_id, device_id)): Path<(String, String)>,
) -> Result<StatusCode, CoordinatorError> {
    state.directory.remove_member(&channel_id, &device_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_company(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, CoordinatorError> {
    let company = state
        .directory
        .company(&id)
        .await
        .ok_or(CoordinatorError::DirectoryNotFound { kind: "company", id })?;
    Ok(Json(company).into_response())
}

async fn get_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, CoordinatorError> {
    let device = state
        .directory
        .device(&id)
        .await
        .ok_or(CoordinatorError::DirectoryNotFound { kind: "device", id })?;
    Ok(Json(DeviceView::from(device)).into_response())
}

async fn get_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, CoordinatorError> {
    let channel = state
        .directory
        .channel(&id)
        .await
        .ok_or(CoordinatorError::DirectoryNotFound { kind: "channel", id })?;
    Ok(Json(channel).into_response())
}

/// Live rooms with their members and current speaker.
async fn presence(State(state): State<AppState>) -> Result<Response, CoordinatorError> {
    let mut rooms = Vec::new();
    for room in state.coordinator.rooms().await? {
        // A room can empty out between listing and querying; skip it.
        let Ok(member_connections) = room.members().await else {
            continue;
        };
        let speaker = room.current_speaker().await.unwrap_or(None);

        let members: Vec<_> = state
            .registry
            .entries_for(&member_connections)
            .await
            .into_iter()
            .map(|(_, entry)| {
                json!({
                    "deviceId": entry.device_id,
                    "name": entry.display_name,
                })
            })
            .collect();

        rooms.push(json!({
            "roomId": room.room_id(),
            "members": members,
            "speaker": speaker.map(|s| json!({
                "deviceId": s.device_id,
                "name": s.display_name,
            })),
        }));
    }
    Ok(Json(json!({ "rooms": rooms })).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    account_number: String,
    password: String,
    /// Optional: disambiguates when the same number exists in several
    /// companies.
    company_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    token: String,
    device: DeviceView,
}

async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Response, CoordinatorError> {
    let device = state
        .directory
        .authenticate(
            &request.account_number,
            request.company_id.as_deref(),
            &request.password,
        )
        .await
        .ok_or_else(|| CoordinatorError::AuthFailed("bad credentials".to_string()))?;

    let token = state.tokens.issue(&device)?;
    info!(target: "ptt.rest", device_id = %device.id, "Login");
    Ok(Json(LoginResponse {
        token,
        device: DeviceView::from(device),
    })
    .into_response())
}
