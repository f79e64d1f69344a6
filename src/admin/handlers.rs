use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::admin::AdminState;
use crate::registry::{BackendDescriptor, BackendId, RegistryError, Tier};
use crate::session::{SessionId, SessionSnapshot};
use crate::supervisor::{ActionReport, BackendAction};

/// Errors surfaced by the admin API.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{0}")]
    InvalidAction(String),

    #[error("session {0} not found")]
    SessionNotFound(u64),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdminError::Unauthorized => StatusCode::UNAUTHORIZED,
            AdminError::Registry(RegistryError::UnknownBackend(_)) => StatusCode::NOT_FOUND,
            AdminError::Registry(RegistryError::InvalidEndpoint { .. }) => StatusCode::BAD_REQUEST,
            AdminError::Registry(RegistryError::DuplicateEndpoint(_)) => StatusCode::CONFLICT,
            AdminError::InvalidAction(_) => StatusCode::BAD_REQUEST,
            AdminError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub sessions: usize,
    pub backends: Vec<BackendDescriptor>,
}

#[derive(Debug, Deserialize)]
pub struct AddBackendRequest {
    pub tier: Tier,
    pub endpoint: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    #[serde(default)]
    pub details: bool,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        sessions: state.supervisor.session_count(),
        backends: state.supervisor.list_backends(),
    })
}

pub async fn get_backends(State(state): State<AdminState>) -> Json<Vec<BackendDescriptor>> {
    Json(state.supervisor.list_backends())
}

pub async fn add_backend(
    State(state): State<AdminState>,
    Json(request): Json<AddBackendRequest>,
) -> Result<(StatusCode, Json<BackendDescriptor>), AdminError> {
    let backend = state.supervisor.add_backend(request.tier, &request.endpoint)?;
    Ok((StatusCode::CREATED, Json(backend)))
}

pub async fn backend_action(
    State(state): State<AdminState>,
    Path((id, action)): Path<(String, String)>,
) -> Result<Json<ActionReport>, AdminError> {
    let action: BackendAction = action.parse().map_err(AdminError::InvalidAction)?;
    let report = state
        .supervisor
        .on_admin_action(&BackendId::from(id), action)
        .await?;
    Ok(Json(report))
}

pub async fn get_sessions(
    State(state): State<AdminState>,
    Query(query): Query<SessionQuery>,
) -> Json<Vec<SessionSnapshot>> {
    Json(state.supervisor.list_sessions(query.details).await)
}

pub async fn kill_session(
    State(state): State<AdminState>,
    Path(id): Path<u64>,
) -> Result<StatusCode, AdminError> {
    if state.supervisor.kill_session(SessionId::from(id)) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AdminError::SessionNotFound(id))
    }
}
