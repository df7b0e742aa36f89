//! Session CRUD + environment listing.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::router::{client_id, AppState};
use crate::session::{CreateSessionRequest as ManagerCreateRequest, SessionState};

#[derive(Debug, Deserialize)]
pub struct CreateSessionBody {
    pub environment: Option<String>,
    pub init: Option<Vec<String>>,
    pub timeout: Option<u64>,
    #[serde(rename = "toolPair")]
    pub tool_pair: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    #[serde(rename = "sessionId")]
    pub session_id: Uuid,
    #[serde(rename = "expiresAt")]
    pub expires_at: String,
    pub environment: String,
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub id: Uuid,
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub environment: String,
    #[serde(rename = "containerId")]
    pub container_id: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    pub state: SessionState,
    #[serde(rename = "initCompleted")]
    pub init_completed: bool,
    #[serde(rename = "hasChannel")]
    pub has_channel: bool,
}

pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(body): Json<CreateSessionBody>,
) -> Result<(StatusCode, Json<CreateSessionResponse>)> {
    let client = client_id(&headers, Some(peer));
    let request = ManagerCreateRequest {
        environment: body.environment,
        init: body.init,
        timeout_ms: body.timeout,
        tool_pair: body.tool_pair,
    };

    let session = state.sessions.create(&client, request).await?;
    let expires_at = chrono::Utc::now() + chrono::Duration::milliseconds(session.timeout_ms as i64);

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: session.id,
            expires_at: expires_at.to_rfc3339(),
            environment: session.environment.clone(),
        }),
    ))
}

pub async fn get_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<SessionView>> {
    let session = state.sessions.get(id).ok_or_else(|| AppError::NotFound(format!("session {id}")))?;
    Ok(Json(SessionView {
        id: session.id,
        client_id: session.client_id.clone(),
        environment: session.environment.clone(),
        container_id: session.container_id.clone(),
        created_at: chrono::DateTime::from_timestamp_millis(session.created_at_epoch_ms as i64)
            .map(|d| d.to_rfc3339())
            .unwrap_or_default(),
        state: session.state(),
        init_completed: session.init_completed(),
        has_channel: session.has_channel(),
    }))
}

pub async fn delete_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode> {
    if state.sessions.get(id).is_none() {
        return Err(AppError::NotFound(format!("session {id}")));
    }
    state.sessions.destroy(id, "client requested delete").await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct EnvironmentsResponse {
    pub environments: Vec<crate::registry::EnvironmentConfig>,
}

pub async fn list_environments(State(state): State<AppState>) -> Json<EnvironmentsResponse> {
    Json(EnvironmentsResponse { environments: state.registry.list() })
}
