//! Request/response API for creating and joining groups.

use crate::handlers::AppState;
use crate::metrics;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tether_core::{Joined, RegistryError};
use tether_protocol::MemberInfo;
use tracing::{debug, info};

/// Errors returned to HTTP clients as `{"error": "..."}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Registry(e) => {
                StatusCode::from_u16(e.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            metrics::record_error("api");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinGroupRequest {
    #[serde(default)]
    group_id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMembership {
    group_id: String,
    member_id: String,
    name: String,
}

impl From<Joined> for GroupMembership {
    fn from(joined: Joined) -> Self {
        Self {
            group_id: joined.group_id,
            member_id: joined.member_id,
            name: joined.name,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MemberList {
    members: Vec<MemberInfo>,
}

/// `POST /api/create-group`
pub async fn create_group(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateGroupRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<GroupMembership>), ApiError> {
    let Json(request) = body?;
    let joined = state.registry().create_group(&request.name)?;

    info!(group = %joined.group_id, member = %joined.member_id, "Group created");
    metrics::record_group_created();
    metrics::set_active_groups(state.registry().stats().group_count);

    Ok((StatusCode::CREATED, Json(joined.into())))
}

/// `POST /api/join-group`
pub async fn join_group(
    State(state): State<Arc<AppState>>,
    body: Result<Json<JoinGroupRequest>, JsonRejection>,
) -> Result<Json<GroupMembership>, ApiError> {
    let Json(request) = body?;
    let joined = state.registry().join_group(&request.group_id, &request.name)?;

    debug!(group = %joined.group_id, member = %joined.member_id, "Member added");
    metrics::record_member_joined();

    Ok(Json(joined.into()))
}

/// `GET /api/group/:group_id/members`
pub async fn list_members(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
) -> Result<Json<MemberList>, ApiError> {
    let members = state.registry().list_members(&group_id)?;
    Ok(Json(MemberList { members }))
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::handlers::{app, AppState};
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        Router,
    };
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_app() -> (Router, Arc<AppState>) {
        let state = Arc::new(AppState::new(Config::default()));
        (app(Arc::clone(&state)), state)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, value)
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_create_group() {
        let (app, state) = test_app();

        let (status, body) = send(&app, post("/api/create-group", r#"{"name":"Alice"}"#)).await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["name"], "Alice");
        let group_id = body["groupId"].as_str().unwrap();
        assert_eq!(group_id.len(), 6);
        assert!(body["memberId"].is_string());
        assert!(state.registry().group_exists(group_id));
    }

    #[tokio::test]
    async fn test_create_group_blank_name() {
        let (app, _) = test_app();

        let (status, body) = send(&app, post("/api/create-group", r#"{"name":"   "}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = send(&app, post("/api/create-group", "{}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, post("/api/create-group", "not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_join_group_and_list_members() {
        let (app, _) = test_app();

        let (_, created) = send(&app, post("/api/create-group", r#"{"name":"Alice"}"#)).await;
        let group_id = created["groupId"].as_str().unwrap().to_string();

        let join = json!({ "groupId": group_id.to_lowercase(), "name": "Bob" }).to_string();
        let (status, joined) = send(&app, post("/api/join-group", &join)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(joined["groupId"], group_id.as_str());
        assert_eq!(joined["name"], "Bob");
        assert_ne!(joined["memberId"], created["memberId"]);

        let (status, body) = send(&app, get(&format!("/api/group/{group_id}/members"))).await;
        assert_eq!(status, StatusCode::OK);
        let members = body["members"].as_array().unwrap();
        assert_eq!(members.len(), 2);
        for member in members {
            assert!(member["location"].is_null());
            assert!(member["lastSeen"].is_u64());
            assert_eq!(member["isOnline"], true);
        }
    }

    #[tokio::test]
    async fn test_join_group_errors() {
        let (app, _) = test_app();

        let (status, body) = send(
            &app,
            post("/api/join-group", r#"{"groupId":"ZZZZZZ","name":"Bob"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());

        let (status, _) = send(&app, post("/api/join-group", r#"{"name":"Bob"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, created) = send(&app, post("/api/create-group", r#"{"name":"Alice"}"#)).await;
        let join = json!({ "groupId": created["groupId"] }).to_string();
        let (status, _) = send(&app, post("/api/join-group", &join)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_members_unknown_group() {
        let (app, _) = test_app();

        let (status, body) = send(&app, get("/api/group/NOPE00/members")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_group_capacity_is_service_unavailable() {
        let mut config = Config::default();
        config.groups.max_groups = 1;
        let app = app(Arc::new(AppState::new(config)));

        let (status, _) = send(&app, post("/api/create-group", r#"{"name":"Alice"}"#)).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(&app, post("/api/create-group", r#"{"name":"Carol"}"#)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_full_group_is_conflict() {
        let mut config = Config::default();
        config.groups.max_members_per_group = 1;
        let app = app(Arc::new(AppState::new(config)));

        let (_, created) = send(&app, post("/api/create-group", r#"{"name":"Alice"}"#)).await;
        let join = json!({ "groupId": created["groupId"], "name": "Bob" }).to_string();

        let (status, _) = send(&app, post("/api/join-group", &join)).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
