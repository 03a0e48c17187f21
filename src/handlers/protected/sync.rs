// handlers/protected/sync.rs - GET|POST /api/sync?action=...
//
// The relay keeps a single path and dispatches on the `action` query
// parameter. Binary payloads travel as base64 strings.

use axum::{
    extract::{rejection::JsonRejection, Extension, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::error::ApiError;
use crate::middleware::{ApiResponse, AuthUser};
use crate::relay::codec::{decode_optional, decode_payload, encode_payload};
use crate::relay::{BeginUpload, ChunkUpload, CreatePairing, Direction, InlineUpload, ReportConflict};
use crate::services::usage_service::Metric;

#[derive(Debug, Default, Deserialize)]
pub struct SyncQuery {
    pub action: Option<String>,
    pub pairing_id: Option<String>,
    pub entry_id: Option<String>,
    pub direction: Option<String>,
    pub index: Option<String>,
    pub limit: Option<String>,
    pub unresolved: Option<String>,
}

impl SyncQuery {
    fn action(&self) -> Result<&str, ApiError> {
        self.action
            .as_deref()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| ApiError::bad_request("Missing action parameter"))
    }

    fn uuid(value: &Option<String>, name: &str) -> Result<Uuid, ApiError> {
        let raw = value
            .as_deref()
            .ok_or_else(|| ApiError::field_error(name, format!("{} is required", name)))?;
        Uuid::parse_str(raw).map_err(|_| ApiError::field_error(name, format!("{} must be a UUID", name)))
    }

    fn pairing_id(&self) -> Result<Uuid, ApiError> {
        Self::uuid(&self.pairing_id, "pairing_id")
    }

    fn entry_id(&self) -> Result<Uuid, ApiError> {
        Self::uuid(&self.entry_id, "entry_id")
    }

    fn direction(&self) -> Result<Direction, ApiError> {
        match self.direction.as_deref() {
            None | Some("") => Ok(Direction::default()),
            Some(raw) => Direction::parse(raw)
                .ok_or_else(|| ApiError::field_error("direction", "direction must be 'inbound' or 'outbound'")),
        }
    }

    fn index(&self) -> Result<u32, ApiError> {
        self.index
            .as_deref()
            .ok_or_else(|| ApiError::field_error("index", "index is required"))?
            .parse()
            .map_err(|_| ApiError::field_error("index", "index must be a non-negative integer"))
    }

    fn limit(&self) -> Result<Option<i64>, ApiError> {
        self.limit
            .as_deref()
            .map(|raw| raw.parse().map_err(|_| ApiError::field_error("limit", "limit must be an integer")))
            .transpose()
    }

    fn unresolved(&self) -> bool {
        matches!(self.unresolved.as_deref(), Some("true") | Some("1"))
    }
}

#[derive(Debug, Deserialize)]
struct UploadBody {
    pairing_id: Uuid,
    #[serde(default)]
    direction: Direction,
    manifest: Value,
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BeginBody {
    pairing_id: Uuid,
    #[serde(default)]
    direction: Direction,
    manifest: Value,
    expected_chunks: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChunkBody {
    entry_id: Uuid,
    index: u32,
    data: String,
}

#[derive(Debug, Deserialize)]
struct CompleteBody {
    entry_id: Uuid,
    total_chunks: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ResolveBody {
    conflict_id: Uuid,
    resolution: String,
}

#[derive(Debug, Serialize)]
struct Payload {
    entry_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    index: Option<u32>,
    size: usize,
    data: String,
}

fn body<T: DeserializeOwned>(action: &str, payload: Result<Json<Value>, JsonRejection>) -> Result<T, ApiError> {
    let Json(value) = payload?;
    serde_json::from_value(value).map_err(|e| ApiError::bad_request(format!("Invalid {} request: {}", action, e)))
}

/// Meter a finished upload. The package is already stored, so a metering
/// failure is logged and the request still succeeds.
async fn record_sync_upload(state: &AppState, owner: Uuid) -> bool {
    match state.usage.record_usage(owner, Metric::SyncUpload, 1).await {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to record sync upload for {}: {}", owner, e);
            false
        }
    }
}

fn ok<T: Serialize>(data: T) -> Result<Response, ApiError> {
    Ok(ApiResponse::success(data).into_response())
}

fn created<T: Serialize>(data: T) -> Result<Response, ApiError> {
    Ok(ApiResponse::created(data).into_response())
}

/// GET /api/sync?action=pairings|latest|entries|blob|chunk|conflicts|audit
pub async fn sync_get(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<SyncQuery>,
) -> Result<Response, ApiError> {
    let owner = auth.user_id;
    let relay = &state.relay;
    let action = query.action()?;
    debug!("sync GET {} for {}", action, owner);

    match action {
        "pairings" => ok(relay.list_pairings(owner).await?),
        "latest" => ok(relay.latest(owner, query.pairing_id()?, query.direction()?).await?),
        "entries" => ok(relay.list_entries(owner, query.pairing_id()?, query.limit()?).await?),
        "blob" => {
            let entry_id = query.entry_id()?;
            let bytes = relay.fetch_blob(owner, entry_id).await?;
            ok(Payload {
                entry_id,
                index: None,
                size: bytes.len(),
                data: encode_payload(&bytes),
            })
        }
        "chunk" => {
            let entry_id = query.entry_id()?;
            let index = query.index()?;
            let bytes = relay.fetch_chunk(owner, entry_id, index).await?;
            ok(Payload {
                entry_id,
                index: Some(index),
                size: bytes.len(),
                data: encode_payload(&bytes),
            })
        }
        "conflicts" => ok(relay.list_conflicts(owner, query.pairing_id()?, query.unresolved()).await?),
        "audit" => {
            let pairing_id = match query.pairing_id {
                Some(_) => Some(query.pairing_id()?),
                None => None,
            };
            ok(relay.audit_log(owner, pairing_id, query.limit()?).await?)
        }
        other => Err(ApiError::bad_request(format!("Unknown GET action '{}'", other))),
    }
}

/// POST /api/sync?action=create_pairing|upload|begin|upload_chunk|complete|report_conflict|resolve_conflict
pub async fn sync_post(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<SyncQuery>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    let owner = auth.user_id;
    let relay = &state.relay;
    let action = query.action()?;
    debug!("sync POST {} for {}", action, owner);

    match action {
        "create_pairing" => {
            let request: CreatePairing = body(action, payload)?;
            created(relay.create_pairing(owner, request).await?)
        }
        "upload" => {
            let request: UploadBody = body(action, payload)?;
            let data = decode_optional("data", request.data.as_deref())?;
            state.usage.check_quota(owner, Metric::SyncUpload).await?;

            let entry = relay
                .upload_inline(
                    owner,
                    InlineUpload {
                        pairing_id: request.pairing_id,
                        direction: request.direction,
                        manifest: request.manifest,
                        data,
                    },
                )
                .await?;
            record_sync_upload(&state, owner).await;
            created(crate::relay::PackageDescriptor::from(entry))
        }
        "begin" => {
            let request: BeginBody = body(action, payload)?;
            state.usage.check_quota(owner, Metric::SyncUpload).await?;

            let entry = relay
                .begin_upload(
                    owner,
                    BeginUpload {
                        pairing_id: request.pairing_id,
                        direction: request.direction,
                        manifest: request.manifest,
                        expected_chunks: request.expected_chunks,
                    },
                )
                .await?;
            created(entry)
        }
        "upload_chunk" => {
            let request: ChunkBody = body(action, payload)?;
            let data = decode_payload("data", &request.data)?;
            let receipt = relay
                .upload_chunk(
                    owner,
                    ChunkUpload {
                        entry_id: request.entry_id,
                        index: request.index,
                        data,
                    },
                )
                .await?;
            ok(receipt)
        }
        "complete" => {
            let request: CompleteBody = body(action, payload)?;
            let completed = relay.complete_upload(owner, request.entry_id, request.total_chunks).await?;
            if completed.newly_completed {
                record_sync_upload(&state, owner).await;
            }
            ok(crate::relay::PackageDescriptor::from(completed.entry))
        }
        "report_conflict" => {
            let request: ReportConflict = body(action, payload)?;
            created(relay.report_conflict(owner, request).await?)
        }
        "resolve_conflict" => {
            let request: ResolveBody = body(action, payload)?;
            ok(relay.resolve_conflict(owner, request.conflict_id, &request.resolution).await?)
        }
        other => Err(ApiError::bad_request(format!("Unknown POST action '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{body::Body, extract::DefaultBodyLimit, http::Request, routing::post, Router};
    use tower::ServiceExt;

    use super::*;
    use crate::clients::{AnthropicClient, StripeClient};
    use crate::database::DatabaseManager;

    /// State whose pool points at a closed port; nothing here may touch it
    /// successfully.
    fn offline_state() -> AppState {
        let mut config = crate::config::config().clone();
        config.database.url = "postgres://invalid@127.0.0.1:1/none".to_string();
        config.database.connection_timeout = 1;
        let pool = DatabaseManager::connect(&config.database).unwrap();
        let provider = Arc::new(AnthropicClient::new(config.ai.clone()).unwrap());
        let stripe = Arc::new(StripeClient::new(&config.billing).unwrap());
        AppState::new(pool, config, provider, stripe)
    }

    fn caller() -> AuthUser {
        AuthUser {
            user_id: Uuid::new_v4(),
            email: "ada@example.com".to_string(),
            session_id: Uuid::new_v4(),
        }
    }

    fn query(pairs: &[(&str, &str)]) -> SyncQuery {
        let encoded = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let uri: axum::http::Uri = format!("/api/sync?{}", encoded).parse().unwrap();
        Query::<SyncQuery>::try_from_uri(&uri).unwrap().0
    }

    #[test]
    fn missing_action_is_bad_request() {
        assert_eq!(query(&[]).action().unwrap_err().status_code(), 400);
    }

    #[test]
    fn direction_defaults_to_inbound() {
        assert_eq!(query(&[("action", "latest")]).direction().unwrap(), Direction::Inbound);
        assert_eq!(query(&[("direction", "outbound")]).direction().unwrap(), Direction::Outbound);
        assert!(query(&[("direction", "sideways")]).direction().is_err());
    }

    #[test]
    fn ids_and_indices_are_validated() {
        assert!(query(&[("pairing_id", "nope")]).pairing_id().is_err());
        assert!(query(&[]).entry_id().is_err());
        assert_eq!(query(&[("index", "3")]).index().unwrap(), 3);
        assert!(query(&[("index", "-1")]).index().is_err());
        assert_eq!(query(&[("limit", "10")]).limit().unwrap(), Some(10));
        assert!(query(&[("unresolved", "true")]).unresolved());
    }

    #[test]
    fn bodies_are_checked_per_action() {
        let good: Result<CompleteBody, _> = body(
            "complete",
            Ok(Json(serde_json::json!({ "entry_id": Uuid::new_v4(), "total_chunks": 2 }))),
        );
        assert_eq!(good.unwrap().total_chunks, Some(2));

        let bad: Result<ChunkBody, _> = body("upload_chunk", Ok(Json(serde_json::json!({ "index": 0 }))));
        assert_eq!(bad.unwrap_err().status_code(), 400);
    }

    #[tokio::test]
    async fn oversized_body_points_at_chunked_upload() {
        let app = Router::new()
            .route("/api/sync", post(sync_post))
            .layer(Extension(caller()))
            .layer(DefaultBodyLimit::max(1024))
            .with_state(offline_state());

        let body = serde_json::to_vec(&serde_json::json!({
            "pairing_id": Uuid::new_v4(),
            "manifest": {},
            "data": "A".repeat(4096),
        }))
        .unwrap();
        let request = Request::builder()
            .method("POST")
            .uri("/api/sync?action=upload")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::PAYLOAD_TOO_LARGE);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("upload_chunk"));
    }

    #[tokio::test]
    async fn malformed_json_stays_bad_request() {
        let app = Router::new()
            .route("/api/sync", post(sync_post))
            .layer(Extension(caller()))
            .with_state(offline_state());

        let request = Request::builder()
            .method("POST")
            .uri("/api/sync?action=upload")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn metering_failure_does_not_fail_the_upload() {
        let state = offline_state();
        assert!(!record_sync_upload(&state, Uuid::new_v4()).await);
    }
}
