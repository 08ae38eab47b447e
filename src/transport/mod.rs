//! HTTP transport layer for contactlink.
//!
//! Endpoints:
//! - `POST /identify` - link an (email, phoneNumber) submission and return the cluster
//! - `GET /health` - liveness probe
//!
//! The resolver is synchronous; each request runs it on tokio's blocking pool.
//! If the client goes away, the handler future is dropped, which sets the
//! request's [`CancelFlag`] so the transaction rolls back instead of committing.

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::cluster::ClusterView;
use crate::error::{LinkError, ValidationError};
use crate::request::{IdentifyRequest, RequestPolicy};
use crate::resolver::{CancelFlag, IdentityResolver};
use crate::storage::StorageError;

/// Maximum size of an identify request body.
const MAX_BODY_BYTES: usize = 64 * 1024; // 64 KiB

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Resolver over the configured store.
    pub resolver: IdentityResolver,
    /// Format rules for incoming requests.
    pub policy: RequestPolicy,
}

impl AppState {
    /// State with the default request policy.
    #[must_use]
    pub fn new(resolver: IdentityResolver) -> Self {
        Self {
            resolver,
            policy: RequestPolicy::default(),
        }
    }

    /// Replace the request policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RequestPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Body of a successful `POST /identify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyResponse {
    /// The consolidated cluster.
    pub contact: ClusterView,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"ok"`.
    pub status: String,
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human readable message.
    pub error: String,
    /// Stable machine readable code.
    pub code: String,
}

/// Build the HTTP router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/identify", post(identify))
        .route("/health", get(health_check))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Sets the flag when dropped, i.e. when the handler finishes or is abandoned.
struct CancelOnDrop(CancelFlag);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

async fn identify(
    State(state): State<AppState>,
    payload: Result<Json<IdentifyRequest>, JsonRejection>,
) -> Result<Json<IdentifyResponse>, ApiError> {
    let request_id = uuid::Uuid::new_v4();
    let span = tracing::info_span!("identify", %request_id);

    async move {
        let Json(request) = payload.map_err(ApiError::from)?;
        let submission = state.policy.check(&request)?;

        let cancel = CancelFlag::new();
        let _guard = CancelOnDrop(cancel.clone());
        let resolver = state.resolver.clone();
        let span = tracing::Span::current();

        let view = tokio::task::spawn_blocking(move || {
            span.in_scope(|| resolver.resolve_submission(&submission, &cancel))
        })
        .await
        .map_err(|e| ApiError::Internal(format!("resolver task failed: {e}")))??;

        tracing::debug!(
            primary = %view.primary_contact_id,
            secondaries = view.secondary_contact_ids.len(),
            "identify complete"
        );
        Ok::<_, ApiError>(Json(IdentifyResponse { contact: view }))
    }
    .instrument(span)
    .await
}

/// API error types
#[derive(Debug)]
pub enum ApiError {
    /// Neither identifier supplied (400).
    MissingIdentifier(String),
    /// Malformed field (422).
    InvalidField(String),
    /// Body could not be read as an identify request.
    Rejected {
        /// Status chosen by the JSON extractor.
        status: StatusCode,
        /// Extractor message.
        message: String,
    },
    /// Cancelled or conflicting; the client may retry (503).
    Unavailable(String),
    /// Storage failure (500).
    Storage(String),
    /// Anything else (500).
    Internal(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let status = match rejection {
            JsonRejection::JsonDataError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => rejection.status(),
        };
        Self::Rejected {
            status,
            message: rejection.body_text(),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        if err.is_missing_identifier() {
            Self::MissingIdentifier(err.to_string())
        } else {
            Self::InvalidField(err.to_string())
        }
    }
}

impl From<LinkError> for ApiError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Validation(v) => v.into(),
            LinkError::Storage(StorageError::SerializationConflict(_)) | LinkError::Cancelled => {
                Self::Unavailable(err.to_string())
            }
            LinkError::Storage(_) => Self::Storage(err.to_string()),
            LinkError::Internal { .. } => Self::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::MissingIdentifier(msg) => (StatusCode::BAD_REQUEST, "MISSING_IDENTIFIER", msg),
            Self::InvalidField(msg) => (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_FIELD", msg),
            Self::Rejected { status, message } => (status, "INVALID_BODY", message),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", msg),
            Self::Storage(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR", msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
        };

        let body = Json(ErrorResponse {
            error: message,
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::storage::InMemoryContactStore;

    fn app() -> Router {
        let resolver = IdentityResolver::new(Arc::new(InMemoryContactStore::new()));
        router(AppState::new(resolver))
    }

    async fn send(app: Router, body: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/identify")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn identify_creates_primary() {
        let (status, body) = send(app(), r#"{"email":"a@x.com","phoneNumber":"1234567890"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["contact"]["primaryContactId"], 1);
        assert_eq!(body["contact"]["emails"][0], "a@x.com");
        assert_eq!(body["contact"]["phoneNumbers"][0], "1234567890");
        assert!(body["contact"]["secondaryContactIds"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_body_object_is_bad_request() {
        let (status, body) = send(app(), r#"{"email":null}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "MISSING_IDENTIFIER");
    }

    #[tokio::test]
    async fn wrong_json_type_is_unprocessable() {
        let (status, body) = send(app(), r#"{"phoneNumber":1234567890}"#).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "INVALID_BODY");
    }

    #[test]
    fn link_errors_map_to_statuses() {
        let status = |e: LinkError| ApiError::from(e).into_response().status();
        assert_eq!(status(LinkError::Cancelled), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status(StorageError::SerializationConflict("busy".into()).into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status(StorageError::BackendError("disk".into()).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status(ValidationError::MissingIdentifier.into()),
            StatusCode::BAD_REQUEST
        );
    }
}
