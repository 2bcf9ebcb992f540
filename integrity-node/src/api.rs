//! HTTP 驗證接口
//!
//! | 方法 | 路徑 | 說明 |
//! |------|------|------|
//! | GET  | `/health` | 存活檢查 |
//! | GET  | `/supervision/status` | 基線摘要、打開的告警、最新快照 ID |
//! | POST | `/supervision/approvals` | 審批基線變更（可選 Bearer token） |
//! | POST | `/audit/generate` | 生成並發布簽名快照 |
//! | GET  | `/audit/report` | 最新簽名快照 |
//! | POST | `/audit/compare` | 比對對等節點的快照文檔 |
//! | GET  | `/ledger/entries?limit&offset` | 賬本分頁（只讀，最新在前） |

use crate::approval::{Approval, ApprovalRequest};
use crate::comparison::ComparisonResult;
use crate::error::IntegrityError;
use crate::service::{IntegrityService, LedgerPage, StatusView};
use crate::snapshot::SignedSnapshot;
use axum::extract::{Query, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// API 錯誤
#[derive(Debug)]
pub struct ApiError(Arc<IntegrityError>);

impl From<IntegrityError> for ApiError {
    fn from(err: IntegrityError) -> Self {
        ApiError(Arc::new(err))
    }
}

impl From<Arc<IntegrityError>> for ApiError {
    fn from(err: Arc<IntegrityError>) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0.as_ref();
        let message = err.to_string();

        let (status, body) = match err {
            IntegrityError::NoAuditYet => (
                StatusCode::NOT_FOUND,
                json!({ "error": "no_audit_yet", "message": message }),
            ),
            IntegrityError::AuditIncomplete { failed } => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "audit_failed", "message": message, "failedSubjects": failed }),
            ),
            IntegrityError::Collection { subject, .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "collection_failed", "message": message, "subject": subject }),
            ),
            IntegrityError::SigningFailure(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "signing_failed", "message": message }),
            ),
            IntegrityError::ApprovedDigestMismatch {
                subject,
                observed,
                provided,
            } => (
                StatusCode::CONFLICT,
                json!({
                    "error": "digest_mismatch",
                    "message": message,
                    "subject": subject,
                    "observedDigest": observed,
                    "providedDigest": provided,
                }),
            ),
            IntegrityError::UnknownSubject(subject) => (
                StatusCode::NOT_FOUND,
                json!({ "error": "unknown_subject", "message": message, "subject": subject }),
            ),
            IntegrityError::InvalidIdentity(_) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "invalid_identity", "message": message }),
            ),
            IntegrityError::UnauthorizedApprover(_) => (
                StatusCode::FORBIDDEN,
                json!({ "error": "unauthorized_approver", "message": message }),
            ),
            IntegrityError::InvalidApproval(_) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "invalid_approval", "message": message }),
            ),
            IntegrityError::InvalidQuery(_) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "invalid_query", "message": message }),
            ),
            IntegrityError::InvalidSnapshot(_) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "invalid_snapshot", "message": message }),
            ),
            IntegrityError::PeerFetch(_) => (
                StatusCode::BAD_GATEWAY,
                json!({ "error": "peer_fetch_failed", "message": message }),
            ),
            IntegrityError::Config(_)
            | IntegrityError::Journal(_)
            | IntegrityError::Serialization(_)
            | IntegrityError::Io(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "internal_error", "message": message }),
            ),
        };

        (status, Json(body)).into_response()
    }
}

async fn auth_guard(
    State(token): State<Arc<String>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let provided = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|val| val.to_str().ok())
        .and_then(|val| val.strip_prefix("Bearer "));

    match provided {
        Some(value) if value == token.as_str() => Ok(next.run(req).await),
        _ => {
            warn!("Rejected admin request without valid bearer token");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// 構建路由
///
/// # 參數
///
/// - `service`: 完整性服務句柄
/// - `admin_token`: 審批接口的 Bearer token；`None` 表示不鑑權
pub fn build_router(service: Arc<IntegrityService>, admin_token: Option<String>) -> Router {
    let mut admin = Router::new().route("/supervision/approvals", post(approve));

    if let Some(token) = admin_token {
        info!("Admin auth enabled: Bearer token required for approvals");
        admin = admin.route_layer(from_fn_with_state(Arc::new(token), auth_guard));
    } else {
        warn!("Admin auth disabled: approvals accepted without a token");
    }

    Router::new()
        .route("/health", get(health))
        .route("/supervision/status", get(status))
        .route("/audit/generate", post(generate))
        .route("/audit/report", get(report))
        .route("/audit/compare", post(compare))
        .route("/ledger/entries", get(ledger_entries))
        .merge(admin)
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn health(State(service): State<Arc<IntegrityService>>) -> Json<Value> {
    Json(json!({ "status": "ok", "nodeIdentity": service.node_identity() }))
}

async fn status(State(service): State<Arc<IntegrityService>>) -> Json<StatusView> {
    Json(service.get_status().await)
}

async fn generate(State(service): State<Arc<IntegrityService>>) -> Result<Json<SignedSnapshot>, ApiError> {
    let snapshot = service.generate_audit().await?;
    Ok(Json(snapshot.as_ref().clone()))
}

async fn report(State(service): State<Arc<IntegrityService>>) -> Result<Json<SignedSnapshot>, ApiError> {
    let snapshot = service.latest_report().ok_or(IntegrityError::NoAuditYet)?;
    Ok(Json(snapshot.as_ref().clone()))
}

/// 賬本分頁參數
#[derive(Debug, Deserialize)]
struct PageParams {
    #[serde(default = "default_page_limit")]
    limit: u64,
    #[serde(default)]
    offset: u64,
}

fn default_page_limit() -> u64 {
    10
}

async fn ledger_entries(
    State(service): State<Arc<IntegrityService>>,
    Query(params): Query<PageParams>,
) -> Result<Json<LedgerPage>, ApiError> {
    Ok(Json(service.ledger_entries(params.limit, params.offset)?))
}

async fn approve(
    State(service): State<Arc<IntegrityService>>,
    Json(request): Json<ApprovalRequest>,
) -> Result<Json<Approval>, ApiError> {
    Ok(Json(service.approve(request).await?))
}

async fn compare(
    State(service): State<Arc<IntegrityService>>,
    Json(document): Json<Value>,
) -> Result<Json<ComparisonResult>, ApiError> {
    Ok(Json(service.compare_with(&document).await?))
}
