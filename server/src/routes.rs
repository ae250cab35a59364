use axum::{
    extract::{Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use ledger::{Caller, ChainReport, DrainReport, EmitRequest, Emitter, InvoiceRecord, LedgerError};
use magic_link::{LinkConsumer, LinkWaiter, MagicLinkIssuer, MagicLinkRequest, SessionIssuer, WaitError};
use serde::Deserialize;
use serde_json::json;

#[derive(Clone)]
pub struct AppState {
    pub emitter: Emitter,
    pub issuer: MagicLinkIssuer,
    pub consumer: LinkConsumer,
    pub waiter: LinkWaiter,
    pub sessions: SessionIssuer,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/emitInvoice", post(emit_invoice))
        .route("/redriveQueue", post(redrive_queue))
        .route("/invoices", get(list_invoices))
        .route("/invoices/verify", get(verify_chain))
        .route("/sendMagicLinkEmail", post(send_magic_link))
        .route("/magicLinkHandler", get(magic_link_handler))
        .route("/waitForUserLinkClick", get(wait_for_link_click))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

/// Resolves the `Authorization: Bearer` session credential, if any.
fn caller(state: &AppState, headers: &HeaderMap) -> Option<Caller> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let credential = value.strip_prefix("Bearer ")?;
    match state.sessions.verify(credential, Utc::now()) {
        Ok(session) => Some(Caller::new(session.uid)),
        Err(err) => {
            tracing::debug!(error = %err, "bearer credential rejected");
            None
        }
    }
}

struct ApiError(LedgerError);

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LedgerError::Unauthenticated => StatusCode::UNAUTHORIZED,
            LedgerError::InvalidForm(_)
            | LedgerError::DuplicateInvoice(_)
            | LedgerError::UnknownInvoice(_)
            | LedgerError::NotCancellable(_) => StatusCode::BAD_REQUEST,
            _ => {
                tracing::error!(error = %self.0, "ledger request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "success": false, "error": self.0.to_string() }))).into_response()
    }
}

async fn emit_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<EmitRequest>,
) -> Response {
    let caller = caller(&state, &headers);
    let response = state.emitter.emit(caller.as_ref(), request).await;

    let status = if response.success {
        StatusCode::OK
    } else if caller.is_none() {
        StatusCode::UNAUTHORIZED
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(response)).into_response()
}

async fn redrive_queue(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<DrainReport>, ApiError> {
    let caller = caller(&state, &headers);
    Ok(Json(state.emitter.redrive(caller.as_ref()).await?))
}

async fn list_invoices(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<InvoiceRecord>>, ApiError> {
    let caller = caller(&state, &headers);
    Ok(Json(state.emitter.list(caller.as_ref())?))
}

async fn verify_chain(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ChainReport>, ApiError> {
    let caller = caller(&state, &headers);
    Ok(Json(state.emitter.verify(caller.as_ref())?))
}

async fn send_magic_link(
    State(state): State<AppState>,
    Json(request): Json<MagicLinkRequest>,
) -> Response {
    match state.issuer.send(request).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => {
            let status = if err.is_client_error() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, Json(json!({ "success": false, "error": err.to_string() }))).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct LinkParams {
    token: Option<String>,
}

async fn magic_link_handler(
    State(state): State<AppState>,
    Query(params): Query<LinkParams>,
) -> (StatusCode, String) {
    match state.consumer.consume(params.token.as_deref()).await {
        Ok(_) => (StatusCode::OK, "You may now return to the app".to_string()),
        Err(err) if err.is_client_error() => (StatusCode::BAD_REQUEST, err.to_string()),
        Err(err) => {
            tracing::error!(error = %err, "magic link redemption failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct WaitParams {
    email: Option<String>,
}

/// Long-polls until the link sent to `email` is clicked and hands the
/// session credential to the waiting client.
async fn wait_for_link_click(
    State(state): State<AppState>,
    Query(params): Query<WaitParams>,
) -> Response {
    let Some(email) = params.email.filter(|e| !e.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "Missing email address" })),
        )
            .into_response();
    };

    match state.waiter.wait(&email).await {
        Ok(session) => Json(json!({
            "success": true,
            "credential": session.credential,
            "uid": session.uid,
            "email": session.email,
            "role": session.role,
            "expiresAt": session.expires_at,
        }))
        .into_response(),
        Err(err) => {
            let status = match &err {
                WaitError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
                WaitError::Rejected(_) => StatusCode::UNAUTHORIZED,
                WaitError::Closed | WaitError::Store(_) => {
                    tracing::error!(error = %err, "sign-in wait failed");
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            (status, Json(json!({ "success": false, "error": err.to_string() }))).into_response()
        }
    }
}
