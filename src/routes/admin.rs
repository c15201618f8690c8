use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use rusqlite::TransactionBehavior;
use serde::Deserialize;
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::extractors::AdminUser;
use crate::ledger::{self, SubscriptionAction};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct AdjustPointsRequest {
    pub delta: i64,
}

#[derive(Deserialize)]
pub struct ManageSubscriptionRequest {
    /// "grant" or "revoke"
    pub action: String,
    pub days: Option<i64>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/users/{id}/points", post(adjust_points))
        .route(
            "/admin/users/{id}/subscription",
            post(manage_subscription),
        )
}

/// Admin override for a user's point balance. The balance floors at zero.
async fn adjust_points(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
    Json(req): Json<AdjustPointsRequest>,
) -> AppResult<Response> {
    let mut conn = state.db.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let balance = ledger::adjust_points(&tx, &id, req.delta)?;
    tx.commit()?;

    tracing::info!(admin = %admin.id, user = %id, delta = req.delta, "points adjusted");
    Ok(Json(json!({ "success": true, "balance": balance })).into_response())
}

/// Admin override for a user's subscription: grant stacks days like a
/// purchase (without the debit), revoke clears it.
async fn manage_subscription(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
    Json(req): Json<ManageSubscriptionRequest>,
) -> AppResult<Response> {
    let action = match req.action.as_str() {
        "grant" => SubscriptionAction::Grant {
            days: req
                .days
                .ok_or_else(|| AppError::BadRequest("Grant requires days".into()))?,
        },
        "revoke" => SubscriptionAction::Revoke,
        other => {
            return Err(AppError::BadRequest(format!(
                "Unknown subscription action: {}",
                other
            )))
        }
    };

    let mut conn = state.db.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let expires = ledger::manage_subscription(&tx, &id, action, Utc::now())?;
    tx.commit()?;

    tracing::info!(admin = %admin.id, user = %id, action = %req.action, "subscription managed");
    Ok(Json(json!({ "success": true, "premium_expires": expires })).into_response())
}
