use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use serde::Deserialize;
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::extractors::CurrentUser;
use crate::ledger::{self, Plan};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct PurchaseRequest {
    pub plan: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/me", get(own_profile))
        .route("/users/{id}", get(public_profile))
        .route("/users/{id}/follow", post(toggle_follow_handler))
        .route("/subscription/purchase", post(purchase))
}

// -- Handlers --

async fn own_profile(State(state): State<AppState>, user: CurrentUser) -> AppResult<Response> {
    let conn = state.db.get()?;
    let row = conn
        .query_row(
            "SELECT username, email, is_admin, followers, following, points, \
                    premium_active, premium_expires, streak_current, streak_last_login, \
                    challenge_date, challenge_kind, challenge_target, challenge_progress, \
                    challenge_points, challenge_completed, created_at \
             FROM users WHERE id = ?1",
            params![user.id],
            |row| {
                Ok(json!({
                    "id": user.id,
                    "username": row.get::<_, String>(0)?,
                    "email": row.get::<_, String>(1)?,
                    "is_admin": row.get::<_, bool>(2)?,
                    "followers": row.get::<_, i64>(3)?,
                    "following": row.get::<_, i64>(4)?,
                    "points": row.get::<_, i64>(5)?,
                    "is_premium": ledger::is_premium(
                        row.get::<_, bool>(6)?,
                        row.get::<_, Option<String>>(7)?.as_deref(),
                        Utc::now(),
                    ),
                    "premium_expires": row.get::<_, Option<String>>(7)?,
                    "streak": row.get::<_, i64>(8)?,
                    "last_login": row.get::<_, Option<String>>(9)?,
                    "challenge": {
                        "date": row.get::<_, Option<String>>(10)?,
                        "kind": row.get::<_, Option<String>>(11)?,
                        "target": row.get::<_, i64>(12)?,
                        "progress": row.get::<_, i64>(13)?,
                        "points": row.get::<_, i64>(14)?,
                        "completed": row.get::<_, bool>(15)?,
                    },
                    "created_at": row.get::<_, String>(16)?,
                }))
            },
        )
        .optional()?;
    let Some(profile) = row else {
        return Err(AppError::NotFound);
    };
    Ok(Json(json!({ "success": true, "user": profile })).into_response())
}

async fn public_profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let conn = state.db.get()?;
    let row = conn
        .query_row(
            "SELECT username, followers, following, points, created_at \
             FROM users WHERE id = ?1",
            params![id],
            |row| {
                Ok(json!({
                    "id": id,
                    "username": row.get::<_, String>(0)?,
                    "followers": row.get::<_, i64>(1)?,
                    "following": row.get::<_, i64>(2)?,
                    "points": row.get::<_, i64>(3)?,
                    "created_at": row.get::<_, String>(4)?,
                }))
            },
        )
        .optional()?;
    let Some(profile) = row else {
        return Err(AppError::NotFound);
    };
    Ok(Json(json!({ "success": true, "user": profile })).into_response())
}

async fn toggle_follow_handler(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let mut conn = state.db.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let following = toggle_follow(&tx, &user.id, &id)?;
    tx.commit()?;

    Ok(Json(json!({ "success": true, "following": following })).into_response())
}

async fn purchase(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<PurchaseRequest>,
) -> AppResult<Response> {
    let plan = Plan::parse(&req.plan)?;

    let mut conn = state.db.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let receipt = ledger::purchase_subscription(&tx, &user.id, plan, Utc::now())?;
    tx.commit()?;

    Ok(Json(json!({
        "success": true,
        "balance": receipt.balance,
        "premium_expires": receipt.premium_expires,
    }))
    .into_response())
}

// -- Mutation helpers --

/// Toggle a follow edge; both denormalized counters move in the same
/// transaction as the membership row.
pub fn toggle_follow(tx: &Transaction, follower_id: &str, followed_id: &str) -> AppResult<bool> {
    if follower_id == followed_id {
        return Err(AppError::BadRequest("Cannot follow yourself".into()));
    }
    let exists: bool = tx.query_row(
        "SELECT COUNT(*) > 0 FROM users WHERE id = ?1",
        params![followed_id],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(AppError::NotFound);
    }

    let already: bool = tx.query_row(
        "SELECT COUNT(*) > 0 FROM follows WHERE follower_id = ?1 AND followed_id = ?2",
        params![follower_id, followed_id],
        |row| row.get(0),
    )?;

    if already {
        tx.execute(
            "DELETE FROM follows WHERE follower_id = ?1 AND followed_id = ?2",
            params![follower_id, followed_id],
        )?;
        tx.execute(
            "UPDATE users SET followers = MAX(followers - 1, 0) WHERE id = ?1",
            params![followed_id],
        )?;
        tx.execute(
            "UPDATE users SET following = MAX(following - 1, 0) WHERE id = ?1",
            params![follower_id],
        )?;
    } else {
        tx.execute(
            "INSERT INTO follows (follower_id, followed_id) VALUES (?1, ?2)",
            params![follower_id, followed_id],
        )?;
        tx.execute(
            "UPDATE users SET followers = followers + 1 WHERE id = ?1",
            params![followed_id],
        )?;
        tx.execute(
            "UPDATE users SET following = following + 1 WHERE id = ?1",
            params![follower_id],
        )?;
    }
    Ok(!already)
}
