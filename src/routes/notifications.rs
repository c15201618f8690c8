use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use serde::Deserialize;
use serde_json::json;

use crate::db::models::Notification;
use crate::error::{AppError, AppResult};
use crate::extractors::{AdminUser, CurrentUser};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateNotificationRequest {
    /// Recipient user id; omitted means every user.
    pub user_id: Option<String>,
    pub title: String,
    pub body: String,
    pub link: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/notifications",
            get(list_notifications).post(create_notification),
        )
        .route(
            "/notifications/{id}",
            axum::routing::delete(delete_notification),
        )
        .route("/notifications/{id}/read", post(mark_read))
}

/// Admin-only: notify a single user or broadcast to everyone.
async fn create_notification(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<CreateNotificationRequest>,
) -> AppResult<Response> {
    let title = req.title.trim().to_string();
    if title.is_empty() {
        return Err(AppError::BadRequest("Title cannot be empty".into()));
    }

    let mut conn = state.db.get()?;
    let recipients: Vec<String> = match req.user_id {
        Some(user_id) => {
            let exists: bool = conn.query_row(
                "SELECT COUNT(*) > 0 FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(AppError::NotFound);
            }
            vec![user_id]
        }
        None => {
            let mut stmt = conn.prepare("SELECT id FROM users")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            ids
        }
    };

    // A broadcast lands for every recipient or for none
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let created = insert_batch(&tx, &recipients, &title, req.body.trim(), req.link.as_deref())?;
    tx.commit()?;
    tracing::info!(created, "notifications sent");

    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "created": created })),
    )
        .into_response())
}

fn insert_batch(
    tx: &Transaction,
    recipients: &[String],
    title: &str,
    body: &str,
    link: Option<&str>,
) -> AppResult<usize> {
    for recipient in recipients {
        let id = uuid::Uuid::now_v7().to_string();
        tx.execute(
            "INSERT INTO notifications (id, user_id, title, body, link) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, recipient, title, body, link],
        )?;
    }
    Ok(recipients.len())
}

async fn list_notifications(
    State(state): State<AppState>,
    user: CurrentUser,
) -> AppResult<Response> {
    let conn = state.db.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, user_id, title, body, link, read, created_at FROM notifications \
         WHERE user_id = ?1 ORDER BY created_at DESC LIMIT 100",
    )?;
    let notifications: Vec<Notification> = stmt
        .query_map(params![user.id], |row| {
            Ok(Notification {
                id: row.get(0)?,
                user_id: row.get(1)?,
                title: row.get(2)?,
                body: row.get(3)?,
                link: row.get(4)?,
                read: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(Json(json!({ "success": true, "notifications": notifications })).into_response())
}

async fn mark_read(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let conn = state.db.get()?;
    let changed = conn.execute(
        "UPDATE notifications SET read = 1 WHERE id = ?1 AND user_id = ?2",
        params![id, user.id],
    )?;
    if changed == 0 {
        return Err(AppError::NotFound);
    }
    Ok(Json(json!({ "success": true })).into_response())
}

async fn delete_notification(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let conn = state.db.get()?;
    let recipient: Option<String> = conn
        .query_row(
            "SELECT user_id FROM notifications WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(recipient) = recipient else {
        return Err(AppError::NotFound);
    };
    if recipient != user.id && !user.is_admin {
        return Err(AppError::Unauthorized);
    }

    conn.execute("DELETE FROM notifications WHERE id = ?1", params![id])?;
    Ok(Json(json!({ "success": true })).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::state::DbPool;

    fn seed_users(pool: &DbPool, ids: &[&str]) {
        let conn = pool.get().unwrap();
        for id in ids {
            conn.execute(
                "INSERT INTO users (id, username, email, password_hash) \
                 VALUES (?1, ?1, ?1 || '@x.co', 'h')",
                params![id],
            )
            .unwrap();
        }
    }

    fn count(pool: &DbPool) -> i64 {
        let conn = pool.get().unwrap();
        conn.query_row("SELECT COUNT(*) FROM notifications", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn batch_inserts_one_row_per_recipient() {
        let pool = create_test_pool();
        seed_users(&pool, &["u1", "u2", "u3"]);
        let recipients: Vec<String> = vec!["u1".into(), "u2".into(), "u3".into()];

        let mut conn = pool.get().unwrap();
        let tx = conn.transaction().unwrap();
        let created = insert_batch(&tx, &recipients, "hello", "body", None).unwrap();
        tx.commit().unwrap();
        drop(conn);

        assert_eq!(created, 3);
        assert_eq!(count(&pool), 3);
    }

    #[test]
    fn failed_batch_leaves_no_partial_rows() {
        let pool = create_test_pool();
        seed_users(&pool, &["u1", "u2"]);
        // The middle recipient does not exist, so its insert fails
        let recipients: Vec<String> = vec!["u1".into(), "ghost".into(), "u2".into()];

        let mut conn = pool.get().unwrap();
        let tx = conn.transaction().unwrap();
        assert!(insert_batch(&tx, &recipients, "hello", "body", None).is_err());
        drop(tx);
        drop(conn);

        assert_eq!(count(&pool), 0);
    }
}
