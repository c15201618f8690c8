use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use rusqlite::params;
use serde::Deserialize;
use serde_json::json;

use crate::db::models::Bulletin;
use crate::error::{AppError, AppResult};
use crate::extractors::AdminUser;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateBulletinRequest {
    pub title: String,
    pub body: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/bulletins", get(list_bulletins).post(create_bulletin))
        .route("/bulletins/{id}", axum::routing::delete(delete_bulletin))
}

/// Site-wide announcements. Writes are admin-only, reads are public.
async fn create_bulletin(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Json(req): Json<CreateBulletinRequest>,
) -> AppResult<Response> {
    let title = req.title.trim().to_string();
    let body = req.body.trim().to_string();
    if title.is_empty() || body.is_empty() {
        return Err(AppError::BadRequest(
            "Bulletin title and body cannot be empty".into(),
        ));
    }

    let id = uuid::Uuid::now_v7().to_string();
    let conn = state.db.get()?;
    conn.execute(
        "INSERT INTO bulletins (id, author_id, title, body) VALUES (?1, ?2, ?3, ?4)",
        params![id, admin.id, title, body],
    )?;
    tracing::info!(bulletin = %id, "bulletin posted");

    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "id": id })),
    )
        .into_response())
}

async fn list_bulletins(State(state): State<AppState>) -> AppResult<Response> {
    let conn = state.db.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, author_id, title, body, created_at FROM bulletins \
         ORDER BY created_at DESC LIMIT 50",
    )?;
    let bulletins: Vec<Bulletin> = stmt
        .query_map([], |row| {
            Ok(Bulletin {
                id: row.get(0)?,
                author_id: row.get(1)?,
                title: row.get(2)?,
                body: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(Json(json!({ "success": true, "bulletins": bulletins })).into_response())
}

async fn delete_bulletin(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let conn = state.db.get()?;
    let removed = conn.execute("DELETE FROM bulletins WHERE id = ?1", params![id])?;
    if removed == 0 {
        return Err(AppError::NotFound);
    }
    Ok(Json(json!({ "success": true })).into_response())
}
