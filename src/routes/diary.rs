use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use rusqlite::{params, OptionalExtension};
use serde::Deserialize;
use serde_json::json;

use crate::db::models::DiaryEntry;
use crate::error::{AppError, AppResult};
use crate::extractors::CurrentUser;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateDiaryRequest {
    pub title: String,
    pub body: String,
    pub mood: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/diary", get(list_entries).post(create_entry))
        .route("/diary/{id}", axum::routing::delete(delete_entry))
}

/// Diary entries are private: only ever visible to their author.
async fn create_entry(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<CreateDiaryRequest>,
) -> AppResult<Response> {
    let title = req.title.trim().to_string();
    let body = req.body.trim().to_string();
    if title.is_empty() || body.is_empty() {
        return Err(AppError::BadRequest(
            "Diary title and body cannot be empty".into(),
        ));
    }

    let id = uuid::Uuid::now_v7().to_string();
    let conn = state.db.get()?;
    conn.execute(
        "INSERT INTO diary_entries (id, author_id, title, body, mood) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, user.id, title, body, req.mood],
    )?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "id": id })),
    )
        .into_response())
}

async fn list_entries(State(state): State<AppState>, user: CurrentUser) -> AppResult<Response> {
    let conn = state.db.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, author_id, title, body, mood, created_at FROM diary_entries \
         WHERE author_id = ?1 ORDER BY created_at DESC",
    )?;
    let entries: Vec<DiaryEntry> = stmt
        .query_map(params![user.id], |row| {
            Ok(DiaryEntry {
                id: row.get(0)?,
                author_id: row.get(1)?,
                title: row.get(2)?,
                body: row.get(3)?,
                mood: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(Json(json!({ "success": true, "entries": entries })).into_response())
}

async fn delete_entry(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let conn = state.db.get()?;
    let author_id: Option<String> = conn
        .query_row(
            "SELECT author_id FROM diary_entries WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(author_id) = author_id else {
        return Err(AppError::NotFound);
    };
    if author_id != user.id {
        return Err(AppError::Unauthorized);
    }

    conn.execute("DELETE FROM diary_entries WHERE id = ?1", params![id])?;
    Ok(Json(json!({ "success": true })).into_response())
}
