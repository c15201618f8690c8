use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use serde::Deserialize;
use serde_json::json;

use crate::db::models::Comment;
use crate::error::{AppError, AppResult};
use crate::extractors::{AdminUser, CurrentUser};
use crate::ledger::{self, PointEvent};
use crate::state::AppState;

// -- Request types --

#[derive(Deserialize)]
pub struct CreateCommentRequest {
    pub body: String,
    pub parent_id: Option<String>,
}

#[derive(Deserialize)]
pub struct EditCommentRequest {
    pub body: String,
}

// -- Router --

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/posts/{id}/comments",
            axum::routing::get(list_comments).post(create_comment),
        )
        .route(
            "/comments/{id}",
            axum::routing::put(edit_comment).delete(delete_comment),
        )
        .route("/comments/{id}/pin", post(toggle_pin))
        .route("/comments/{id}/highlight", post(toggle_highlight))
}

// -- Handlers --

async fn create_comment(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(post_id): Path<String>,
    Json(req): Json<CreateCommentRequest>,
) -> AppResult<Response> {
    let body = req.body.trim().to_string();
    if body.is_empty() {
        return Err(AppError::BadRequest("Comment cannot be empty".into()));
    }
    if body.len() > 2000 {
        return Err(AppError::BadRequest(
            "Comment must be 2000 characters or less".into(),
        ));
    }

    let comment_id = uuid::Uuid::now_v7().to_string();
    {
        let mut conn = state.db.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        insert_comment(
            &tx,
            &comment_id,
            &post_id,
            &user.id,
            req.parent_id.as_deref(),
            &body,
        )?;
        // The comment award rides the insert transaction
        ledger::award_points(
            &tx,
            &user.id,
            PointEvent::CommentPosted,
            None,
            Utc::now().date_naive(),
        )?;
        tx.commit()?;
    }

    let comment = fetch_comment(&state, &comment_id)?.ok_or(AppError::NotFound)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "comment": comment })),
    )
        .into_response())
}

async fn list_comments(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
) -> AppResult<Response> {
    let conn = state.db.get()?;
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM posts WHERE id = ?1",
        params![post_id],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(AppError::NotFound);
    }

    // Pinned before unpinned, newest-first within each group
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM comments WHERE post_id = ?1 \
         ORDER BY pinned DESC, created_at DESC",
        COMMENT_COLUMNS
    ))?;
    let comments: Vec<Comment> = stmt
        .query_map(params![post_id], comment_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(Json(json!({ "success": true, "comments": comments })).into_response())
}

async fn edit_comment(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
    Json(req): Json<EditCommentRequest>,
) -> AppResult<Response> {
    let body = req.body.trim().to_string();
    if body.is_empty() {
        return Err(AppError::BadRequest("Comment cannot be empty".into()));
    }

    {
        let conn = state.db.get()?;
        let author_id: Option<String> = conn
            .query_row(
                "SELECT author_id FROM comments WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(author_id) = author_id else {
            return Err(AppError::NotFound);
        };
        if author_id != user.id && !user.is_admin {
            return Err(AppError::Unauthorized);
        }
        conn.execute(
            "UPDATE comments SET body = ?1, edited = 1 WHERE id = ?2",
            params![body, id],
        )?;
    }

    let comment = fetch_comment(&state, &id)?.ok_or(AppError::NotFound)?;
    Ok(Json(json!({ "success": true, "comment": comment })).into_response())
}

async fn delete_comment(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let mut conn = state.db.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let author_id: Option<String> = tx
        .query_row(
            "SELECT author_id FROM comments WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(author_id) = author_id else {
        return Err(AppError::NotFound);
    };
    if author_id != user.id && !user.is_admin {
        return Err(AppError::Unauthorized);
    }

    let removed = delete_comment_cascade(&tx, &id)?;
    tx.commit()?;

    tracing::info!(comment = %id, removed, "comment deleted");
    Ok(Json(json!({ "success": true, "removed": removed })).into_response())
}

async fn toggle_pin(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    toggle_flag(&state, &id, "pinned").await
}

async fn toggle_highlight(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    toggle_flag(&state, &id, "highlighted").await
}

async fn toggle_flag(state: &AppState, id: &str, column: &str) -> AppResult<Response> {
    let conn = state.db.get()?;
    let changed = conn.execute(
        // column name is a compile-time constant, never caller input
        &format!("UPDATE comments SET {col} = NOT {col} WHERE id = ?1", col = column),
        params![id],
    )?;
    if changed == 0 {
        return Err(AppError::NotFound);
    }
    let value: bool = conn.query_row(
        &format!("SELECT {} FROM comments WHERE id = ?1", column),
        params![id],
        |row| row.get(0),
    )?;
    Ok(Json(json!({ "success": true, (column): value })).into_response())
}

// -- Mutation helpers --

/// Insert a comment, enforcing the two-level threading rule: a reply's
/// parent must be a top-level comment on the same post.
pub fn insert_comment(
    tx: &Transaction,
    id: &str,
    post_id: &str,
    author_id: &str,
    parent_id: Option<&str>,
    body: &str,
) -> AppResult<()> {
    let post_exists: bool = tx.query_row(
        "SELECT COUNT(*) > 0 FROM posts WHERE id = ?1",
        params![post_id],
        |row| row.get(0),
    )?;
    if !post_exists {
        return Err(AppError::NotFound);
    }

    if let Some(parent) = parent_id {
        let parent_row: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT post_id, parent_id FROM comments WHERE id = ?1",
                params![parent],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((parent_post, parent_parent)) = parent_row else {
            return Err(AppError::BadRequest("Parent comment not found".into()));
        };
        if parent_post != post_id {
            return Err(AppError::BadRequest(
                "Parent comment belongs to another post".into(),
            ));
        }
        if parent_parent.is_some() {
            return Err(AppError::BadRequest("Replies cannot be nested".into()));
        }
    }

    tx.execute(
        "INSERT INTO comments (id, post_id, author_id, parent_id, body) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, post_id, author_id, parent_id, body],
    )?;
    Ok(())
}

/// Delete a comment and, when it is top-level, every direct reply.
/// Returns the number of rows removed.
pub fn delete_comment_cascade(tx: &Transaction, id: &str) -> AppResult<usize> {
    let removed = tx.execute(
        "DELETE FROM comments WHERE id = ?1 OR parent_id = ?1",
        params![id],
    )?;
    Ok(removed)
}

// -- Query helpers --

const COMMENT_COLUMNS: &str =
    "id, post_id, author_id, parent_id, body, likes, highlighted, pinned, edited, created_at";

fn comment_from_row(row: &rusqlite::Row) -> Result<Comment, rusqlite::Error> {
    Ok(Comment {
        id: row.get(0)?,
        post_id: row.get(1)?,
        author_id: row.get(2)?,
        parent_id: row.get(3)?,
        body: row.get(4)?,
        likes: row.get(5)?,
        highlighted: row.get(6)?,
        pinned: row.get(7)?,
        edited: row.get(8)?,
        created_at: row.get(9)?,
    })
}

pub fn fetch_comment(state: &AppState, id: &str) -> AppResult<Option<Comment>> {
    let conn = state.db.get()?;
    let comment = conn
        .query_row(
            &format!("SELECT {} FROM comments WHERE id = ?1", COMMENT_COLUMNS),
            params![id],
            comment_from_row,
        )
        .optional()?;
    Ok(comment)
}
