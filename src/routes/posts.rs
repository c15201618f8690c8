use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::Deserialize;
use serde_json::json;

use crate::db::models::Post;
use crate::error::{AppError, AppResult};
use crate::extractors::{CurrentUser, MaybeUser};
use crate::ledger::{self, AwardOutcome, PointEvent};
use crate::state::AppState;
use crate::trending;

// -- Request types --

#[derive(Deserialize)]
pub struct CreatePostRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub content: String,
    pub cover_image: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub premium_only: bool,
    #[serde(default)]
    pub early_access: bool,
    pub trending_position: Option<i64>,
}

#[derive(Deserialize, Default)]
pub struct UpdatePostRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub cover_image: Option<String>,
    pub tags: Option<Vec<String>>,
    pub premium_only: Option<bool>,
    pub early_access: Option<bool>,
    /// `Some(false)` withdraws the post from the trending set.
    pub trending: Option<bool>,
    /// Requested slot; re-runs the shift pass even if unchanged.
    pub trending_position: Option<i64>,
}

// -- Router --

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/posts", get(list_posts).post(create_post))
        .route("/posts/trending", get(list_trending))
        .route(
            "/posts/{id}",
            get(get_post).put(update_post).delete(delete_post),
        )
        .route("/posts/{id}/read", post(claim_read))
}

// -- Handlers --

async fn create_post(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<CreatePostRequest>,
) -> AppResult<Response> {
    let title = req.title.trim().to_string();
    if title.is_empty() {
        return Err(AppError::BadRequest("Title cannot be empty".into()));
    }
    if req.content.trim().is_empty() {
        return Err(AppError::BadRequest("Content cannot be empty".into()));
    }
    if let Some(position) = req.trending_position {
        trending::validate_position(position)?;
    }

    let slug = generate_slug(&title);
    let tags = serde_json::to_string(&req.tags)?;
    let read_time = estimate_read_time(&req.content);

    {
        let mut conn = state.db.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO posts (id, author_id, title, description, content, cover_image, \
             tags, read_time, premium_only, early_access) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                slug,
                user.id,
                title,
                req.description.trim(),
                req.content,
                req.cover_image,
                tags,
                read_time,
                req.premium_only,
                req.early_access,
            ],
        )?;
        if let Some(position) = req.trending_position {
            trending::assign(&tx, &slug, position)?;
        }
        tx.commit()?;
    }
    tracing::info!(post = %slug, author = %user.id, "post created");

    let post = fetch_post(&state, &slug)?.ok_or(AppError::NotFound)?;
    Ok((StatusCode::CREATED, Json(json!({ "success": true, "post": post }))).into_response())
}

async fn update_post(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
    Json(req): Json<UpdatePostRequest>,
) -> AppResult<Response> {
    if let Some(position) = req.trending_position {
        trending::validate_position(position)?;
    }
    if req.trending == Some(true) && req.trending_position.is_none() {
        return Err(AppError::BadRequest(
            "Marking a post trending requires a position".into(),
        ));
    }

    {
        let mut conn = state.db.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row: Option<(String, bool)> = tx
            .query_row(
                "SELECT author_id, trending FROM posts WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((author_id, was_trending)) = row else {
            return Err(AppError::NotFound);
        };
        if author_id != user.id && !user.is_admin {
            return Err(AppError::Unauthorized);
        }

        if let Some(ref title) = req.title {
            if title.trim().is_empty() {
                return Err(AppError::BadRequest("Title cannot be empty".into()));
            }
            tx.execute(
                "UPDATE posts SET title = ?1 WHERE id = ?2",
                params![title.trim(), id],
            )?;
        }
        if let Some(ref description) = req.description {
            tx.execute(
                "UPDATE posts SET description = ?1 WHERE id = ?2",
                params![description.trim(), id],
            )?;
        }
        if let Some(ref content) = req.content {
            if content.trim().is_empty() {
                return Err(AppError::BadRequest("Content cannot be empty".into()));
            }
            tx.execute(
                "UPDATE posts SET content = ?1, read_time = ?2 WHERE id = ?3",
                params![content, estimate_read_time(content), id],
            )?;
        }
        if let Some(ref cover_image) = req.cover_image {
            tx.execute(
                "UPDATE posts SET cover_image = ?1 WHERE id = ?2",
                params![cover_image, id],
            )?;
        }
        if let Some(ref tags) = req.tags {
            tx.execute(
                "UPDATE posts SET tags = ?1 WHERE id = ?2",
                params![serde_json::to_string(tags)?, id],
            )?;
        }
        if let Some(premium_only) = req.premium_only {
            tx.execute(
                "UPDATE posts SET premium_only = ?1 WHERE id = ?2",
                params![premium_only, id],
            )?;
        }
        if let Some(early_access) = req.early_access {
            tx.execute(
                "UPDATE posts SET early_access = ?1 WHERE id = ?2",
                params![early_access, id],
            )?;
        }

        // Trending transitions run inside the same transaction as the edits
        if req.trending == Some(false) {
            trending::withdraw(&tx, &id)?;
        } else if let Some(position) = req.trending_position {
            if was_trending {
                trending::reposition(&tx, &id, position)?;
            } else {
                trending::assign(&tx, &id, position)?;
            }
        }

        tx.execute(
            "UPDATE posts SET updated_at = datetime('now') WHERE id = ?1",
            params![id],
        )?;
        tx.commit()?;
    }

    let post = fetch_post(&state, &id)?.ok_or(AppError::NotFound)?;
    Ok(Json(json!({ "success": true, "post": post })).into_response())
}

async fn delete_post(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let mut conn = state.db.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let author_id: Option<String> = tx
        .query_row(
            "SELECT author_id FROM posts WHERE id = ?1",
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

    // Close the trending gap before the row disappears
    trending::withdraw(&tx, &id)?;
    tx.execute("DELETE FROM posts WHERE id = ?1", params![id])?;
    tx.commit()?;

    tracing::info!(post = %id, "post deleted");
    Ok(Json(json!({ "success": true })).into_response())
}

async fn list_posts(State(state): State<AppState>) -> AppResult<Response> {
    let conn = state.db.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM posts ORDER BY created_at DESC LIMIT 50",
        POST_COLUMNS
    ))?;
    let posts: Vec<Post> = stmt
        .query_map([], post_from_row)?
        .filter_map(|r| r.ok())
        .map(redact_gated)
        .collect();
    Ok(Json(json!({ "success": true, "posts": posts })).into_response())
}

async fn list_trending(State(state): State<AppState>) -> AppResult<Response> {
    let now = Utc::now().to_rfc3339();
    let conn = state.db.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM posts WHERE trending = 1 AND (trending_until IS NULL OR trending_until > ?1) \
         ORDER BY trending_position",
        POST_COLUMNS
    ))?;
    let posts: Vec<Post> = stmt
        .query_map(params![now], post_from_row)?
        .filter_map(|r| r.ok())
        .map(redact_gated)
        .collect();
    Ok(Json(json!({ "success": true, "posts": posts })).into_response())
}

async fn get_post(
    State(state): State<AppState>,
    MaybeUser(user): MaybeUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let post = fetch_post(&state, &id)?.ok_or(AppError::NotFound)?;

    if (post.premium_only || post.early_access)
        && !viewer_may_read_premium(&state, user.as_ref(), &post.author_id)?
    {
        return Err(AppError::Forbidden(
            "This post requires an active Glare+ subscription".into(),
        ));
    }

    Ok(Json(json!({ "success": true, "post": post })).into_response())
}

/// POST /posts/{id}/read — claim the five-minute-read award for this post.
/// One claim per (user, post), durable across restarts.
async fn claim_read(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let exists: bool = {
        let conn = state.db.get()?;
        conn.query_row(
            "SELECT COUNT(*) > 0 FROM posts WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?
    };
    if !exists {
        return Err(AppError::NotFound);
    }

    let mut conn = state.db.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let outcome = ledger::award_points(
        &tx,
        &user.id,
        PointEvent::ReadFiveMinutes,
        Some(&id),
        Utc::now().date_naive(),
    )?;
    tx.commit()?;

    match outcome {
        AwardOutcome::Awarded {
            points,
            challenge_completed,
        } => Ok(Json(json!({
            "success": true,
            "points_awarded": points,
            "challenge_completed": challenge_completed,
        }))
        .into_response()),
        AwardOutcome::Duplicate => Ok(Json(json!({
            "success": true,
            "points_awarded": 0,
            "duplicate": true,
        }))
        .into_response()),
    }
}

// -- Query helpers --

const POST_COLUMNS: &str = "id, author_id, title, description, content, cover_image, tags, \
     read_time, premium_only, early_access, trending, trending_position, trending_until, \
     likes, created_at, updated_at";

fn post_from_row(row: &rusqlite::Row) -> Result<Post, rusqlite::Error> {
    let tags_json: String = row.get(6)?;
    Ok(Post {
        id: row.get(0)?,
        author_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        content: row.get(4)?,
        cover_image: row.get(5)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        read_time: row.get(7)?,
        premium_only: row.get(8)?,
        early_access: row.get(9)?,
        trending: row.get(10)?,
        trending_position: row.get(11)?,
        trending_until: row.get(12)?,
        likes: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

pub fn fetch_post(state: &AppState, id: &str) -> AppResult<Option<Post>> {
    let conn = state.db.get()?;
    let post = conn
        .query_row(
            &format!("SELECT {} FROM posts WHERE id = ?1", POST_COLUMNS),
            params![id],
            post_from_row,
        )
        .optional()?;
    Ok(post)
}

/// List views never carry gated content; the single-post read enforces
/// the subscription check.
fn redact_gated(mut post: Post) -> Post {
    if post.premium_only || post.early_access {
        post.content = String::new();
    }
    post
}

fn viewer_may_read_premium(
    state: &AppState,
    user: Option<&CurrentUser>,
    author_id: &str,
) -> AppResult<bool> {
    let Some(user) = user else {
        return Ok(false);
    };
    if user.is_admin || user.id == author_id {
        return Ok(true);
    }
    let conn = state.db.get()?;
    let (active, expires): (bool, Option<String>) = conn.query_row(
        "SELECT premium_active, premium_expires FROM users WHERE id = ?1",
        params![user.id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(ledger::is_premium(active, expires.as_deref(), Utc::now()))
}

/// Slug = slugified title + short uniquifier so titles never collide.
fn generate_slug(title: &str) -> String {
    let base: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let base: String = base
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let base = if base.is_empty() {
        "post".to_string()
    } else {
        base.chars().take(48).collect()
    };

    let suffix = uuid::Uuid::now_v7().simple().to_string();
    format!("{}-{}", base, &suffix[..6])
}

fn estimate_read_time(content: &str) -> i64 {
    let words = content.split_whitespace().count() as i64;
    (words / 200).max(1)
}
