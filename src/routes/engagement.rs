use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use rusqlite::{params, Transaction, TransactionBehavior};
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::extractors::CurrentUser;
use crate::ledger::{self, PointEvent};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/posts/{id}/like", post(toggle_post_like_handler))
        .route("/posts/{id}/bookmark", post(toggle_bookmark_handler))
        .route("/comments/{id}/like", post(toggle_comment_like_handler))
}

// -- Handlers --

async fn toggle_post_like_handler(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let mut conn = state.db.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let (liked, likes) = toggle_post_like(&tx, &user.id, &id)?;
    tx.commit()?;

    Ok(Json(json!({ "success": true, "liked": liked, "likes": likes })).into_response())
}

async fn toggle_comment_like_handler(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let mut conn = state.db.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let (liked, likes) = toggle_comment_like(&tx, &user.id, &id)?;
    tx.commit()?;

    Ok(Json(json!({ "success": true, "liked": liked, "likes": likes })).into_response())
}

async fn toggle_bookmark_handler(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let mut conn = state.db.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let bookmarked = toggle_bookmark(&tx, &user.id, &id)?;
    tx.commit()?;

    Ok(Json(json!({ "success": true, "bookmarked": bookmarked })).into_response())
}

// -- Mutation helpers --

/// Toggle the caller's like on a post. Direction comes from the membership
/// row, and the row, the count, and the point award commit together.
/// Points go to the liker on the like direction only.
pub fn toggle_post_like(tx: &Transaction, user_id: &str, post_id: &str) -> AppResult<(bool, i64)> {
    let exists: bool = tx.query_row(
        "SELECT COUNT(*) > 0 FROM posts WHERE id = ?1",
        params![post_id],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(AppError::NotFound);
    }

    let already: bool = tx.query_row(
        "SELECT COUNT(*) > 0 FROM post_likes WHERE user_id = ?1 AND post_id = ?2",
        params![user_id, post_id],
        |row| row.get(0),
    )?;

    if already {
        tx.execute(
            "DELETE FROM post_likes WHERE user_id = ?1 AND post_id = ?2",
            params![user_id, post_id],
        )?;
        tx.execute(
            "UPDATE posts SET likes = likes - 1 WHERE id = ?1",
            params![post_id],
        )?;
    } else {
        tx.execute(
            "INSERT INTO post_likes (user_id, post_id) VALUES (?1, ?2)",
            params![user_id, post_id],
        )?;
        tx.execute(
            "UPDATE posts SET likes = likes + 1 WHERE id = ?1",
            params![post_id],
        )?;
        ledger::award_points(
            tx,
            user_id,
            PointEvent::LikeGiven,
            None,
            Utc::now().date_naive(),
        )?;
    }

    let likes: i64 = tx.query_row(
        "SELECT likes FROM posts WHERE id = ?1",
        params![post_id],
        |row| row.get(0),
    )?;
    Ok((!already, likes))
}

/// Toggle the caller's like on a comment. No point award, and the count
/// never drops below zero.
pub fn toggle_comment_like(
    tx: &Transaction,
    user_id: &str,
    comment_id: &str,
) -> AppResult<(bool, i64)> {
    let exists: bool = tx.query_row(
        "SELECT COUNT(*) > 0 FROM comments WHERE id = ?1",
        params![comment_id],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(AppError::NotFound);
    }

    let already: bool = tx.query_row(
        "SELECT COUNT(*) > 0 FROM comment_likes WHERE user_id = ?1 AND comment_id = ?2",
        params![user_id, comment_id],
        |row| row.get(0),
    )?;

    if already {
        tx.execute(
            "DELETE FROM comment_likes WHERE user_id = ?1 AND comment_id = ?2",
            params![user_id, comment_id],
        )?;
        tx.execute(
            "UPDATE comments SET likes = MAX(likes - 1, 0) WHERE id = ?1",
            params![comment_id],
        )?;
    } else {
        tx.execute(
            "INSERT INTO comment_likes (user_id, comment_id) VALUES (?1, ?2)",
            params![user_id, comment_id],
        )?;
        tx.execute(
            "UPDATE comments SET likes = likes + 1 WHERE id = ?1",
            params![comment_id],
        )?;
    }

    let likes: i64 = tx.query_row(
        "SELECT likes FROM comments WHERE id = ?1",
        params![comment_id],
        |row| row.get(0),
    )?;
    Ok((!already, likes))
}

/// Bookmarks are membership-only: no count, no points.
pub fn toggle_bookmark(tx: &Transaction, user_id: &str, post_id: &str) -> AppResult<bool> {
    let exists: bool = tx.query_row(
        "SELECT COUNT(*) > 0 FROM posts WHERE id = ?1",
        params![post_id],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(AppError::NotFound);
    }

    let already: bool = tx.query_row(
        "SELECT COUNT(*) > 0 FROM bookmarks WHERE user_id = ?1 AND post_id = ?2",
        params![user_id, post_id],
        |row| row.get(0),
    )?;

    if already {
        tx.execute(
            "DELETE FROM bookmarks WHERE user_id = ?1 AND post_id = ?2",
            params![user_id, post_id],
        )?;
    } else {
        tx.execute(
            "INSERT INTO bookmarks (user_id, post_id) VALUES (?1, ?2)",
            params![user_id, post_id],
        )?;
    }
    Ok(!already)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::state::DbPool;

    fn seed(pool: &DbPool) {
        let conn = pool.get().unwrap();
        conn.execute(
            "INSERT INTO users (id, username, email, password_hash) VALUES ('u1', 'a', 'a@x.co', 'h')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO posts (id, author_id, title, content) VALUES ('p1', 'u1', 't', 'c')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO comments (id, post_id, author_id, body) VALUES ('c1', 'p1', 'u1', 'hi')",
            [],
        )
        .unwrap();
    }

    fn with_tx<T>(pool: &DbPool, f: impl FnOnce(&Transaction) -> T) -> T {
        let mut conn = pool.get().unwrap();
        let tx = conn.transaction().unwrap();
        let out = f(&tx);
        tx.commit().unwrap();
        out
    }

    fn user_points(pool: &DbPool) -> i64 {
        let conn = pool.get().unwrap();
        conn.query_row("SELECT points FROM users WHERE id = 'u1'", [], |row| {
            row.get(0)
        })
        .unwrap()
    }

    #[test]
    fn like_then_unlike_post_round_trips() {
        let pool = create_test_pool();
        seed(&pool);

        let (liked, likes) = with_tx(&pool, |tx| toggle_post_like(tx, "u1", "p1").unwrap());
        assert!(liked);
        assert_eq!(likes, 1);
        // Like direction awards points to the liker
        assert_eq!(user_points(&pool), 2);

        let (liked, likes) = with_tx(&pool, |tx| toggle_post_like(tx, "u1", "p1").unwrap());
        assert!(!liked);
        assert_eq!(likes, 0);
        // No award clawback on unlike
        assert_eq!(user_points(&pool), 2);
    }

    #[test]
    fn comment_like_awards_no_points() {
        let pool = create_test_pool();
        seed(&pool);
        let (liked, likes) = with_tx(&pool, |tx| toggle_comment_like(tx, "u1", "c1").unwrap());
        assert!(liked);
        assert_eq!(likes, 1);
        assert_eq!(user_points(&pool), 0);
    }

    #[test]
    fn comment_likes_never_drop_below_zero() {
        let pool = create_test_pool();
        seed(&pool);
        // Seed a membership row without a matching count (drifted state)
        {
            let conn = pool.get().unwrap();
            conn.execute(
                "INSERT INTO comment_likes (user_id, comment_id) VALUES ('u1', 'c1')",
                [],
            )
            .unwrap();
        }

        let (liked, likes) = with_tx(&pool, |tx| toggle_comment_like(tx, "u1", "c1").unwrap());
        assert!(!liked);
        assert_eq!(likes, 0);
    }

    #[test]
    fn bookmark_toggles_membership_only() {
        let pool = create_test_pool();
        seed(&pool);
        assert!(with_tx(&pool, |tx| toggle_bookmark(tx, "u1", "p1").unwrap()));
        assert!(!with_tx(&pool, |tx| toggle_bookmark(tx, "u1", "p1").unwrap()));
        assert_eq!(user_points(&pool), 0);
    }

    #[test]
    fn toggles_on_missing_targets_are_not_found() {
        let pool = create_test_pool();
        seed(&pool);
        let mut conn = pool.get().unwrap();
        let tx = conn.transaction().unwrap();
        assert!(matches!(
            toggle_post_like(&tx, "u1", "ghost"),
            Err(AppError::NotFound)
        ));
        assert!(matches!(
            toggle_comment_like(&tx, "u1", "ghost"),
            Err(AppError::NotFound)
        ));
        assert!(matches!(
            toggle_bookmark(&tx, "u1", "ghost"),
            Err(AppError::NotFound)
        ));
    }
}
