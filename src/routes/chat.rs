use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;

use crate::db::models::ChatMessage;
use crate::error::{AppError, AppResult};
use crate::extractors::CurrentUser;
use crate::ledger;
use crate::state::AppState;

/// The Glare+ members' room.
pub const PREMIUM_ROOM: &str = "premium";

/// Prefix for one-user support rooms (`support:{user_id}`).
pub const SUPPORT_PREFIX: &str = "support:";

// -- Request types --

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub body: String,
}

#[derive(Deserialize)]
pub struct EditMessageRequest {
    pub body: String,
}

#[derive(Deserialize)]
pub struct ReactionRequest {
    pub emoji: String,
}

#[derive(Deserialize, Default)]
pub struct ListParams {
    pub limit: Option<i64>,
    /// Return messages created strictly before this timestamp.
    pub before: Option<String>,
}

// -- Router --

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/chat/{room}/messages",
            axum::routing::get(list_messages).post(send_message),
        )
        .route(
            "/chat/messages/{id}",
            axum::routing::put(edit_message).delete(delete_message),
        )
        .route("/chat/messages/{id}/reactions", post(toggle_reaction))
}

// -- Room access --

/// Room membership rules: the premium room needs an active subscription,
/// a support room belongs to exactly one user. Admins enter everywhere.
fn check_room_access(state: &AppState, user: &CurrentUser, room: &str) -> AppResult<()> {
    if user.is_admin {
        return Ok(());
    }
    if room == PREMIUM_ROOM {
        let conn = state.db.get()?;
        let (active, expires): (bool, Option<String>) = conn.query_row(
            "SELECT premium_active, premium_expires FROM users WHERE id = ?1",
            params![user.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if !ledger::is_premium(active, expires.as_deref(), Utc::now()) {
            return Err(AppError::Forbidden(
                "The premium chat requires an active Glare+ subscription".into(),
            ));
        }
        return Ok(());
    }
    if let Some(owner) = room.strip_prefix(SUPPORT_PREFIX) {
        if owner != user.id {
            return Err(AppError::Forbidden("Not your support chat".into()));
        }
        return Ok(());
    }
    Err(AppError::BadRequest(format!("Unknown chat room: {}", room)))
}

// -- Handlers --

async fn send_message(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(room): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> AppResult<Response> {
    check_room_access(&state, &user, &room)?;
    let body = req.body.trim().to_string();
    if body.is_empty() {
        return Err(AppError::BadRequest("Message cannot be empty".into()));
    }
    if body.len() > 1000 {
        return Err(AppError::BadRequest(
            "Message must be 1000 characters or less".into(),
        ));
    }

    let id = uuid::Uuid::now_v7().to_string();
    {
        let conn = state.db.get()?;
        conn.execute(
            "INSERT INTO chat_messages (id, room, user_id, body) VALUES (?1, ?2, ?3, ?4)",
            params![id, room, user.id, body],
        )?;
    }

    let message = fetch_message(&state, &id)?.ok_or(AppError::NotFound)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "message": message })),
    )
        .into_response())
}

async fn list_messages(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(room): Path<String>,
    Query(params_in): Query<ListParams>,
) -> AppResult<Response> {
    check_room_access(&state, &user, &room)?;
    let limit = params_in.limit.unwrap_or(50).clamp(1, 200);

    let conn = state.db.get()?;
    let mut messages: Vec<ChatMessage> = match params_in.before {
        Some(before) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM chat_messages WHERE room = ?1 AND created_at < ?2 \
                 ORDER BY created_at DESC LIMIT ?3",
                MESSAGE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![room, before, limit], message_from_row)?;
            rows.filter_map(|r| r.ok()).collect()
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM chat_messages WHERE room = ?1 \
                 ORDER BY created_at DESC LIMIT ?2",
                MESSAGE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![room, limit], message_from_row)?;
            rows.filter_map(|r| r.ok()).collect()
        }
    };
    // Oldest first for rendering
    messages.reverse();

    Ok(Json(json!({ "success": true, "messages": messages })).into_response())
}

async fn edit_message(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
    Json(req): Json<EditMessageRequest>,
) -> AppResult<Response> {
    let body = req.body.trim().to_string();
    if body.is_empty() {
        return Err(AppError::BadRequest("Message cannot be empty".into()));
    }

    let row: Option<(String, String)> = {
        let conn = state.db.get()?;
        conn.query_row(
            "SELECT user_id, room FROM chat_messages WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
    };
    let Some((sender_id, room)) = row else {
        return Err(AppError::NotFound);
    };
    // Room access still applies: a lapsed subscriber loses write access to
    // their old premium-room messages
    check_room_access(&state, &user, &room)?;
    // Only the sender may edit; admins delete, they do not rewrite
    if sender_id != user.id {
        return Err(AppError::Unauthorized);
    }

    {
        let conn = state.db.get()?;
        conn.execute(
            "UPDATE chat_messages SET body = ?1, edited = 1 WHERE id = ?2",
            params![body, id],
        )?;
    }

    let message = fetch_message(&state, &id)?.ok_or(AppError::NotFound)?;
    Ok(Json(json!({ "success": true, "message": message })).into_response())
}

async fn delete_message(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let row: Option<(String, String)> = {
        let conn = state.db.get()?;
        conn.query_row(
            "SELECT user_id, room FROM chat_messages WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
    };
    let Some((sender_id, room)) = row else {
        return Err(AppError::NotFound);
    };
    check_room_access(&state, &user, &room)?;
    if sender_id != user.id && !user.is_admin {
        return Err(AppError::Unauthorized);
    }

    let conn = state.db.get()?;
    conn.execute("DELETE FROM chat_messages WHERE id = ?1", params![id])?;
    Ok(Json(json!({ "success": true })).into_response())
}

async fn toggle_reaction(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
    Json(req): Json<ReactionRequest>,
) -> AppResult<Response> {
    let emoji = req.emoji.trim().to_string();
    if emoji.is_empty() || emoji.chars().count() > 8 {
        return Err(AppError::BadRequest("Invalid reaction emoji".into()));
    }

    let room: Option<String> = {
        let conn = state.db.get()?;
        conn.query_row(
            "SELECT room FROM chat_messages WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?
    };
    let Some(room) = room else {
        return Err(AppError::NotFound);
    };
    check_room_access(&state, &user, &room)?;

    let reactions = {
        let mut conn = state.db.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let reactions = apply_reaction_toggle(&tx, &id, &emoji, &user.id)?;
        tx.commit()?;
        reactions
    };

    Ok(Json(json!({ "success": true, "reactions": reactions })).into_response())
}

// -- Mutation helpers --

/// Read-modify-write the reactions map: add the user under the emoji, or
/// remove them if already present; emptied emoji keys are dropped.
pub fn apply_reaction_toggle(
    tx: &Transaction,
    message_id: &str,
    emoji: &str,
    user_id: &str,
) -> AppResult<BTreeMap<String, Vec<String>>> {
    let raw: String = tx.query_row(
        "SELECT reactions FROM chat_messages WHERE id = ?1",
        params![message_id],
        |row| row.get(0),
    )?;
    let mut reactions: BTreeMap<String, Vec<String>> =
        serde_json::from_str(&raw).unwrap_or_default();

    let users = reactions.entry(emoji.to_string()).or_default();
    if let Some(pos) = users.iter().position(|u| u == user_id) {
        users.remove(pos);
    } else {
        users.push(user_id.to_string());
    }
    if users.is_empty() {
        reactions.remove(emoji);
    }

    tx.execute(
        "UPDATE chat_messages SET reactions = ?1 WHERE id = ?2",
        params![serde_json::to_string(&reactions)?, message_id],
    )?;
    Ok(reactions)
}

// -- Query helpers --

const MESSAGE_COLUMNS: &str = "id, room, user_id, body, reactions, edited, created_at";

fn message_from_row(row: &rusqlite::Row) -> Result<ChatMessage, rusqlite::Error> {
    let raw: String = row.get(4)?;
    Ok(ChatMessage {
        id: row.get(0)?,
        room: row.get(1)?,
        user_id: row.get(2)?,
        body: row.get(3)?,
        reactions: serde_json::from_str(&raw).unwrap_or_default(),
        edited: row.get(5)?,
        created_at: row.get(6)?,
    })
}

pub fn fetch_message(state: &AppState, id: &str) -> AppResult<Option<ChatMessage>> {
    let conn = state.db.get()?;
    let message = conn
        .query_row(
            &format!("SELECT {} FROM chat_messages WHERE id = ?1", MESSAGE_COLUMNS),
            params![id],
            message_from_row,
        )
        .optional()?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::create_test_pool;
    use crate::state::DbPool;
    use chrono::Duration;

    fn test_state() -> AppState {
        AppState {
            db: create_test_pool(),
            config: Config::default(),
        }
    }

    fn viewer(id: &str, is_admin: bool) -> CurrentUser {
        CurrentUser {
            id: id.to_string(),
            username: id.to_string(),
            is_admin,
        }
    }

    fn seed_user(state: &AppState, id: &str, premium_active: bool, expires: Option<String>) {
        let conn = state.db.get().unwrap();
        conn.execute(
            "INSERT INTO users (id, username, email, password_hash, premium_active, premium_expires) \
             VALUES (?1, ?1, ?1 || '@x.co', 'h', ?2, ?3)",
            params![id, premium_active, expires],
        )
        .unwrap();
    }

    fn seed_message(pool: &DbPool) {
        let conn = pool.get().unwrap();
        conn.execute(
            "INSERT INTO users (id, username, email, password_hash) VALUES ('u1', 'a', 'a@x.co', 'h')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO chat_messages (id, room, user_id, body) VALUES ('m1', 'premium', 'u1', 'hi')",
            [],
        )
        .unwrap();
    }

    fn toggle(pool: &DbPool, emoji: &str, user: &str) -> BTreeMap<String, Vec<String>> {
        let mut conn = pool.get().unwrap();
        let tx = conn.transaction().unwrap();
        let out = apply_reaction_toggle(&tx, "m1", emoji, user).unwrap();
        tx.commit().unwrap();
        out
    }

    #[test]
    fn premium_room_requires_active_subscription() {
        let state = test_state();
        let future = (Utc::now() + Duration::days(3)).to_rfc3339();
        let past = (Utc::now() - Duration::days(3)).to_rfc3339();
        seed_user(&state, "active", true, Some(future));
        seed_user(&state, "lapsed", true, Some(past));
        seed_user(&state, "free", false, None);

        assert!(check_room_access(&state, &viewer("active", false), PREMIUM_ROOM).is_ok());
        assert!(matches!(
            check_room_access(&state, &viewer("lapsed", false), PREMIUM_ROOM),
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            check_room_access(&state, &viewer("free", false), PREMIUM_ROOM),
            Err(AppError::Forbidden(_))
        ));
        // Admins enter without a subscription
        assert!(check_room_access(&state, &viewer("root", true), PREMIUM_ROOM).is_ok());
    }

    #[test]
    fn support_room_belongs_to_its_owner() {
        let state = test_state();
        assert!(check_room_access(&state, &viewer("u1", false), "support:u1").is_ok());
        assert!(matches!(
            check_room_access(&state, &viewer("u2", false), "support:u1"),
            Err(AppError::Forbidden(_))
        ));
        assert!(check_room_access(&state, &viewer("root", true), "support:u1").is_ok());
    }

    #[test]
    fn unknown_room_is_rejected() {
        let state = test_state();
        assert!(matches!(
            check_room_access(&state, &viewer("u1", false), "lounge"),
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn lapsed_subscriber_cannot_edit_or_delete_premium_messages() {
        let state = test_state();
        let past = (Utc::now() - Duration::days(3)).to_rfc3339();
        seed_user(&state, "lapsed", true, Some(past));
        {
            let conn = state.db.get().unwrap();
            conn.execute(
                "INSERT INTO chat_messages (id, room, user_id, body) \
                 VALUES ('m1', 'premium', 'lapsed', 'old message')",
                [],
            )
            .unwrap();
        }

        // The sender check alone would pass; room access must still reject
        let edit = edit_message(
            State(state.clone()),
            viewer("lapsed", false),
            Path("m1".to_string()),
            Json(EditMessageRequest {
                body: "rewritten".to_string(),
            }),
        )
        .await;
        assert!(matches!(edit, Err(AppError::Forbidden(_))));

        let delete = delete_message(
            State(state.clone()),
            viewer("lapsed", false),
            Path("m1".to_string()),
        )
        .await;
        assert!(matches!(delete, Err(AppError::Forbidden(_))));

        // The message is untouched, and an admin can still remove it
        {
            let conn = state.db.get().unwrap();
            let body: String = conn
                .query_row("SELECT body FROM chat_messages WHERE id = 'm1'", [], |r| {
                    r.get(0)
                })
                .unwrap();
            assert_eq!(body, "old message");
        }
        let delete = delete_message(State(state.clone()), viewer("root", true), Path("m1".to_string())).await;
        assert!(delete.is_ok());
    }

    #[test]
    fn reaction_toggle_adds_then_removes() {
        let pool = create_test_pool();
        seed_message(&pool);

        let reactions = toggle(&pool, "🔥", "u1");
        assert_eq!(reactions.get("🔥").unwrap(), &vec!["u1".to_string()]);

        // Second toggle removes the user and drops the emptied key
        let reactions = toggle(&pool, "🔥", "u1");
        assert!(reactions.is_empty());
    }

    #[test]
    fn reactions_accumulate_across_users() {
        let pool = create_test_pool();
        seed_message(&pool);
        toggle(&pool, "🔥", "u1");
        let reactions = toggle(&pool, "🔥", "u2");
        assert_eq!(
            reactions.get("🔥").unwrap(),
            &vec!["u1".to_string(), "u2".to_string()]
        );

        let reactions = toggle(&pool, "👍", "u1");
        assert_eq!(reactions.len(), 2);
    }

    #[test]
    fn removing_one_user_keeps_others() {
        let pool = create_test_pool();
        seed_message(&pool);
        toggle(&pool, "🔥", "u1");
        toggle(&pool, "🔥", "u2");
        let reactions = toggle(&pool, "🔥", "u1");
        assert_eq!(reactions.get("🔥").unwrap(), &vec!["u2".to_string()]);
    }

    #[test]
    fn reactions_survive_round_trip_through_storage() {
        let pool = create_test_pool();
        seed_message(&pool);
        toggle(&pool, "🎉", "u1");

        let conn = pool.get().unwrap();
        let raw: String = conn
            .query_row("SELECT reactions FROM chat_messages WHERE id = 'm1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        let parsed: BTreeMap<String, Vec<String>> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.get("🎉").unwrap(), &vec!["u1".to_string()]);
    }
}
