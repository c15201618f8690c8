//! Trending-slot bookkeeping for posts.
//!
//! At most [`TRENDING_SLOTS`] posts are trending at a time, each holding a
//! distinct position in 1..=10. Every pass here runs inside the caller's
//! transaction, together with the triggering post's own write, so two
//! concurrent assignments cannot interleave and produce duplicate positions.

use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension, Transaction};

use crate::error::{AppError, AppResult};

pub const TRENDING_SLOTS: i64 = 10;

/// How long a trending assignment lasts before read queries filter it out.
const TRENDING_TTL_DAYS: i64 = 7;

pub fn validate_position(position: i64) -> AppResult<()> {
    if !(1..=TRENDING_SLOTS).contains(&position) {
        return Err(AppError::BadRequest(format!(
            "Trending position must be between 1 and {}",
            TRENDING_SLOTS
        )));
    }
    Ok(())
}

/// Place `post_id` at `position`, displacing the posts below it.
///
/// Every other trending post at or above the requested slot moves down one
/// place; anyone pushed past the last slot leaves the trending set entirely.
/// Assigning a slot with nothing at or above it shifts nothing.
pub fn assign(tx: &Transaction, post_id: &str, position: i64) -> AppResult<()> {
    validate_position(position)?;

    tx.execute(
        "UPDATE posts SET trending_position = trending_position + 1 \
         WHERE trending = 1 AND trending_position >= ?1 AND id != ?2",
        params![position, post_id],
    )?;
    tx.execute(
        "UPDATE posts SET trending = 0, trending_position = NULL, trending_until = NULL \
         WHERE trending = 1 AND trending_position > ?1",
        params![TRENDING_SLOTS],
    )?;

    let until = (Utc::now() + Duration::days(TRENDING_TTL_DAYS)).to_rfc3339();
    tx.execute(
        "UPDATE posts SET trending = 1, trending_position = ?1, trending_until = ?2 \
         WHERE id = ?3",
        params![position, until, post_id],
    )?;

    tracing::debug!(post = post_id, position, "assigned trending slot");
    Ok(())
}

/// Remove `post_id` from the trending set and close the gap it leaves:
/// every trending post with a strictly greater position moves up one place.
/// No-op when the post is not trending.
pub fn withdraw(tx: &Transaction, post_id: &str) -> AppResult<()> {
    let old: Option<i64> = tx
        .query_row(
            "SELECT trending_position FROM posts WHERE id = ?1 AND trending = 1",
            params![post_id],
            |row| row.get(0),
        )
        .optional()?;

    let Some(old_position) = old else {
        return Ok(());
    };

    tx.execute(
        "UPDATE posts SET trending = 0, trending_position = NULL, trending_until = NULL \
         WHERE id = ?1",
        params![post_id],
    )?;
    tx.execute(
        "UPDATE posts SET trending_position = trending_position - 1 \
         WHERE trending = 1 AND trending_position > ?1",
        params![old_position],
    )?;

    tracing::debug!(post = post_id, old_position, "withdrew trending slot");
    Ok(())
}

/// Move an already-trending post to `position`. Runs the withdraw pass for
/// the old slot, then the assign pass — so the shift-and-displace pass runs
/// even when the requested slot equals the current one.
pub fn reposition(tx: &Transaction, post_id: &str, position: i64) -> AppResult<()> {
    validate_position(position)?;
    withdraw(tx, post_id)?;
    assign(tx, post_id, position)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::state::DbPool;
    use rusqlite::params;

    fn seed_posts(pool: &DbPool, ids: &[&str]) {
        let conn = pool.get().unwrap();
        conn.execute(
            "INSERT INTO users (id, username, email, password_hash) VALUES ('u1', 'a', 'a@x.co', 'h')",
            [],
        )
        .unwrap();
        for id in ids {
            conn.execute(
                "INSERT INTO posts (id, author_id, title, content) VALUES (?1, 'u1', ?1, 'body')",
                params![id],
            )
            .unwrap();
        }
    }

    fn positions(pool: &DbPool) -> Vec<(String, i64)> {
        let conn = pool.get().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, trending_position FROM posts \
                 WHERE trending = 1 ORDER BY trending_position",
            )
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    fn in_tx(pool: &DbPool, f: impl FnOnce(&Transaction)) {
        let mut conn = pool.get().unwrap();
        let tx = conn.transaction().unwrap();
        f(&tx);
        tx.commit().unwrap();
    }

    fn assert_invariant(pool: &DbPool) {
        let conn = pool.get().unwrap();
        // No position outside [1,10], no duplicates, no position while not trending
        let bad: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM posts WHERE \
                 (trending = 1 AND (trending_position IS NULL OR trending_position < 1 OR trending_position > 10)) \
                 OR (trending = 0 AND trending_position IS NOT NULL)",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(bad, 0);
        let dupes: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM (SELECT trending_position FROM posts WHERE trending = 1 \
                 GROUP BY trending_position HAVING COUNT(*) > 1)",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(dupes, 0);
    }

    #[test]
    fn assign_into_gap_shifts_occupants() {
        // Post A at 3, post B at 5; assigning C to 3 yields A->4, B->6, C->3.
        let pool = create_test_pool();
        seed_posts(&pool, &["a", "b", "c"]);
        in_tx(&pool, |tx| {
            assign(tx, "a", 3).unwrap();
            assign(tx, "b", 5).unwrap();
        });
        // a lands at 3; b's assign at 5 shifts nothing (a is below)
        assert_eq!(
            positions(&pool),
            vec![("a".to_string(), 3), ("b".to_string(), 5)]
        );

        in_tx(&pool, |tx| assign(tx, "c", 3).unwrap());
        assert_eq!(
            positions(&pool),
            vec![
                ("c".to_string(), 3),
                ("a".to_string(), 4),
                ("b".to_string(), 6)
            ]
        );
        assert_invariant(&pool);
    }

    #[test]
    fn assign_with_nothing_at_or_above_is_noop_shift() {
        let pool = create_test_pool();
        seed_posts(&pool, &["a", "b"]);
        in_tx(&pool, |tx| assign(tx, "a", 2).unwrap());
        in_tx(&pool, |tx| assign(tx, "b", 7).unwrap());
        assert_eq!(
            positions(&pool),
            vec![("a".to_string(), 2), ("b".to_string(), 7)]
        );
        assert_invariant(&pool);
    }

    #[test]
    fn overflow_demotes_out_of_trending() {
        let pool = create_test_pool();
        let ids: Vec<String> = (0..11).map(|i| format!("p{}", i)).collect();
        let refs: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
        seed_posts(&pool, &refs);

        // Fill all ten slots
        in_tx(&pool, |tx| {
            for (i, id) in refs.iter().take(10).enumerate() {
                assign(tx, id, (i + 1) as i64).unwrap();
            }
        });
        assert_eq!(positions(&pool).len(), 10);

        // Inserting at 1 pushes the post at 10 out entirely
        in_tx(&pool, |tx| assign(tx, "p10", 1).unwrap());
        let pos = positions(&pool);
        assert_eq!(pos.len(), 10);
        assert_eq!(pos[0], ("p10".to_string(), 1));
        assert!(!pos.iter().any(|(id, _)| id == "p9"));
        assert_invariant(&pool);

        // The demoted post carries no leftover trending fields
        let conn = pool.get().unwrap();
        let (trending, position, until): (bool, Option<i64>, Option<String>) = conn
            .query_row(
                "SELECT trending, trending_position, trending_until FROM posts WHERE id = 'p9'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert!(!trending);
        assert_eq!(position, None);
        assert_eq!(until, None);
    }

    #[test]
    fn withdraw_closes_the_gap() {
        let pool = create_test_pool();
        seed_posts(&pool, &["a", "b", "c"]);
        in_tx(&pool, |tx| {
            assign(tx, "a", 1).unwrap();
            assign(tx, "b", 2).unwrap();
            assign(tx, "c", 3).unwrap();
        });
        in_tx(&pool, |tx| withdraw(tx, "a").unwrap());
        let pos = positions(&pool);
        assert_eq!(pos.len(), 2);
        // Remaining posts are contiguous from 1
        assert_eq!(pos[0].1, 1);
        assert_eq!(pos[1].1, 2);
        assert_invariant(&pool);
    }

    #[test]
    fn withdraw_of_non_trending_post_is_noop() {
        let pool = create_test_pool();
        seed_posts(&pool, &["a", "b"]);
        in_tx(&pool, |tx| assign(tx, "a", 1).unwrap());
        in_tx(&pool, |tx| withdraw(tx, "b").unwrap());
        assert_eq!(positions(&pool), vec![("a".to_string(), 1)]);
    }

    #[test]
    fn reposition_to_same_slot_keeps_invariant() {
        let pool = create_test_pool();
        seed_posts(&pool, &["a", "b", "c"]);
        in_tx(&pool, |tx| {
            assign(tx, "a", 1).unwrap();
            assign(tx, "b", 2).unwrap();
            assign(tx, "c", 3).unwrap();
        });
        in_tx(&pool, |tx| reposition(tx, "b", 2).unwrap());
        let pos = positions(&pool);
        assert_eq!(pos.len(), 3);
        assert!(pos.contains(&("b".to_string(), 2)));
        assert_invariant(&pool);
    }

    #[test]
    fn reposition_moves_between_slots() {
        let pool = create_test_pool();
        seed_posts(&pool, &["a", "b", "c"]);
        in_tx(&pool, |tx| {
            assign(tx, "a", 1).unwrap();
            assign(tx, "b", 2).unwrap();
            assign(tx, "c", 3).unwrap();
        });
        in_tx(&pool, |tx| reposition(tx, "c", 1).unwrap());
        let pos = positions(&pool);
        assert_eq!(pos[0], ("c".to_string(), 1));
        assert_invariant(&pool);
    }

    #[test]
    fn position_out_of_range_rejected() {
        let pool = create_test_pool();
        seed_posts(&pool, &["a"]);
        let mut conn = pool.get().unwrap();
        let tx = conn.transaction().unwrap();
        assert!(matches!(
            assign(&tx, "a", 0),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            assign(&tx, "a", 11),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn random_operation_sequence_preserves_invariant() {
        let pool = create_test_pool();
        let ids: Vec<String> = (0..15).map(|i| format!("p{}", i)).collect();
        let refs: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
        seed_posts(&pool, &refs);

        // Deterministic pseudo-random walk over assign/withdraw
        let mut seed: u64 = 0x9e3779b97f4a7c15;
        for step in 0..200 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let post = refs[(seed >> 33) as usize % refs.len()];
            let slot = ((seed >> 17) % 10 + 1) as i64;
            in_tx(&pool, |tx| {
                if step % 3 == 2 {
                    withdraw(tx, post).unwrap();
                } else {
                    assign(tx, post, slot).unwrap();
                }
            });
            assert_invariant(&pool);
        }
    }
}
