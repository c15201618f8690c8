//! Points, daily challenges, streaks, and premium subscriptions.
//!
//! Every mutation here takes a [`Transaction`] so the balance, the challenge
//! counters, and the triggering write commit together. Context-keyed awards
//! (the five-minute-read claim) are deduplicated through the `point_claims`
//! table, which survives restarts.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Transaction};

use crate::error::{AppError, AppResult};

/// Events that earn points, with their fixed values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointEvent {
    DailyLogin,
    ReadFiveMinutes,
    LikeGiven,
    CommentPosted,
}

impl PointEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DailyLogin => "daily_login",
            Self::ReadFiveMinutes => "read_five_minutes",
            Self::LikeGiven => "like_given",
            Self::CommentPosted => "comment_posted",
        }
    }

    pub fn value(&self) -> i64 {
        match self {
            Self::DailyLogin => 10,
            Self::ReadFiveMinutes => 15,
            Self::LikeGiven => 2,
            Self::CommentPosted => 5,
        }
    }

    /// The challenge kind this event advances, if any.
    fn challenge_kind(&self) -> Option<ChallengeKind> {
        match self {
            Self::ReadFiveMinutes => Some(ChallengeKind::Read),
            Self::LikeGiven => Some(ChallengeKind::Like),
            Self::CommentPosted => Some(ChallengeKind::Comment),
            Self::DailyLogin => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    Read,
    Like,
    Comment,
}

impl ChallengeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Like => "like",
            Self::Comment => "comment",
        }
    }
}

/// (kind, target, bonus points)
pub const CHALLENGE_TEMPLATES: &[(ChallengeKind, i64, i64)] = &[
    (ChallengeKind::Read, 2, 30),
    (ChallengeKind::Like, 5, 20),
    (ChallengeKind::Comment, 3, 25),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwardOutcome {
    Awarded {
        points: i64,
        challenge_completed: bool,
    },
    /// A claim for this (user, event, context) was already used.
    Duplicate,
}

/// Award the fixed point value for `event` to `user_id`, advancing the
/// user's daily challenge when its kind matches.
///
/// `context_id` keys the idempotency record for claimable events; passing it
/// twice for the same event yields [`AwardOutcome::Duplicate`] and no write.
/// The challenge bonus lands in the same update as the base award, exactly
/// when progress first reaches the target.
pub fn award_points(
    tx: &Transaction,
    user_id: &str,
    event: PointEvent,
    context_id: Option<&str>,
    today: NaiveDate,
) -> AppResult<AwardOutcome> {
    if let Some(context) = context_id {
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO point_claims (user_id, event, context_id) VALUES (?1, ?2, ?3)",
            params![user_id, event.as_str(), context],
        )?;
        if inserted == 0 {
            return Ok(AwardOutcome::Duplicate);
        }
    }

    let row: Option<(String, Option<String>, i64, i64, i64, bool)> = tx
        .query_row(
            "SELECT challenge_date, challenge_kind, challenge_target, \
                    challenge_progress, challenge_points, challenge_completed \
             FROM users WHERE id = ?1",
            params![user_id],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        )
        .optional()?;
    let Some((challenge_date, challenge_kind, target, progress, bonus, completed)) = row else {
        return Err(AppError::NotFound);
    };

    let mut delta = event.value();
    let mut completed_now = false;

    let challenge_matches = challenge_date == today.to_string()
        && !completed
        && event
            .challenge_kind()
            .map(|k| challenge_kind.as_deref() == Some(k.as_str()))
            .unwrap_or(false);

    if challenge_matches {
        let new_progress = (progress + 1).min(target);
        if new_progress >= target {
            completed_now = true;
            delta += bonus;
        }
        tx.execute(
            "UPDATE users SET challenge_progress = ?1, challenge_completed = ?2 WHERE id = ?3",
            params![new_progress, completed_now, user_id],
        )?;
    }

    tx.execute(
        "UPDATE users SET points = points + ?1 WHERE id = ?2",
        params![delta, user_id],
    )?;

    tracing::debug!(
        user = user_id,
        event = event.as_str(),
        points = delta,
        "awarded points"
    );
    Ok(AwardOutcome::Awarded {
        points: delta,
        challenge_completed: completed_now,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginSummary {
    pub streak: i64,
    pub points_awarded: i64,
    pub challenge_assigned: bool,
}

/// Advance the login streak and hand out the once-a-day login award.
/// Assigns a fresh daily challenge at the first login of each day.
pub fn record_login(tx: &Transaction, user_id: &str, today: NaiveDate) -> AppResult<LoginSummary> {
    let row: Option<(i64, Option<String>, Option<String>)> = tx
        .query_row(
            "SELECT streak_current, streak_last_login, challenge_date FROM users WHERE id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((streak, last_login, challenge_date)) = row else {
        return Err(AppError::NotFound);
    };

    let today_str = today.to_string();
    let yesterday = today.pred_opt().map(|d| d.to_string());

    let mut points_awarded = 0;
    let mut new_streak = streak;
    if last_login.as_deref() != Some(today_str.as_str()) {
        new_streak = if last_login.as_deref() == yesterday.as_deref() {
            streak + 1
        } else {
            1
        };
        tx.execute(
            "UPDATE users SET streak_current = ?1, streak_last_login = ?2 WHERE id = ?3",
            params![new_streak, today_str, user_id],
        )?;
        match award_points(tx, user_id, PointEvent::DailyLogin, None, today)? {
            AwardOutcome::Awarded { points, .. } => points_awarded = points,
            AwardOutcome::Duplicate => {}
        }
    }

    let mut challenge_assigned = false;
    if challenge_date.as_deref() != Some(today_str.as_str()) {
        let idx = {
            use rand::Rng;
            rand::thread_rng().gen_range(0..CHALLENGE_TEMPLATES.len())
        };
        assign_challenge(tx, user_id, today, idx)?;
        challenge_assigned = true;
    }

    Ok(LoginSummary {
        streak: new_streak,
        points_awarded,
        challenge_assigned,
    })
}

/// Write the challenge template at `template_index` onto the user for `date`.
pub fn assign_challenge(
    tx: &Transaction,
    user_id: &str,
    date: NaiveDate,
    template_index: usize,
) -> AppResult<()> {
    let (kind, target, bonus) = CHALLENGE_TEMPLATES[template_index % CHALLENGE_TEMPLATES.len()];
    tx.execute(
        "UPDATE users SET challenge_date = ?1, challenge_kind = ?2, challenge_target = ?3, \
         challenge_progress = 0, challenge_points = ?4, challenge_completed = 0 WHERE id = ?5",
        params![date.to_string(), kind.as_str(), target, bonus, user_id],
    )?;
    Ok(())
}

/// Premium subscription plans, paid in points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Weekly,
    Monthly,
}

impl Plan {
    pub fn parse(s: &str) -> AppResult<Self> {
        match s {
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(AppError::BadRequest(format!("Unknown plan: {}", other))),
        }
    }

    pub fn days(&self) -> i64 {
        match self {
            Self::Weekly => 7,
            Self::Monthly => 30,
        }
    }

    pub fn cost(&self) -> i64 {
        match self {
            Self::Weekly => 500,
            Self::Monthly => 1500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseReceipt {
    pub balance: i64,
    pub premium_expires: String,
}

/// "Is premium right now" is always re-derived from both fields; the active
/// flag alone is never trusted.
pub fn is_premium(active: bool, expires: Option<&str>, now: DateTime<Utc>) -> bool {
    active
        && expires
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|e| e > now)
            .unwrap_or(false)
}

/// Debit the plan's cost and extend the premium expiry. When a subscription
/// is already active the new expiry stacks on the existing one, otherwise it
/// counts from `now`.
pub fn purchase_subscription(
    tx: &Transaction,
    user_id: &str,
    plan: Plan,
    now: DateTime<Utc>,
) -> AppResult<PurchaseReceipt> {
    let row: Option<(i64, bool, Option<String>)> = tx
        .query_row(
            "SELECT points, premium_active, premium_expires FROM users WHERE id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((points, active, expires)) = row else {
        return Err(AppError::NotFound);
    };

    let cost = plan.cost();
    if points < cost {
        return Err(AppError::InsufficientPoints {
            have: points,
            need: cost,
        });
    }

    let base = if is_premium(active, expires.as_deref(), now) {
        DateTime::parse_from_rfc3339(expires.as_deref().unwrap_or_default())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or(now)
    } else {
        now
    };
    let new_expires = (base + Duration::days(plan.days())).to_rfc3339();

    tx.execute(
        "UPDATE users SET points = points - ?1, premium_active = 1, premium_expires = ?2 \
         WHERE id = ?3",
        params![cost, new_expires, user_id],
    )?;

    tracing::info!(user = user_id, ?plan, "subscription purchased");
    Ok(PurchaseReceipt {
        balance: points - cost,
        premium_expires: new_expires,
    })
}

/// Admin override: add or remove points, flooring the balance at zero.
pub fn adjust_points(tx: &Transaction, user_id: &str, delta: i64) -> AppResult<i64> {
    let points: Option<i64> = tx
        .query_row(
            "SELECT points FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(points) = points else {
        return Err(AppError::NotFound);
    };

    let new_balance = (points + delta).max(0);
    tx.execute(
        "UPDATE users SET points = ?1 WHERE id = ?2",
        params![new_balance, user_id],
    )?;
    Ok(new_balance)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    Grant { days: i64 },
    Revoke,
}

/// Admin override: grant days (stacking like a purchase, no debit) or revoke.
pub fn manage_subscription(
    tx: &Transaction,
    user_id: &str,
    action: SubscriptionAction,
    now: DateTime<Utc>,
) -> AppResult<Option<String>> {
    let row: Option<(bool, Option<String>)> = tx
        .query_row(
            "SELECT premium_active, premium_expires FROM users WHERE id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((active, expires)) = row else {
        return Err(AppError::NotFound);
    };

    match action {
        SubscriptionAction::Grant { days } => {
            if days <= 0 {
                return Err(AppError::BadRequest("Days must be positive".into()));
            }
            let base = if is_premium(active, expires.as_deref(), now) {
                DateTime::parse_from_rfc3339(expires.as_deref().unwrap_or_default())
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or(now)
            } else {
                now
            };
            let new_expires = (base + Duration::days(days)).to_rfc3339();
            tx.execute(
                "UPDATE users SET premium_active = 1, premium_expires = ?1 WHERE id = ?2",
                params![new_expires, user_id],
            )?;
            Ok(Some(new_expires))
        }
        SubscriptionAction::Revoke => {
            tx.execute(
                "UPDATE users SET premium_active = 0, premium_expires = NULL WHERE id = ?1",
                params![user_id],
            )?;
            Ok(None)
        }
    }
}
