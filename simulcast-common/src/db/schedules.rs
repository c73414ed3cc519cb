//! Broadcast schedule queries
//!
//! Playlist edits replace all items as a whole (delete-all then reinsert
//! in order, one transaction) so ordering and total duration stay
//! consistent; individual rows are never patched.

use crate::model::{AccessPolicy, BroadcastSchedule, BroadcastStatus, PlaylistItem};
use crate::{Error, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Insert a new broadcast with its full playlist.
///
/// Configurable values are clamped before write so stored rows are always
/// in range.
pub async fn create_broadcast(pool: &SqlitePool, schedule: &BroadcastSchedule) -> Result<()> {
    let mut schedule = schedule.clone();
    schedule.clamp_configurables();
    schedule.validate()?;

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO broadcasts
            (id, slug, title, start_at_ms, loop_count, drift_tolerance_secs,
             resync_interval_ms, forced_stop_at_ms, active)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(schedule.id.to_string())
    .bind(&schedule.slug)
    .bind(&schedule.title)
    .bind(schedule.start_at_ms)
    .bind(schedule.loop_count as i64)
    .bind(schedule.drift_tolerance_secs)
    .bind(schedule.resync_interval_ms as i64)
    .bind(schedule.forced_stop_at_ms)
    .bind(schedule.active as i64)
    .execute(&mut *tx)
    .await?;

    insert_items(&mut tx, schedule.id, &schedule.items).await?;

    tx.commit().await?;
    Ok(())
}

/// Update a broadcast and replace its entire playlist
pub async fn update_broadcast(pool: &SqlitePool, schedule: &BroadcastSchedule) -> Result<()> {
    let mut schedule = schedule.clone();
    schedule.clamp_configurables();
    schedule.validate()?;

    let mut tx = pool.begin().await?;

    let updated = sqlx::query(
        r#"
        UPDATE broadcasts
        SET title = ?, start_at_ms = ?, loop_count = ?, drift_tolerance_secs = ?,
            resync_interval_ms = ?, forced_stop_at_ms = ?, active = ?,
            updated_at = datetime('now')
        WHERE slug = ?
        "#,
    )
    .bind(&schedule.title)
    .bind(schedule.start_at_ms)
    .bind(schedule.loop_count as i64)
    .bind(schedule.drift_tolerance_secs)
    .bind(schedule.resync_interval_ms as i64)
    .bind(schedule.forced_stop_at_ms)
    .bind(schedule.active as i64)
    .bind(&schedule.slug)
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(Error::NotFound(format!("broadcast: {}", schedule.slug)));
    }

    let id: (String,) = sqlx::query_as("SELECT id FROM broadcasts WHERE slug = ?")
        .bind(&schedule.slug)
        .fetch_one(&mut *tx)
        .await?;
    let broadcast_id = parse_uuid(&id.0)?;

    // Replace-all: delete then reinsert in order
    sqlx::query("DELETE FROM playlist_items WHERE broadcast_id = ?")
        .bind(broadcast_id.to_string())
        .execute(&mut *tx)
        .await?;
    insert_items(&mut tx, broadcast_id, &schedule.items).await?;

    tx.commit().await?;
    Ok(())
}

async fn insert_items(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    broadcast_id: Uuid,
    items: &[PlaylistItem],
) -> Result<()> {
    for item in items {
        sqlx::query(
            r#"
            INSERT INTO playlist_items
                (id, broadcast_id, position, media_id, access_policy, duration_secs)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(item.id.to_string())
        .bind(broadcast_id.to_string())
        .bind(item.position as i64)
        .bind(&item.media_id)
        .bind(item.access_policy.as_str())
        .bind(item.duration_secs)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Fetch a broadcast and its playlist (ordered by position) by slug
pub async fn get_broadcast(pool: &SqlitePool, slug: &str) -> Result<Option<BroadcastSchedule>> {
    let row: Option<(String, String, String, i64, i64, f64, i64, Option<i64>, i64)> =
        sqlx::query_as(
            r#"
            SELECT id, slug, title, start_at_ms, loop_count, drift_tolerance_secs,
                   resync_interval_ms, forced_stop_at_ms, active
            FROM broadcasts WHERE slug = ?
            "#,
        )
        .bind(slug)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let broadcast_id = parse_uuid(&row.0)?;

    let item_rows: Vec<(String, i64, String, String, f64)> = sqlx::query_as(
        r#"
        SELECT id, position, media_id, access_policy, duration_secs
        FROM playlist_items WHERE broadcast_id = ?
        ORDER BY position ASC
        "#,
    )
    .bind(broadcast_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut items = Vec::with_capacity(item_rows.len());
    for (id, position, media_id, policy, duration_secs) in item_rows {
        items.push(PlaylistItem {
            id: parse_uuid(&id)?,
            media_id,
            access_policy: AccessPolicy::parse(&policy)?,
            duration_secs,
            position: position as u32,
        });
    }

    Ok(Some(BroadcastSchedule {
        id: broadcast_id,
        slug: row.1,
        title: row.2,
        start_at_ms: row.3,
        items,
        loop_count: row.4 as u32,
        drift_tolerance_secs: row.5,
        resync_interval_ms: row.6 as u64,
        forced_stop_at_ms: row.7,
        active: row.8 != 0,
    }))
}

/// List all broadcast slugs with their status, newest first
pub async fn list_broadcasts(pool: &SqlitePool) -> Result<Vec<BroadcastStatus>> {
    let rows: Vec<(String, Option<i64>, i64)> = sqlx::query_as(
        "SELECT slug, forced_stop_at_ms, active FROM broadcasts ORDER BY created_at DESC",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(slug, forced_stop_at_ms, active)| BroadcastStatus {
            slug,
            forced_stop_at_ms,
            active: active != 0,
        })
        .collect())
}

/// Delete a broadcast and (via cascade) its playlist
pub async fn delete_broadcast(pool: &SqlitePool, slug: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM broadcasts WHERE slug = ?")
        .bind(slug)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("broadcast: {slug}")));
    }
    Ok(())
}

/// Durable status for the polling endpoint and the connect-time check
pub async fn get_status(pool: &SqlitePool, slug: &str) -> Result<Option<BroadcastStatus>> {
    let row: Option<(Option<i64>, i64)> =
        sqlx::query_as("SELECT forced_stop_at_ms, active FROM broadcasts WHERE slug = ?")
            .bind(slug)
            .fetch_optional(pool)
            .await?;

    Ok(row.map(|(forced_stop_at_ms, active)| BroadcastStatus {
        slug: slug.to_string(),
        forced_stop_at_ms,
        active: active != 0,
    }))
}

/// Set or clear the force-stop instant.
///
/// This is the durable half of stop/resume; the caller publishes the
/// control event after this returns.
pub async fn set_forced_stop(
    pool: &SqlitePool,
    slug: &str,
    forced_stop_at_ms: Option<i64>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE broadcasts SET forced_stop_at_ms = ?, updated_at = datetime('now') WHERE slug = ?",
    )
    .bind(forced_stop_at_ms)
    .bind(slug)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("broadcast: {slug}")));
    }
    Ok(())
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::Internal(format!("invalid uuid in database: {e}")))
}
