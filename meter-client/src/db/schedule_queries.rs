use anyhow::Result;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::domain::ScheduleConfig;

/// Persist a new schedule and make it the single active one. Deactivating the
/// previous rows and inserting the new one happen in the same transaction, so
/// the one-active-row invariant holds even if a caller races a stop.
pub async fn activate(
    pool: &PgPool,
    start_at: OffsetDateTime,
    end_at: OffsetDateTime,
    interval_minutes: i32,
    created_by: Option<i64>,
) -> Result<ScheduleConfig> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE collection_schedules
        SET is_active = FALSE,
            updated_at = NOW()
        WHERE is_active
        "#,
    )
    .execute(&mut *tx)
    .await?;

    let schedule = sqlx::query_as::<_, ScheduleConfig>(
        r#"
        INSERT INTO collection_schedules
            (start_at, end_at, interval_minutes, is_active, created_by, created_at)
        VALUES ($1, $2, $3, TRUE, $4, NOW())
        RETURNING
            id, start_at, end_at, interval_minutes, is_active,
            created_by, created_at, updated_at
        "#,
    )
    .bind(start_at)
    .bind(end_at)
    .bind(interval_minutes)
    .bind(created_by)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(schedule)
}

/// Mark every schedule inactive. Used on stop and on natural expiry.
pub async fn deactivate_all(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE collection_schedules
        SET is_active = FALSE,
            updated_at = NOW()
        WHERE is_active
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// The most recently created active schedule, if any. Used at startup to
/// resume collection across a restart.
pub async fn latest_active(pool: &PgPool) -> Result<Option<ScheduleConfig>> {
    let row = sqlx::query_as::<_, ScheduleConfig>(
        r#"
        SELECT
            id, start_at, end_at, interval_minutes, is_active,
            created_by, created_at, updated_at
        FROM collection_schedules
        WHERE is_active
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    Ok(row)
}
