use anyhow::Result;
use sqlx::PgPool;

use crate::domain::MeterHealth;

/// Upsert one meter's health row. `last_alert_sent_at` is only advanced when
/// a new alert actually went out; passing `None` preserves the stored value.
pub async fn upsert_health(pool: &PgPool, health: &MeterHealth) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO meter_health
            (meter_id, is_flatline, checked_at, last_alert_sent_at, alert_active)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (meter_id) DO UPDATE SET
            is_flatline = EXCLUDED.is_flatline,
            checked_at = EXCLUDED.checked_at,
            last_alert_sent_at = COALESCE(EXCLUDED.last_alert_sent_at, meter_health.last_alert_sent_at),
            alert_active = EXCLUDED.alert_active
        "#,
    )
    .bind(health.meter_id)
    .bind(health.is_flatline)
    .bind(health.checked_at)
    .bind(health.last_alert_sent_at)
    .bind(health.alert_active)
    .execute(pool)
    .await?;

    Ok(())
}
