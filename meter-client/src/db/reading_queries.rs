use anyhow::Result;
use sqlx::{PgExecutor, PgPool};
use time::OffsetDateTime;

use crate::domain::{MeterSnapshot, PowerSample};

/// Per-meter energy consumed across one day: last cumulative grid-consumption
/// counter minus the first, summed over all three phases.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MeterDayEnergy {
    pub meter_id: i64,
    pub energy: f64,
}

/// Append one snapshot. Returns `false` when a reading for the same
/// (meter_id, ts) already exists; existing rows are never overwritten.
pub async fn insert_reading(
    pool: &PgPool,
    meter_id: i64,
    snapshot: &MeterSnapshot,
) -> Result<bool> {
    let a = &snapshot.phase_a;
    let b = &snapshot.phase_b;
    let c = &snapshot.phase_c;

    let result = sqlx::query(
        r#"
        INSERT INTO readings (
            meter_id, ts,
            phase_a_voltage, phase_a_current, phase_a_active_power,
            phase_a_power_factor, phase_a_grid_consumption, phase_a_exported_power,
            phase_b_voltage, phase_b_current, phase_b_active_power,
            phase_b_power_factor, phase_b_grid_consumption, phase_b_exported_power,
            phase_c_voltage, phase_c_current, phase_c_active_power,
            phase_c_power_factor, phase_c_grid_consumption, phase_c_exported_power
        )
        VALUES (
            $1, $2,
            $3, $4, $5, $6, $7, $8,
            $9, $10, $11, $12, $13, $14,
            $15, $16, $17, $18, $19, $20
        )
        ON CONFLICT (meter_id, ts) DO NOTHING
        "#,
    )
    .bind(meter_id)
    .bind(snapshot.ts)
    .bind(a.voltage)
    .bind(a.current)
    .bind(a.active_power)
    .bind(a.power_factor)
    .bind(a.grid_consumption)
    .bind(a.exported_power)
    .bind(b.voltage)
    .bind(b.current)
    .bind(b.active_power)
    .bind(b.power_factor)
    .bind(b.grid_consumption)
    .bind(b.exported_power)
    .bind(c.voltage)
    .bind(c.current)
    .bind(c.active_power)
    .bind(c.power_factor)
    .bind(c.grid_consumption)
    .bind(c.exported_power)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// All power samples for one meter newer than `since`, oldest first.
pub async fn power_window(
    pool: &PgPool,
    meter_id: i64,
    since: OffsetDateTime,
) -> Result<Vec<PowerSample>> {
    let rows = sqlx::query_as::<_, PowerSample>(
        r#"
        SELECT
            phase_a_active_power,
            phase_b_active_power,
            phase_c_active_power
        FROM readings
        WHERE meter_id = $1
          AND ts >= $2
        ORDER BY ts
        "#,
    )
    .bind(meter_id)
    .bind(since)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Per-meter counter delta over [start, end): the day's last cumulative
/// grid-consumption total minus the day's first. Meters with no readings in
/// the range produce no row. A negative delta (counter rollback) is returned
/// as-is; the aggregator decides what to do with it.
pub async fn day_energy<'e>(
    executor: impl PgExecutor<'e>,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<MeterDayEnergy>> {
    let rows = sqlx::query_as::<_, MeterDayEnergy>(
        r#"
        SELECT DISTINCT ON (meter_id)
            meter_id,
            LAST_VALUE(
                phase_a_grid_consumption + phase_b_grid_consumption + phase_c_grid_consumption
            ) OVER w
            - FIRST_VALUE(
                phase_a_grid_consumption + phase_b_grid_consumption + phase_c_grid_consumption
            ) OVER w AS energy
        FROM readings
        WHERE ts >= $1
          AND ts < $2
        WINDOW w AS (
            PARTITION BY meter_id
            ORDER BY ts
            ROWS BETWEEN UNBOUNDED PRECEDING AND UNBOUNDED FOLLOWING
        )
        ORDER BY meter_id
        "#,
    )
    .bind(start)
    .bind(end)
    .fetch_all(executor)
    .await?;

    Ok(rows)
}
