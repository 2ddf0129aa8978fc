use anyhow::Result;
use sqlx::PgExecutor;

use crate::domain::{BillingSummary, DailyCost, MeterCost};

pub async fn summary<'e>(
    executor: impl PgExecutor<'e>,
    month_key: &str,
) -> Result<Option<BillingSummary>> {
    let row = sqlx::query_as::<_, BillingSummary>(
        r#"
        SELECT month_key, total_cost, avg_cost_per_day, expensive_day, expensive_day_cost
        FROM billing_summaries
        WHERE month_key = $1
        "#,
    )
    .bind(month_key)
    .fetch_optional(executor)
    .await?;

    Ok(row)
}

pub async fn upsert_summary<'e>(
    executor: impl PgExecutor<'e>,
    summary: &BillingSummary,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO billing_summaries
            (month_key, total_cost, avg_cost_per_day, expensive_day, expensive_day_cost)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (month_key) DO UPDATE SET
            total_cost = EXCLUDED.total_cost,
            avg_cost_per_day = EXCLUDED.avg_cost_per_day,
            expensive_day = EXCLUDED.expensive_day,
            expensive_day_cost = EXCLUDED.expensive_day_cost
        "#,
    )
    .bind(&summary.month_key)
    .bind(summary.total_cost)
    .bind(summary.avg_cost_per_day)
    .bind(summary.expensive_day)
    .bind(summary.expensive_day_cost)
    .execute(executor)
    .await?;

    Ok(())
}

/// Days of the month that already have a daily cost row. The aggregator
/// skips these; that is what makes recomputation idempotent.
pub async fn daily_cost_days<'e>(
    executor: impl PgExecutor<'e>,
    month_key: &str,
) -> Result<Vec<i32>> {
    let rows: Vec<(i32,)> = sqlx::query_as(
        r#"
        SELECT day
        FROM daily_costs
        WHERE month_key = $1
        ORDER BY day
        "#,
    )
    .bind(month_key)
    .fetch_all(executor)
    .await?;

    Ok(rows.into_iter().map(|(d,)| d).collect())
}

pub async fn daily_costs<'e>(
    executor: impl PgExecutor<'e>,
    month_key: &str,
) -> Result<Vec<DailyCost>> {
    let rows = sqlx::query_as::<_, DailyCost>(
        r#"
        SELECT month_key, day, cost
        FROM daily_costs
        WHERE month_key = $1
        ORDER BY day
        "#,
    )
    .bind(month_key)
    .fetch_all(executor)
    .await?;

    Ok(rows)
}

/// Insert one day's total. The (month_key, day) uniqueness constraint rejects
/// a duplicate outright, so two overlapping aggregations cannot double-count
/// a day; the loser fails wholesale and can be retried.
pub async fn insert_daily_cost<'e>(
    executor: impl PgExecutor<'e>,
    cost: &DailyCost,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO daily_costs (month_key, day, cost)
        VALUES ($1, $2, $3)
        "#,
    )
    .bind(&cost.month_key)
    .bind(cost.day)
    .bind(cost.cost)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn meter_costs<'e>(
    executor: impl PgExecutor<'e>,
    month_key: &str,
) -> Result<Vec<MeterCost>> {
    let rows = sqlx::query_as::<_, MeterCost>(
        r#"
        SELECT month_key, meter_id, cost
        FROM meter_costs
        WHERE month_key = $1
        ORDER BY meter_id
        "#,
    )
    .bind(month_key)
    .fetch_all(executor)
    .await?;

    Ok(rows)
}

/// Merge one meter's daily contribution into its monthly total. The merge is
/// a single atomic statement keyed on (month_key, meter_id), so concurrent
/// aggregation attempts cannot lose an update.
pub async fn merge_meter_cost<'e>(
    executor: impl PgExecutor<'e>,
    month_key: &str,
    meter_id: i64,
    contribution: f64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO meter_costs (month_key, meter_id, cost)
        VALUES ($1, $2, $3)
        ON CONFLICT (month_key, meter_id) DO UPDATE SET
            cost = meter_costs.cost + EXCLUDED.cost
        "#,
    )
    .bind(month_key)
    .bind(meter_id)
    .bind(contribution)
    .execute(executor)
    .await?;

    Ok(())
}

/// Remove every billing row for a month ahead of a forced recompute.
pub async fn clear_month(
    conn: &mut sqlx::PgConnection,
    month_key: &str,
) -> Result<()> {
    sqlx::query("DELETE FROM daily_costs WHERE month_key = $1")
        .bind(month_key)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM meter_costs WHERE month_key = $1")
        .bind(month_key)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM billing_summaries WHERE month_key = $1")
        .bind(month_key)
        .execute(&mut *conn)
        .await?;

    Ok(())
}
