use anyhow::Result;
use sqlx::PgPool;

use crate::domain::Meter;

/// List every registered meter. Registry CRUD lives elsewhere; the collector
/// only needs to know which serials to poll.
pub async fn list_meters(pool: &PgPool) -> Result<Vec<Meter>> {
    let rows = sqlx::query_as::<_, Meter>(
        r#"
        SELECT
            meter_id,
            name,
            serial
        FROM meters
        ORDER BY meter_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
