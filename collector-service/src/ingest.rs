use std::sync::Arc;
use std::time::Duration;

use meter_client::db::{meter_queries, reading_queries};
use meter_client::domain::{Meter, MeterSnapshot, PhaseSnapshot};
use sqlx::PgPool;
use time::macros::format_description;
use time::PrimitiveDateTime;

#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sensor API rejected request: {0}")]
    Rejected(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// One snapshot per meter serial from the external sensor API. Any failure is
/// "no data this tick" for that meter, never a process-level fault.
#[async_trait::async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn fetch(&self, serial: &str) -> Result<MeterSnapshot, TelemetryError>;
}

#[derive(serde::Deserialize)]
struct SensorPayload {
    successful: bool,
    message: Option<String>,
    data: Option<SensorData>,
}

#[derive(serde::Deserialize)]
struct SensorData {
    #[serde(rename = "localTime")]
    local_time: String,
    /// One row per phase: [voltage, current, active_power, power_factor,
    /// grid_consumption, exported_power].
    values: Vec<Vec<f64>>,
}

pub struct HttpTelemetrySource {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpTelemetrySource {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl TelemetrySource for HttpTelemetrySource {
    async fn fetch(&self, serial: &str) -> Result<MeterSnapshot, TelemetryError> {
        let url = format!("{}/{serial}", self.base_url);
        let payload: SensorPayload = self
            .client
            .get(&url)
            .query(&[("token", self.token.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !payload.successful {
            return Err(TelemetryError::Rejected(
                payload.message.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        let data = payload
            .data
            .ok_or_else(|| TelemetryError::Malformed("missing data object".to_string()))?;

        snapshot_from_payload(&data)
    }
}

fn phase_from_row(row: &[f64]) -> Result<PhaseSnapshot, TelemetryError> {
    if row.len() < 6 {
        return Err(TelemetryError::Malformed(format!(
            "phase row has {} values, expected 6",
            row.len()
        )));
    }

    Ok(PhaseSnapshot {
        voltage: row[0],
        current: row[1],
        active_power: row[2],
        power_factor: row[3],
        grid_consumption: row[4],
        exported_power: row[5],
    })
}

fn snapshot_from_payload(data: &SensorData) -> Result<MeterSnapshot, TelemetryError> {
    let format = format_description!("[year]/[month]/[day] [hour]:[minute]:[second]");
    let ts = PrimitiveDateTime::parse(&data.local_time, &format)
        .map_err(|e| TelemetryError::Malformed(format!("bad localTime {:?}: {e}", data.local_time)))?
        .assume_utc();

    if data.values.len() < 3 {
        return Err(TelemetryError::Malformed(format!(
            "expected 3 phase rows, got {}",
            data.values.len()
        )));
    }

    Ok(MeterSnapshot {
        ts,
        phase_a: phase_from_row(&data.values[0])?,
        phase_b: phase_from_row(&data.values[1])?,
        phase_c: phase_from_row(&data.values[2])?,
    })
}

/// Fetch a snapshot for every meter, dropping the ones that fail. A single
/// meter's failure is logged and never aborts the pass.
pub async fn fetch_snapshots(
    source: &dyn TelemetrySource,
    meters: &[Meter],
) -> Vec<(i64, MeterSnapshot)> {
    let mut out = Vec::with_capacity(meters.len());

    for meter in meters {
        match source.fetch(&meter.serial).await {
            Ok(snapshot) => out.push((meter.meter_id, snapshot)),
            Err(e) => {
                metrics::counter!("telemetry_fetch_failures_total").increment(1);
                tracing::warn!(
                    meter_id = meter.meter_id,
                    serial = %meter.serial,
                    error = %e,
                    "telemetry fetch failed, no data for this meter this tick"
                );
            }
        }
    }

    out
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct IngestReport {
    pub attempted: usize,
    pub stored: usize,
    pub failed: usize,
}

/// Pulls one snapshot per registered meter and appends it to the store.
pub struct Ingestor {
    pool: PgPool,
    source: Arc<dyn TelemetrySource>,
}

impl Ingestor {
    pub fn new(pool: PgPool, source: Arc<dyn TelemetrySource>) -> Self {
        Self { pool, source }
    }

    /// One ingestion pass over all registered meters. Per-meter fetch and
    /// store failures are counted and logged; only a failure to list meters
    /// surfaces as an error.
    pub async fn run_once(&self) -> anyhow::Result<IngestReport> {
        let meters = meter_queries::list_meters(&self.pool).await?;
        let snapshots = fetch_snapshots(self.source.as_ref(), &meters).await;

        let mut report = IngestReport {
            attempted: meters.len(),
            stored: 0,
            failed: meters.len() - snapshots.len(),
        };

        for (meter_id, snapshot) in &snapshots {
            match reading_queries::insert_reading(&self.pool, *meter_id, snapshot).await {
                Ok(true) => {
                    report.stored += 1;
                    metrics::counter!("readings_stored_total").increment(1);
                }
                Ok(false) => {
                    tracing::debug!(meter_id, "duplicate reading skipped");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(meter_id, error = %e, "failed to store reading");
                }
            }
        }

        tracing::info!(
            attempted = report.attempted,
            stored = report.stored,
            failed = report.failed,
            "ingestion pass complete"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    struct FlakySource {
        failing_serial: String,
    }

    #[async_trait::async_trait]
    impl TelemetrySource for FlakySource {
        async fn fetch(&self, serial: &str) -> Result<MeterSnapshot, TelemetryError> {
            if serial == self.failing_serial {
                return Err(TelemetryError::Rejected("device offline".to_string()));
            }
            Ok(MeterSnapshot {
                ts: datetime!(2024-03-01 10:00:00 UTC),
                phase_a: phase_from_row(&[230.0, 1.0, 200.0, 0.98, 100.0, 0.0]).unwrap(),
                phase_b: phase_from_row(&[229.0, 1.1, 210.0, 0.97, 110.0, 0.0]).unwrap(),
                phase_c: phase_from_row(&[231.0, 0.9, 190.0, 0.99, 90.0, 0.0]).unwrap(),
            })
        }
    }

    fn meter(id: i64, serial: &str) -> Meter {
        Meter {
            meter_id: id,
            name: format!("meter-{id}"),
            serial: serial.to_string(),
        }
    }

    #[tokio::test]
    async fn one_failing_meter_does_not_affect_the_rest() {
        let source = FlakySource {
            failing_serial: "SN-A".to_string(),
        };
        let meters = vec![meter(1, "SN-A"), meter(2, "SN-B")];

        let snapshots = fetch_snapshots(&source, &meters).await;

        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].0, 2);
    }

    #[test]
    fn payload_maps_phase_rows_in_order() {
        let raw = r#"
        {
            "successful": true,
            "message": null,
            "data": {
                "localTime": "2024/03/01 10:05:00",
                "values": [
                    [230.1, 1.2, 250.0, 0.98, 1000.5, 2.0],
                    [229.8, 1.1, 240.0, 0.97, 900.0, 1.5],
                    [230.4, 1.3, 260.0, 0.99, 1100.0, 0.0]
                ]
            }
        }
        "#;

        let payload: SensorPayload = serde_json::from_str(raw).unwrap();
        let snapshot = snapshot_from_payload(payload.data.as_ref().unwrap()).unwrap();

        assert_eq!(snapshot.ts, datetime!(2024-03-01 10:05:00 UTC));
        assert_eq!(snapshot.phase_a.voltage, 230.1);
        assert_eq!(snapshot.phase_a.grid_consumption, 1000.5);
        assert_eq!(snapshot.phase_b.active_power, 240.0);
        assert_eq!(snapshot.phase_c.exported_power, 0.0);
    }

    #[test]
    fn short_phase_row_is_malformed() {
        let data = SensorData {
            local_time: "2024/03/01 10:05:00".to_string(),
            values: vec![vec![230.0, 1.0], vec![], vec![]],
        };

        let res = snapshot_from_payload(&data);
        assert!(matches!(res, Err(TelemetryError::Malformed(_))));
    }

    #[test]
    fn bad_timestamp_is_malformed() {
        let data = SensorData {
            local_time: "01-03-2024 10:05".to_string(),
            values: vec![vec![0.0; 6], vec![0.0; 6], vec![0.0; 6]],
        };

        let res = snapshot_from_payload(&data);
        assert!(matches!(res, Err(TelemetryError::Malformed(_))));
    }
}
