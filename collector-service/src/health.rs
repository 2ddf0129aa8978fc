use std::sync::Arc;

use meter_client::db::{health_queries, meter_queries, reading_queries};
use meter_client::domain::{Meter, MeterHealth, PowerSample};
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::config::HealthConfig;
use crate::notify::NotificationSink;

/// Rounded to whole power units, a phase is flat when its spread over the
/// window stays within `eps`.
fn phase_is_flat(values: impl IntoIterator<Item = f64>, eps: i64) -> bool {
    let bounds = values.into_iter().fold(None, |acc: Option<(i64, i64)>, v| {
        let rounded = v.round() as i64;
        Some(match acc {
            None => (rounded, rounded),
            Some((min, max)) => (min.min(rounded), max.max(rounded)),
        })
    });

    match bounds {
        Some((min, max)) => max - min <= eps,
        None => true,
    }
}

/// A meter is flatlined only when all three phases are flat; one noisy phase
/// is enough to prove the meter alive. Fewer than `min_points` samples is
/// insufficient evidence of a fault, never a flatline.
fn evaluate_flatline(samples: &[PowerSample], min_points: usize, eps: i64) -> bool {
    if samples.len() < min_points {
        return false;
    }

    phase_is_flat(samples.iter().map(|s| s.phase_a_active_power), eps)
        && phase_is_flat(samples.iter().map(|s| s.phase_b_active_power), eps)
        && phase_is_flat(samples.iter().map(|s| s.phase_c_active_power), eps)
}

/// Send one flatline alert, blocking until delivery completes or fails.
/// Returns the send time on success; a delivery failure is logged and
/// reported as `None` so the caller still persists health state.
async fn dispatch_alert(
    sink: &dyn NotificationSink,
    recipient: &str,
    meter: &Meter,
    checked_at: OffsetDateTime,
    window_minutes: i64,
    eps: i64,
) -> Option<OffsetDateTime> {
    let subject = format!("Meter DOWN (flatline) - {} ({})", meter.name, meter.serial);
    let body = format!(
        "Meter is DOWN (flatline detected)\n\n\
         Meter ID : {}\n\
         Name     : {}\n\
         Serial   : {}\n\
         Checked  : {} UTC\n\
         Window   : {window_minutes} minutes\n\
         Spread   : <= {eps} unit(s) on all phases\n",
        meter.meter_id, meter.name, meter.serial, checked_at,
    );

    match sink.send(recipient, &subject, &body).await {
        Ok(()) => {
            metrics::counter!("health_alerts_sent_total").increment(1);
            Some(OffsetDateTime::now_utc())
        }
        Err(e) => {
            metrics::counter!("health_alert_failures_total").increment(1);
            tracing::warn!(
                meter_id = meter.meter_id,
                error = %e,
                "flatline alert delivery failed"
            );
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct HealthReport {
    pub checked: usize,
    pub flatlined: usize,
    pub alerts_sent: usize,
}

/// Detects stuck meters from a rolling window of power readings and keeps
/// per-meter health rows current.
pub struct HealthMonitor {
    pool: PgPool,
    window_minutes: i64,
    min_points: usize,
    eps: i64,
    sink: Option<Arc<dyn NotificationSink>>,
    recipient: Option<String>,
}

impl HealthMonitor {
    pub fn new(
        pool: PgPool,
        config: &HealthConfig,
        sink: Option<Arc<dyn NotificationSink>>,
        recipient: Option<String>,
    ) -> Self {
        Self {
            pool,
            window_minutes: config.window_minutes,
            min_points: config.min_points,
            eps: config.eps,
            sink,
            recipient,
        }
    }

    /// One health tick over every registered meter. Per-meter query or alert
    /// failures are logged and never stop the pass; health state is persisted
    /// for each meter regardless of alert outcome.
    pub async fn update_health(&self) -> anyhow::Result<HealthReport> {
        let now = OffsetDateTime::now_utc();
        let since = now - time::Duration::minutes(self.window_minutes);

        if self.sink.is_none() {
            tracing::debug!("email alerting not configured; flatline alerts will be skipped");
        }

        let meters = meter_queries::list_meters(&self.pool).await?;
        let mut report = HealthReport::default();

        for meter in &meters {
            let samples = match reading_queries::power_window(&self.pool, meter.meter_id, since).await {
                Ok(samples) => samples,
                Err(e) => {
                    tracing::error!(meter_id = meter.meter_id, error = %e, "failed to load power window");
                    continue;
                }
            };

            let flat = evaluate_flatline(&samples, self.min_points, self.eps);
            let mut last_alert_sent_at = None;

            if flat {
                report.flatlined += 1;
                tracing::warn!(
                    meter_id = meter.meter_id,
                    samples = samples.len(),
                    "meter is flatlined"
                );

                if let (Some(sink), Some(recipient)) = (&self.sink, &self.recipient) {
                    last_alert_sent_at = dispatch_alert(
                        sink.as_ref(),
                        recipient,
                        meter,
                        now,
                        self.window_minutes,
                        self.eps,
                    )
                    .await;
                    if last_alert_sent_at.is_some() {
                        report.alerts_sent += 1;
                    }
                }
            }

            let health = MeterHealth {
                meter_id: meter.meter_id,
                is_flatline: flat,
                checked_at: now,
                last_alert_sent_at,
                alert_active: flat,
            };

            if let Err(e) = health_queries::upsert_health(&self.pool, &health).await {
                tracing::error!(meter_id = meter.meter_id, error = %e, "failed to persist health state");
                continue;
            }
            report.checked += 1;
        }

        tracing::info!(
            checked = report.checked,
            flatlined = report.flatlined,
            alerts_sent = report.alerts_sent,
            "health pass complete"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn samples(rows: &[(f64, f64, f64)]) -> Vec<PowerSample> {
        rows.iter()
            .map(|&(a, b, c)| PowerSample {
                phase_a_active_power: a,
                phase_b_active_power: b,
                phase_c_active_power: c,
            })
            .collect()
    }

    #[test]
    fn spread_within_eps_is_flat() {
        assert!(phase_is_flat(vec![100.0, 100.4, 99.6, 100.0], 1));
        assert!(!phase_is_flat(vec![100.0, 103.0, 100.0], 1));
    }

    #[test]
    fn rounding_happens_before_the_spread_check() {
        // 10.4 rounds to 10 and 11.4 to 11: spread 1, still flat.
        assert!(phase_is_flat(vec![10.4, 11.4], 1));
        // 10.4 rounds to 10 and 12.4 to 12: spread 2, alive.
        assert!(!phase_is_flat(vec![10.4, 12.4], 1));
    }

    #[test]
    fn too_few_samples_is_never_a_flatline() {
        let rows = samples(&[(5.0, 5.0, 5.0); 9]);
        assert!(!evaluate_flatline(&rows, 10, 1));
    }

    #[test]
    fn all_phases_flat_across_enough_samples_is_a_flatline() {
        let rows = samples(&[(120.0, 119.8, 120.3); 10]);
        assert!(evaluate_flatline(&rows, 10, 1));
    }

    #[test]
    fn one_noisy_phase_proves_the_meter_alive() {
        let mut rows = samples(&[(120.0, 120.0, 120.0); 10]);
        rows[4].phase_c_active_power = 160.0;
        assert!(!evaluate_flatline(&rows, 10, 1));
    }

    struct FailingSink;

    #[async_trait::async_trait]
    impl NotificationSink for FailingSink {
        async fn send(&self, _: &str, _: &str, _: &str) -> anyhow::Result<()> {
            anyhow::bail!("smtp unreachable")
        }
    }

    #[tokio::test]
    async fn alert_delivery_failure_is_contained() {
        let meter = Meter {
            meter_id: 7,
            name: "substation-7".to_string(),
            serial: "SN-7".to_string(),
        };

        let sent = dispatch_alert(
            &FailingSink,
            "ops@example.com",
            &meter,
            datetime!(2024-03-01 10:00:00 UTC),
            60,
            1,
        )
        .await;

        assert!(sent.is_none());
    }
}
