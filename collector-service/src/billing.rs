use std::collections::BTreeMap;

use meter_client::db::billing_queries;
use meter_client::db::reading_queries::{self, MeterDayEnergy};
use meter_client::domain::{BillingSummary, DailyCost, MeterCost};
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use time::{Date, Month, OffsetDateTime};

#[derive(thiserror::Error, Debug)]
pub enum BillingError {
    #[error("invalid month: {year}-{month}")]
    InvalidMonth { year: i32, month: u8 },
    #[error("bill for {0} has not been computed yet")]
    NotComputed(String),
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
    #[error("transaction error: {0}")]
    Transaction(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct BillReport {
    pub billing: BillingSummary,
    pub cost_per_day: Vec<DailyCost>,
    pub cost_per_meter: Vec<MeterCost>,
    pub avg_cost_per_weekday: BTreeMap<String, f64>,
}

pub fn month_key(year: i32, month: Month) -> String {
    format!("{year:04}-{:02}", u8::from(month))
}

fn parse_month(year: i32, month: u8) -> Result<Month, BillingError> {
    Month::try_from(month).map_err(|_| BillingError::InvalidMonth { year, month })
}

fn day_bounds(year: i32, month: Month, day: u8) -> Option<(OffsetDateTime, OffsetDateTime)> {
    let date = Date::from_calendar_date(year, month, day).ok()?;
    let start = date.midnight().assume_utc();
    Some((start, start + time::Duration::days(1)))
}

/// Days of the month still to aggregate: fully elapsed (their end is at or
/// before `now`) and not already present in `daily_costs`. A stored day is
/// never recomputed, so a partially elapsed day must not be stored either.
fn pending_days(year: i32, month: Month, existing: &[i32], now: OffsetDateTime) -> Vec<i32> {
    let total_days = time::util::days_in_year_month(year, month);

    (1..=total_days)
        .filter_map(|day| {
            let (_, end) = day_bounds(year, month, day)?;
            if end > now {
                return None;
            }
            let day = i32::from(day);
            (!existing.contains(&day)).then_some(day)
        })
        .collect()
}

/// Convert per-meter energy deltas into cost contributions and a day total.
/// A negative delta means the meter's counter rolled back (e.g. a reset);
/// that meter is skipped for the day rather than billed a negative cost.
fn day_cost_contributions(
    energies: &[MeterDayEnergy],
    tariff: f64,
) -> (Vec<(i64, f64)>, f64) {
    let mut contributions = Vec::with_capacity(energies.len());
    let mut day_total = 0.0;

    for entry in energies {
        if entry.energy < 0.0 {
            tracing::warn!(
                meter_id = entry.meter_id,
                energy = entry.energy,
                "negative energy delta (counter rollback), skipping meter for this day"
            );
            continue;
        }
        let cost = entry.energy * tariff;
        contributions.push((entry.meter_id, cost));
        day_total += cost;
    }

    (contributions, day_total)
}

/// Fold one day's total into the summary. `expensive_day` only moves to a
/// day with strictly greater cost.
fn apply_day(summary: &mut BillingSummary, day: i32, day_total: f64) {
    summary.total_cost += day_total;
    if day_total > summary.expensive_day_cost {
        summary.expensive_day = day;
        summary.expensive_day_cost = day_total;
    }
}

/// Average daily cost grouped by the calendar weekday name of each day.
fn weekday_averages(year: i32, month: Month, daily: &[DailyCost]) -> BTreeMap<String, f64> {
    let mut sums: BTreeMap<String, (f64, u32)> = BTreeMap::new();

    for row in daily {
        let Ok(day) = u8::try_from(row.day) else {
            continue;
        };
        let Ok(date) = Date::from_calendar_date(year, month, day) else {
            continue;
        };
        let entry = sums.entry(date.weekday().to_string()).or_insert((0.0, 0));
        entry.0 += row.cost;
        entry.1 += 1;
    }

    sums.into_iter()
        .map(|(name, (sum, count))| (name, sum / f64::from(count)))
        .collect()
}

/// Incremental, idempotent conversion of stored readings into billing rows.
/// The recurring job and the explicit recalculate operation share this code.
pub struct BillingEngine {
    pool: PgPool,
    tariff: f64,
}

impl BillingEngine {
    pub fn new(pool: PgPool, tariff: f64) -> Self {
        Self { pool, tariff }
    }

    /// Aggregate any not-yet-processed days of the month into billing rows.
    /// Already-processed days are skipped, so calling this twice with no new
    /// readings in between is a no-op. All writes commit atomically.
    pub async fn calculate_bill(&self, year: i32, month: u8) -> Result<(), BillingError> {
        let month = parse_month(year, month)?;

        let mut tx = self.pool.begin().await?;
        self.aggregate_month(&mut *tx, year, month).await?;
        tx.commit().await?;

        Ok(())
    }

    /// Forced recompute: clear every billing row for the month, then
    /// aggregate from scratch, all in one transaction.
    pub async fn recalculate_bill(&self, year: i32, month: u8) -> Result<(), BillingError> {
        let month = parse_month(year, month)?;
        let key = month_key(year, month);

        let mut tx = self.pool.begin().await?;
        billing_queries::clear_month(&mut *tx, &key).await?;
        self.aggregate_month(&mut *tx, year, month).await?;
        tx.commit().await?;

        tracing::info!(month_key = %key, "billing recomputed from scratch");
        Ok(())
    }

    async fn aggregate_month(
        &self,
        conn: &mut PgConnection,
        year: i32,
        month: Month,
    ) -> Result<(), BillingError> {
        let key = month_key(year, month);
        let now = OffsetDateTime::now_utc();

        let mut summary = billing_queries::summary(&mut *conn, &key)
            .await?
            .unwrap_or_else(|| BillingSummary::zeroed(&key));
        let existing = billing_queries::daily_cost_days(&mut *conn, &key).await?;
        let days = pending_days(year, month, &existing, now);

        if days.is_empty() {
            tracing::debug!(month_key = %key, "no new days to aggregate");
        }

        let mut processed = existing.len();

        for day in days {
            let Some((start, end)) = day_bounds(year, month, day as u8) else {
                continue;
            };
            let energies = reading_queries::day_energy(&mut *conn, start, end).await?;
            let (contributions, day_total) = day_cost_contributions(&energies, self.tariff);

            for (meter_id, cost) in &contributions {
                billing_queries::merge_meter_cost(&mut *conn, &key, *meter_id, *cost).await?;
            }

            billing_queries::insert_daily_cost(
                &mut *conn,
                &DailyCost {
                    month_key: key.clone(),
                    day,
                    cost: day_total,
                },
            )
            .await?;

            apply_day(&mut summary, day, day_total);
            processed += 1;
            metrics::counter!("billing_days_processed_total").increment(1);
        }

        summary.avg_cost_per_day = if processed > 0 {
            summary.total_cost / processed as f64
        } else {
            0.0
        };

        billing_queries::upsert_summary(&mut *conn, &summary).await?;
        Ok(())
    }

    /// The month's bill plus its breakdowns. A month that was never
    /// aggregated is reported as not computed, which is distinct from a
    /// computed month that happens to cost zero.
    pub async fn get_bill(&self, year: i32, month: u8) -> Result<BillReport, BillingError> {
        let month = parse_month(year, month)?;
        let key = month_key(year, month);

        let summary = billing_queries::summary(&self.pool, &key)
            .await?
            .ok_or_else(|| BillingError::NotComputed(key.clone()))?;
        let cost_per_day = billing_queries::daily_costs(&self.pool, &key).await?;
        let cost_per_meter = billing_queries::meter_costs(&self.pool, &key).await?;
        let avg_cost_per_weekday = weekday_averages(year, month, &cost_per_day);

        Ok(BillReport {
            billing: summary,
            cost_per_day,
            cost_per_meter,
            avg_cost_per_weekday,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn energy(meter_id: i64, energy: f64) -> MeterDayEnergy {
        MeterDayEnergy { meter_id, energy }
    }

    #[test]
    fn month_key_is_zero_padded() {
        assert_eq!(month_key(2024, Month::March), "2024-03");
        assert_eq!(month_key(2024, Month::December), "2024-12");
    }

    #[test]
    fn negative_energy_delta_skips_the_meter_for_the_day() {
        let energies = vec![energy(1, 10.0), energy(2, -4.0), energy(3, 2.5)];
        let (contributions, total) = day_cost_contributions(&energies, 8.0);

        assert_eq!(contributions, vec![(1, 80.0), (3, 20.0)]);
        assert_eq!(total, 100.0);
    }

    #[test]
    fn day_with_no_readings_costs_nothing() {
        let (contributions, total) = day_cost_contributions(&[], 8.0);
        assert!(contributions.is_empty());
        assert_eq!(total, 0.0);
    }

    #[test]
    fn expensive_day_only_moves_to_a_strictly_greater_cost() {
        let mut summary = BillingSummary::zeroed("2024-03");

        apply_day(&mut summary, 1, 50.0);
        assert_eq!(summary.expensive_day, 1);

        // Equal cost on a later day must not displace the earlier one.
        apply_day(&mut summary, 2, 50.0);
        assert_eq!(summary.expensive_day, 1);
        assert_eq!(summary.expensive_day_cost, 50.0);

        apply_day(&mut summary, 3, 50.1);
        assert_eq!(summary.expensive_day, 3);
        assert_eq!(summary.expensive_day_cost, 50.1);

        assert_eq!(summary.total_cost, 150.1);
    }

    #[test]
    fn pending_days_excludes_stored_and_unfinished_days() {
        let now = datetime!(2024-01-03 12:00:00 UTC);

        // Day 3 has not fully elapsed yet and day 1 is already stored.
        let days = pending_days(2024, Month::January, &[1], now);
        assert_eq!(days, vec![2]);
    }

    #[test]
    fn pending_days_is_empty_when_everything_is_processed() {
        let now = datetime!(2024-02-15 00:00:00 UTC);
        let existing: Vec<i32> = (1..=14).collect();

        let days = pending_days(2024, Month::February, &existing, now);
        assert!(days.is_empty());
    }

    #[test]
    fn recurring_job_reaches_the_final_day_after_the_month_turns() {
        // Late on the last day of January the day has not fully elapsed,
        // so it is not yet eligible.
        let late = datetime!(2024-01-31 23:30:00 UTC);
        assert!(!pending_days(2024, Month::January, &[], late).contains(&31));

        // The first pass after midnight still carries January as a billing
        // period, and day 31 is now elapsed and pending.
        let after = datetime!(2024-02-01 00:30:00 UTC);
        assert!(crate::jobs::billing_periods(after).contains(&(2024, 1)));

        let stored: Vec<i32> = (1..=30).collect();
        assert_eq!(pending_days(2024, Month::January, &stored, after), vec![31]);
    }

    #[test]
    fn pending_days_covers_a_whole_past_month() {
        let now = datetime!(2024-03-10 00:00:00 UTC);

        let days = pending_days(2024, Month::February, &[], now);
        assert_eq!(days.len(), 29); // 2024 is a leap year
        assert_eq!(days.first(), Some(&1));
        assert_eq!(days.last(), Some(&29));
    }

    #[test]
    fn weekday_averages_group_by_calendar_weekday() {
        // 2024-01-01 was a Monday.
        let daily = vec![
            DailyCost { month_key: "2024-01".into(), day: 1, cost: 10.0 },
            DailyCost { month_key: "2024-01".into(), day: 8, cost: 20.0 },
            DailyCost { month_key: "2024-01".into(), day: 2, cost: 30.0 },
        ];

        let avgs = weekday_averages(2024, Month::January, &daily);

        assert_eq!(avgs.get("Monday"), Some(&15.0));
        assert_eq!(avgs.get("Tuesday"), Some(&30.0));
        assert_eq!(avgs.len(), 2);
    }
}
