use std::future::Future;
use std::time::Duration;

use time::{Month, OffsetDateTime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Spawn a recurring background job. Each job is its own task with its own
/// timer; a slow tick delays only that job's next tick, never another
/// subsystem's. At most one tick of a given job is ever in flight.
///
/// Job errors are logged and the loop keeps going; the worst case is a tick
/// that did nothing useful.
pub fn spawn_recurring<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(job = name, period_secs = period.as_secs(), "recurring job scheduled");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!(job = name, "recurring job stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if let Err(e) = job().await {
                tracing::error!(job = name, error = %e, "job tick failed, will retry next tick");
            }
        }
    })
}

/// The (year, month) pairs the recurring billing job should aggregate:
/// the previous calendar month followed by the current one.
///
/// The previous month stays in the rotation because its last day only
/// becomes fully elapsed after the month ticks over; once every day of
/// that month is stored the extra pass is a no-op.
pub fn billing_periods(now: OffsetDateTime) -> [(i32, u8); 2] {
    let previous = match now.month() {
        Month::January => (now.year() - 1, 12),
        month => (now.year(), u8::from(month) - 1),
    };
    [previous, (now.year(), u8::from(now.month()))]
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn billing_periods_cover_the_previous_and_current_month() {
        assert_eq!(
            billing_periods(datetime!(2024-03-31 23:59:59 UTC)),
            [(2024, 2), (2024, 3)]
        );
        // Right after a month turns, the month that just ended is still
        // aggregated so its final day is not skipped.
        assert_eq!(
            billing_periods(datetime!(2024-02-01 00:30:00 UTC)),
            [(2024, 1), (2024, 2)]
        );
    }

    #[test]
    fn billing_periods_wrap_the_year_boundary() {
        assert_eq!(
            billing_periods(datetime!(2025-01-01 00:00:00 UTC)),
            [(2024, 12), (2025, 1)]
        );
    }
}
