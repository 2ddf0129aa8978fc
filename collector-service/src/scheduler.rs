use std::sync::Arc;
use std::time::Duration;

use meter_client::db::schedule_queries;
use meter_client::domain::ScheduleConfig;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ingest::{IngestReport, Ingestor};

/// Bounded wait for an in-flight tick to observe cancellation before the
/// loop task is abandoned.
const STOP_GRACE: Duration = Duration::from_secs(5);

pub const MIN_INTERVAL_MINUTES: i32 = 1;
pub const MAX_INTERVAL_MINUTES: i32 = 1440;

#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("collection is already running")]
    AlreadyRunning,
    #[error("collection is not running")]
    NotRunning,
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleRequest {
    #[serde(with = "time::serde::rfc3339")]
    pub start_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_at: OffsetDateTime,
    pub interval_minutes: i32,
    #[serde(default)]
    pub created_by: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionStatus {
    pub is_running: bool,
    pub schedule: Option<ScheduleConfig>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_run: Option<OffsetDateTime>,
    pub is_within_schedule: bool,
}

/// Reject a window that ends before it starts or an interval outside
/// [1, 1440] minutes, before anything is persisted.
pub fn validate_schedule(request: &ScheduleRequest) -> Result<(), SchedulerError> {
    if request.end_at <= request.start_at {
        return Err(SchedulerError::InvalidSchedule(
            "end_at must be after start_at".to_string(),
        ));
    }
    if !(MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&request.interval_minutes) {
        return Err(SchedulerError::InvalidSchedule(format!(
            "interval_minutes must be between {MIN_INTERVAL_MINUTES} and {MAX_INTERVAL_MINUTES}"
        )));
    }
    Ok(())
}

/// When the loop should wake next, or `None` once the schedule has expired.
///
/// A window that has not yet opened waits for `start_at` rather than firing
/// early; the last tick is clamped to land exactly on `end_at`.
pub fn compute_next_run(
    now: OffsetDateTime,
    start_at: OffsetDateTime,
    end_at: OffsetDateTime,
    interval: time::Duration,
) -> Option<OffsetDateTime> {
    if now >= end_at {
        return None;
    }
    if now < start_at {
        return Some(start_at);
    }
    Some((now + interval).min(end_at))
}

struct LoopHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

struct RunState {
    schedule: Option<ScheduleConfig>,
    last_run: Option<OffsetDateTime>,
    next_run: Option<OffsetDateTime>,
    loop_handle: Option<LoopHandle>,
}

impl RunState {
    fn idle() -> Self {
        Self {
            schedule: None,
            last_run: None,
            next_run: None,
            loop_handle: None,
        }
    }
}

/// Owns the collection run state. All mutation goes through the internal
/// mutex: API start/stop calls and the loop task serialize against each
/// other, so the state is never written from two places at once.
pub struct CollectionScheduler {
    pool: PgPool,
    ingestor: Arc<Ingestor>,
    state: Arc<Mutex<RunState>>,
}

impl CollectionScheduler {
    pub fn new(pool: PgPool, ingestor: Arc<Ingestor>) -> Self {
        Self {
            pool,
            ingestor,
            state: Arc::new(Mutex::new(RunState::idle())),
        }
    }

    /// Restore the persisted schedule at startup. An active schedule whose
    /// window already closed is marked inactive; otherwise the loop resumes
    /// where the previous process left off.
    pub async fn resume(&self) -> Result<(), SchedulerError> {
        let Some(schedule) = schedule_queries::latest_active(&self.pool).await? else {
            tracing::info!("no active schedule to resume");
            return Ok(());
        };

        if OffsetDateTime::now_utc() >= schedule.end_at {
            tracing::info!(schedule_id = schedule.id, "persisted schedule already expired");
            schedule_queries::deactivate_all(&self.pool).await?;
            return Ok(());
        }

        let mut state = self.state.lock().await;
        if state.loop_handle.is_some() {
            return Ok(());
        }
        tracing::info!(
            schedule_id = schedule.id,
            end_at = %schedule.end_at,
            interval_minutes = schedule.interval_minutes,
            "resuming persisted collection schedule"
        );
        self.launch_locked(&mut state, schedule);
        Ok(())
    }

    /// Start collecting under a new schedule. Any previous schedule row is
    /// deactivated in the same transaction that persists the new one.
    pub async fn start(&self, request: ScheduleRequest) -> Result<CollectionStatus, SchedulerError> {
        validate_schedule(&request)?;

        let mut state = self.state.lock().await;
        if state.loop_handle.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let schedule = schedule_queries::activate(
            &self.pool,
            request.start_at,
            request.end_at,
            request.interval_minutes,
            request.created_by,
        )
        .await?;

        tracing::info!(
            schedule_id = schedule.id,
            start_at = %schedule.start_at,
            end_at = %schedule.end_at,
            interval_minutes = schedule.interval_minutes,
            "collection started"
        );

        self.launch_locked(&mut state, schedule);
        Ok(status_of(&state))
    }

    /// Stop collecting. Signals cancellation, waits up to [`STOP_GRACE`] for
    /// an in-flight tick to exit, then abandons it. The run state is back to
    /// idle either way.
    pub async fn stop(&self) -> Result<CollectionStatus, SchedulerError> {
        {
            let state = self.state.lock().await;
            if state.loop_handle.is_none() {
                return Err(SchedulerError::NotRunning);
            }
        }

        // Clear the stored row before tearing anything down. If this fails
        // the loop keeps running and stop() can be retried; an idle process
        // with a still-active row would be resumed on the next restart.
        schedule_queries::deactivate_all(&self.pool).await?;

        let handle = {
            let mut state = self.state.lock().await;
            state.schedule = None;
            state.next_run = None;
            state.loop_handle.take()
        };

        // The loop may have expired on its own between the check and here.
        if let Some(handle) = handle {
            handle.token.cancel();
            let mut task = handle.task;
            match tokio::time::timeout(STOP_GRACE, &mut task).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!("collection loop did not stop within grace period, aborting it");
                    task.abort();
                }
            }
        }

        tracing::info!("collection stopped");

        let state = self.state.lock().await;
        Ok(status_of(&state))
    }

    /// One-shot ingestion pass, independent of the run state. Does not touch
    /// `next_run`. Best-effort: individual meter failures are already
    /// swallowed by the ingestor.
    pub async fn run_now(&self) -> Result<IngestReport, SchedulerError> {
        let report = self.ingestor.run_once().await?;
        Ok(report)
    }

    pub async fn status(&self) -> CollectionStatus {
        let state = self.state.lock().await;
        status_of(&state)
    }

    fn launch_locked(&self, state: &mut RunState, schedule: ScheduleConfig) {
        let token = CancellationToken::new();
        let task = tokio::spawn(run_loop(
            self.pool.clone(),
            Arc::clone(&self.ingestor),
            Arc::clone(&self.state),
            schedule.clone(),
            token.clone(),
        ));

        // Status must show the next wake time as soon as the loop exists,
        // not only after its first tick completes.
        state.next_run = compute_next_run(
            OffsetDateTime::now_utc(),
            schedule.start_at,
            schedule.end_at,
            schedule.interval(),
        );
        state.schedule = Some(schedule);
        state.loop_handle = Some(LoopHandle { token, task });
    }
}

fn status_of(state: &RunState) -> CollectionStatus {
    let now = OffsetDateTime::now_utc();
    let is_within_schedule = state
        .schedule
        .as_ref()
        .is_some_and(|s| s.contains(now));

    CollectionStatus {
        is_running: state.loop_handle.is_some(),
        schedule: state.schedule.clone(),
        last_run: state.last_run,
        next_run: state.next_run,
        is_within_schedule,
    }
}

/// The periodic collection loop. Ticks, recomputes the next wake time,
/// sleeps. Exits on cancellation or when the schedule window closes; natural
/// expiry also deactivates the persisted schedule so a restart stays idle.
async fn run_loop(
    pool: PgPool,
    ingestor: Arc<Ingestor>,
    state: Arc<Mutex<RunState>>,
    schedule: ScheduleConfig,
    token: CancellationToken,
) {
    let interval = schedule.interval();

    loop {
        let now = OffsetDateTime::now_utc();

        if schedule.contains(now) {
            metrics::counter!("collection_ticks_total").increment(1);
            if let Err(e) = ingestor.run_once().await {
                tracing::error!(error = %e, "collection tick failed, will retry next tick");
            }
            let mut st = state.lock().await;
            st.last_run = Some(now);
        } else {
            tracing::debug!(
                start_at = %schedule.start_at,
                "outside schedule window, skipping tick"
            );
        }

        if token.is_cancelled() {
            return;
        }

        let now = OffsetDateTime::now_utc();
        let Some(next) =
            compute_next_run(now, schedule.start_at, schedule.end_at, interval)
        else {
            tracing::info!(schedule_id = schedule.id, "schedule window closed, going idle");
            if let Err(e) = schedule_queries::deactivate_all(&pool).await {
                tracing::error!(error = %e, "failed to deactivate expired schedule");
            }
            let mut st = state.lock().await;
            st.schedule = None;
            st.next_run = None;
            st.loop_handle = None;
            return;
        };

        {
            let mut st = state.lock().await;
            st.next_run = Some(next);
        }

        let wait = Duration::try_from(next - now).unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{TelemetryError, TelemetrySource};
    use meter_client::domain::MeterSnapshot;
    use sqlx::postgres::PgPoolOptions;
    use time::macros::datetime;

    fn minutes(m: i64) -> time::Duration {
        time::Duration::minutes(m)
    }

    struct OfflineSource;

    #[async_trait::async_trait]
    impl TelemetrySource for OfflineSource {
        async fn fetch(&self, _serial: &str) -> Result<MeterSnapshot, TelemetryError> {
            Err(TelemetryError::Rejected("offline".to_string()))
        }
    }

    /// A scheduler whose pool points at an unreachable store, so every
    /// database call fails on acquire.
    fn unreachable_scheduler() -> CollectionScheduler {
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_secs(2))
            .connect_lazy("postgres://collector@127.0.0.1:1/meters")
            .unwrap();
        let source: Arc<dyn TelemetrySource> = Arc::new(OfflineSource);
        let ingestor = Arc::new(Ingestor::new(pool.clone(), source));
        CollectionScheduler::new(pool, ingestor)
    }

    fn config(start: OffsetDateTime, end: OffsetDateTime, interval: i32) -> ScheduleConfig {
        ScheduleConfig {
            id: 1,
            start_at: start,
            end_at: end,
            interval_minutes: interval,
            is_active: true,
            created_by: None,
            created_at: start,
            updated_at: None,
        }
    }

    async fn tear_down(scheduler: &CollectionScheduler) {
        if let Some(handle) = scheduler.state.lock().await.loop_handle.take() {
            handle.token.cancel();
            handle.task.abort();
        }
    }

    #[tokio::test]
    async fn start_exposes_next_run_before_the_first_tick() {
        let scheduler = unreachable_scheduler();
        let start = OffsetDateTime::now_utc() + minutes(60);
        let schedule = config(start, start + minutes(120), 30);

        {
            let mut state = scheduler.state.lock().await;
            scheduler.launch_locked(&mut state, schedule);
            assert_eq!(state.next_run, Some(start));
            assert!(state.loop_handle.is_some());
        }

        tear_down(&scheduler).await;
    }

    #[tokio::test]
    async fn failed_stop_keeps_the_loop_running_for_a_retry() {
        let scheduler = unreachable_scheduler();
        let start = OffsetDateTime::now_utc() + minutes(60);
        let schedule = config(start, start + minutes(120), 30);
        {
            let mut state = scheduler.state.lock().await;
            scheduler.launch_locked(&mut state, schedule);
        }

        // Deactivation cannot reach the store, so nothing is torn down.
        assert!(matches!(
            scheduler.stop().await,
            Err(SchedulerError::Store(_))
        ));

        let status = scheduler.status().await;
        assert!(status.is_running);
        assert!(status.schedule.is_some());

        // A retry reaches the store again instead of reporting NotRunning.
        assert!(matches!(
            scheduler.stop().await,
            Err(SchedulerError::Store(_))
        ));

        tear_down(&scheduler).await;
    }

    fn request(start: OffsetDateTime, end: OffsetDateTime, interval: i32) -> ScheduleRequest {
        ScheduleRequest {
            start_at: start,
            end_at: end,
            interval_minutes: interval,
            created_by: None,
        }
    }

    #[test]
    fn rejects_window_that_ends_before_it_starts() {
        let req = request(
            datetime!(2024-03-01 12:00:00 UTC),
            datetime!(2024-03-01 11:00:00 UTC),
            30,
        );
        assert!(matches!(
            validate_schedule(&req),
            Err(SchedulerError::InvalidSchedule(_))
        ));
    }

    #[test]
    fn rejects_interval_out_of_range() {
        let start = datetime!(2024-03-01 00:00:00 UTC);
        let end = datetime!(2024-03-02 00:00:00 UTC);

        assert!(matches!(
            validate_schedule(&request(start, end, 0)),
            Err(SchedulerError::InvalidSchedule(_))
        ));
        assert!(matches!(
            validate_schedule(&request(start, end, 1441)),
            Err(SchedulerError::InvalidSchedule(_))
        ));
        assert!(validate_schedule(&request(start, end, 1)).is_ok());
        assert!(validate_schedule(&request(start, end, 1440)).is_ok());
    }

    #[test]
    fn waits_for_window_to_open_instead_of_firing_early() {
        // Started 10 minutes before the window opens: the first wake must be
        // at the window start, not now + interval.
        let start = datetime!(2024-03-01 12:00:00 UTC);
        let end = start + minutes(120);
        let now = start - minutes(10);

        assert_eq!(compute_next_run(now, start, end, minutes(30)), Some(start));
    }

    #[test]
    fn advances_by_interval_inside_the_window() {
        let start = datetime!(2024-03-01 12:00:00 UTC);
        let end = start + minutes(120);
        let now = start + minutes(15);

        assert_eq!(
            compute_next_run(now, start, end, minutes(30)),
            Some(now + minutes(30))
        );
    }

    #[test]
    fn clamps_the_final_wake_to_the_window_end() {
        let start = datetime!(2024-03-01 12:00:00 UTC);
        let end = start + minutes(120);
        let now = end - minutes(10);

        assert_eq!(compute_next_run(now, start, end, minutes(30)), Some(end));
    }

    #[test]
    fn expires_once_the_window_has_closed() {
        let start = datetime!(2024-03-01 12:00:00 UTC);
        let end = start + minutes(120);

        // A tick landing exactly on end_at still runs; the recompute after it
        // sees now == end_at and expires.
        assert_eq!(compute_next_run(end, start, end, minutes(30)), None);
        assert_eq!(compute_next_run(end + minutes(5), start, end, minutes(30)), None);
    }
}
