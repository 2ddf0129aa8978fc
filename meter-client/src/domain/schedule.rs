use serde::Serialize;
use time::OffsetDateTime;

/// A persisted collection schedule. Immutable once created except for the
/// `is_active` flag; at most one row is active at a time.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ScheduleConfig {
    pub id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub start_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_at: OffsetDateTime,
    pub interval_minutes: i32,
    pub is_active: bool,
    pub created_by: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl ScheduleConfig {
    /// Whether `at` falls inside the schedule's collection window.
    pub fn contains(&self, at: OffsetDateTime) -> bool {
        at >= self.start_at && at <= self.end_at
    }

    pub fn interval(&self) -> time::Duration {
        time::Duration::minutes(i64::from(self.interval_minutes))
    }
}
