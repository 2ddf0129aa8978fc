use serde::Serialize;
use time::OffsetDateTime;

/// Per-meter health state, written only by the health monitor tick.
/// `last_alert_sent_at` is set only when an alert was actually delivered.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MeterHealth {
    pub meter_id: i64,
    pub is_flatline: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_alert_sent_at: Option<OffsetDateTime>,
    pub alert_active: bool,
}
