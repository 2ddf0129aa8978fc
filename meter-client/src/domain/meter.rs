use serde::Serialize;

/// A registered metering device. The registry itself is managed elsewhere;
/// this service only reads it to know which serials to poll.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Meter {
    pub meter_id: i64,
    pub name: String,
    pub serial: String,
}
