use serde::Serialize;

/// One row per month, updated monotonically as new days are aggregated.
/// `expensive_day` only ever moves to a day with strictly greater cost.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BillingSummary {
    pub month_key: String,
    pub total_cost: f64,
    pub avg_cost_per_day: f64,
    pub expensive_day: i32,
    pub expensive_day_cost: f64,
}

impl BillingSummary {
    pub fn zeroed(month_key: &str) -> Self {
        Self {
            month_key: month_key.to_string(),
            total_cost: 0.0,
            avg_cost_per_day: 0.0,
            expensive_day: 0,
            expensive_day_cost: 0.0,
        }
    }
}

/// Sum of all meters' costs for one calendar day. At most one row per
/// (month_key, day); a day already present is skipped on recompute.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DailyCost {
    pub month_key: String,
    pub day: i32,
    pub cost: f64,
}

/// Running accumulation of one meter's cost within a month. New daily
/// contributions are merged in, never replaced.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MeterCost {
    pub month_key: String,
    pub meter_id: i64,
    pub cost: f64,
}
