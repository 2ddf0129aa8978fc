use time::OffsetDateTime;

/// One phase's slice of a meter snapshot as delivered by the sensor API.
///
/// `grid_consumption` and `exported_power` are cumulative counters, not
/// instantaneous values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseSnapshot {
    pub voltage: f64,
    pub current: f64,
    pub active_power: f64,
    pub power_factor: f64,
    pub grid_consumption: f64,
    pub exported_power: f64,
}

/// A single fetched snapshot: one local timestamp plus all three phases.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterSnapshot {
    pub ts: OffsetDateTime,
    pub phase_a: PhaseSnapshot,
    pub phase_b: PhaseSnapshot,
    pub phase_c: PhaseSnapshot,
}

/// A stored reading row. Append-only; a given (meter_id, ts) pair is never
/// overwritten.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Reading {
    pub meter_id: i64,
    pub ts: OffsetDateTime,

    pub phase_a_voltage: f64,
    pub phase_a_current: f64,
    pub phase_a_active_power: f64,
    pub phase_a_power_factor: f64,
    pub phase_a_grid_consumption: f64,
    pub phase_a_exported_power: f64,

    pub phase_b_voltage: f64,
    pub phase_b_current: f64,
    pub phase_b_active_power: f64,
    pub phase_b_power_factor: f64,
    pub phase_b_grid_consumption: f64,
    pub phase_b_exported_power: f64,

    pub phase_c_voltage: f64,
    pub phase_c_current: f64,
    pub phase_c_active_power: f64,
    pub phase_c_power_factor: f64,
    pub phase_c_grid_consumption: f64,
    pub phase_c_exported_power: f64,
}

/// Per-phase active power at one timestamp, used by the health monitor.
#[derive(Debug, Clone, Copy, sqlx::FromRow)]
pub struct PowerSample {
    pub phase_a_active_power: f64,
    pub phase_b_active_power: f64,
    pub phase_c_active_power: f64,
}
