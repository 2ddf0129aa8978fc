mod billing;
mod health;
mod meter;
mod reading;
mod schedule;

pub use billing::{BillingSummary, DailyCost, MeterCost};
pub use health::MeterHealth;
pub use meter::Meter;
pub use reading::{MeterSnapshot, PhaseSnapshot, PowerSample, Reading};
pub use schedule::ScheduleConfig;
