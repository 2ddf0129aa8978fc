pub mod billing_queries;
pub mod health_queries;
pub mod meter_queries;
pub mod reading_queries;
pub mod schedule_queries;
