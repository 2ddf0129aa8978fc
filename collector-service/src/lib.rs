pub mod api;
pub mod billing;
pub mod config;
pub mod health;
pub mod ingest;
pub mod jobs;
pub mod notify;
pub mod observability;
pub mod scheduler;

pub use scheduler::CollectionScheduler;
