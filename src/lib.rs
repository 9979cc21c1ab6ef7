pub mod admission;
pub mod aggregator;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod runner;
pub mod sandbox;
pub mod submission;
pub mod worker;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
