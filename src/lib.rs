pub mod compare;
pub mod config;
pub mod database;
pub mod error;
pub mod judge;
pub mod model;
mod queue;
pub mod routes;
pub mod sandbox;
pub mod scheduler;
pub mod scoring;
pub mod store;
pub mod web_server;
mod worker;

use chrono::{DateTime, SecondsFormat, Utc};

pub fn create_timestamp() -> String {
    format_timestamp(&Utc::now())
}

pub fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}
