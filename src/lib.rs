pub mod compiled;
pub mod compiler;
pub mod config;
pub mod mash;
pub mod queue;
pub mod routes;
pub mod sandbox;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod value;
pub mod verdict;
pub mod web_server;
pub mod worker;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
