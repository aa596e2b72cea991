pub mod admin;
pub mod app;
pub mod client;
pub mod config;
pub mod config_store;
pub mod crypto;
pub mod db;
pub mod error;
pub mod events;
pub mod extractor;
pub mod job_queue;
pub mod linker;
pub mod mail;
pub mod models;
pub mod orchestrator;
pub mod rate_limiter;
pub mod routes;
pub mod store;
pub mod telemetry;
pub mod webhooks;

#[cfg(test)]
mod testing;
