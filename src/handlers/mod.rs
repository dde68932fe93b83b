pub mod demo;
pub mod metrics_handler;
pub mod query_api;
