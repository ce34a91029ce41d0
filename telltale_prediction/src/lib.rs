mod ort_service;
mod routes;
mod server;
mod telemetry;

pub mod app;
pub mod config;
pub mod prediction;
pub mod preprocess;
pub mod registry;
pub mod report;

#[cfg(test)]
mod test_utils;

pub use app::start_app;
