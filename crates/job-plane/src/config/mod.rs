//! Configuration loading from environment variables.

mod app;
mod database;

pub use app::AppConfig;
pub use database::DatabaseConfig;
