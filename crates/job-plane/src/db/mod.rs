//! Database connectivity for the job lifecycle control plane.

pub mod pool;

pub use pool::{create_pool, DbPool};
