//! Job lifecycle control plane.
//!
//! Tracks every asynchronous workload submitted to the compute backend
//! from submission through scheduling, execution, optional
//! cancellation/revert, and terminal accounting. State lives in a job
//! store offering atomic conditional updates; progress arrives as
//! workflow-engine events over NATS; billing is reconciled exactly once
//! when a job reaches a terminal state.

pub mod clients;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod model;
pub mod nats;
pub mod result_ext;
pub mod services;
pub mod store;

pub use error::{AppError, AppResult};
