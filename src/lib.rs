//! # procq
//!
//! Process queue and wait-condition scheduler.
//!
//! Tracks every process instance from submission to a terminal status,
//! hands enqueued processes to agents FIFO, resolves suspended processes
//! whose wait conditions are met, and delivers cancel commands to agents.
//! Postgres backed via sqlx, with an in-memory store of the same semantics.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod store;
pub mod telemetry;
