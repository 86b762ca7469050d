//! CurveBot execution core library
//!
//! Exposes the pipeline modules for the binary and for integration tests.

pub mod chat;
pub mod db;
pub mod discovery;
pub mod errors;
pub mod executor;
pub mod idempotency;
pub mod models;
pub mod monitor;
pub mod notify;
pub mod opportunity;
pub mod providers;
pub mod router;
pub mod wallet;
