//! HTTP service for buying prepaid credits with crypto.
//!
//! Wraps the `credex` settlement, ledger, and escrow services in an Axum
//! router, with chain adapters configured from a TOML file.
//!
//! # Modules
//!
//! - [`handlers`] - Axum route handlers and router builder
//! - [`auth`] - Bearer credential extraction
//! - [`error`] - JSON error responses
//! - [`config`] - Server configuration with environment variable expansion
//! - [`state`] - Application state wiring
//! - [`shutdown`] - Graceful shutdown on OS signals

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod shutdown;
pub mod state;

pub use handlers::credit_router;
pub use state::{AppState, CreditState};
