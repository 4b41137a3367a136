#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Core types for buying prepaid credits with cryptocurrency.
//!
//! Accounts buy credits in fixed tiers by paying Bitcoin, or USDC on Polygon,
//! Ethereum, or Solana, to a deposit address derived per purchase. A
//! marketplace can then hold, release, and refund credits in escrow. This crate
//! is chain-agnostic: address derivation and chain verification for each
//! family live in separate crates implementing [`derive::AddressDeriver`] and
//! [`adapter::ChainAdapter`].
//!
//! # Overview
//!
//! A purchase is quoted by [`settlement::SettlementService::initiate`], polled
//! until the chain confirms it, and claimed exactly once into a new or existing
//! account. Every balance change goes through a [`store::CreditStore`]
//! operation that updates the balance and appends a log row atomically.
//!
//! # Modules
//!
//! - [`account`] - Accounts, credentials, and credit log rows
//! - [`adapter`] - Chain adapter contract, confirmation rules, and registry
//! - [`amount`] - Smallest-unit conversions and the 95% payment tolerance
//! - [`cache`] - TTL value cache and per-key async locks
//! - [`chain`] - Supported chains and CAIP-2 identifiers
//! - [`derive`] - Deterministic deposit address derivation
//! - [`error`] - Error taxonomy
//! - [`escrow`] - Escrow holds
//! - [`ledger`] - Balance mutations and account lookups
//! - [`payment`] - Payment requests
//! - [`settlement`] - Quote, verify, and claim orchestration
//! - [`store`] - Atomic persistence (in-memory and `SQLite`)
//! - [`tier`] - Purchasable tiers
//! - [`timestamp`] - Unix timestamps
//!
//! # Feature Flags
//!
//! - `sqlite` - Enables [`store::SqliteStore`]
//! - `telemetry` - Enables tracing instrumentation for debugging and monitoring

pub mod account;
pub mod adapter;
pub mod amount;
pub mod cache;
pub mod chain;
pub mod derive;
pub mod error;
pub mod escrow;
pub mod ledger;
pub mod payment;
pub mod settlement;
pub mod store;
pub mod tier;
pub mod timestamp;

pub use chain::{Chain, ChainFamily};
pub use error::{ChainError, CreditError};
