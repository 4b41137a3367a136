#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Solana support for credex.
//!
//! A deposit address is an ed25519 public key derived per payment token.
//! Payers send USDC to it, which lands in its associated token account; the
//! adapter reads that account's balance at two commitment levels.
//!
//! # Modules
//!
//! - [`derive`] - HMAC-seeded deposit owners
//! - [`networks`] - USDC mint, ATA program, and the default profile
//! - [`source`] - JSON-RPC ledger queries
//!
//! # Feature Flags
//!
//! - `telemetry` - Enables tracing instrumentation of provider calls

mod adapter;
pub mod derive;
pub mod networks;
pub mod source;

pub use adapter::SolanaAdapter;
pub use derive::SolanaDeriver;
pub use source::{LedgerSource, RpcLedgerSource, SignatureInfo};
