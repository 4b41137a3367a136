#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! EVM (Polygon, Ethereum) support for credex.
//!
//! Deposits are USDC transfers to an address derived per payment token. Funds
//! are found by scanning ERC-20 `Transfer` logs; confirmation depth is counted
//! from the chain head.
//!
//! # Modules
//!
//! - [`derive`] - HMAC-based secp256k1 deposit addresses
//! - [`networks`] - Chain IDs, USDC deployments, and per-network defaults
//! - [`source`] - `Transfer` log queries over an alloy provider
//!
//! [`EvmAdapter`] implements [`credex::adapter::ChainAdapter`] for one
//! [`EvmNetwork`].
//!
//! # Feature Flags
//!
//! - `telemetry` - Enables tracing instrumentation of provider calls

mod adapter;
pub mod derive;
pub mod networks;
pub mod source;

pub use adapter::EvmAdapter;
pub use derive::EvmDeriver;
pub use networks::EvmNetwork;
pub use source::{RpcTransferSource, TokenTransfer, TransferSource};
