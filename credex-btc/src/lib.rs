#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Bitcoin support for credex.
//!
//! # Modules
//!
//! - [`xpub`] - Watch-only BIP-32 derivation of P2PKH deposit addresses
//! - [`esplora`] - Esplora REST client for balances, transactions, and tip height
//! - [`price`] - BTC/USD spot price oracle with a short-lived cache
//!
//! [`BitcoinAdapter`] implements [`credex::adapter::ChainAdapter`] on top of
//! the client and oracle, and [`BitcoinDeriver`] implements
//! [`credex::derive::AddressDeriver`].
//!
//! # Feature Flags
//!
//! - `telemetry` - Enables tracing instrumentation of provider calls

mod adapter;
pub mod esplora;
pub mod price;
pub mod xpub;

pub use adapter::BitcoinAdapter;
pub use esplora::{EsploraClient, EsploraError};
pub use price::PriceOracle;
pub use xpub::{BitcoinDeriver, BitcoinNetwork, ExtendedPubKey};
