#![deny(missing_docs)]
//! A backend-agnostic distributed key/value store with named stores and
//! named distributed locks, over memcached, Redis Cluster or Cloudant.

pub use context::DpsContext;
pub use config::DpsConfig;
pub use engines::{DpsEngine, EngineFactory, TtlEncoding};
pub use error::{DpsError, ErrorChannel, Result};
pub use catalog::StoreInfo;
pub use iterator::StoreIterator;

pub mod catalog;
pub mod client;
pub mod config;
mod context;
pub mod encoding;
pub mod engines;
mod error;
pub mod iterator;
pub mod lock;
