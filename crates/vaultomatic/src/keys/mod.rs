//! Unseal Keys
//!
//! - `material`: the key document and share sampling
//! - `cache`: in-memory cache with coalesced background persistence
//! - `store`: durable storage behind the cache

mod cache;
mod material;
mod store;

pub use cache::KeyCache;
pub use material::{KeyError, UnsealKeys};
pub use store::{EtcdKeyStore, KeyStore, StoreError};
