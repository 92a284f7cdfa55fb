//! Core asynchronous processing substrate shared by `kiss-api` and
//! `luca-api`: the key-value capability surface, distributed lock manager,
//! rate limiter, deduplicator, process configuration, and at-rest crypto.
//!
//! Every other crate in this workspace is built on top of the traits and
//! types defined here — nothing above this layer touches SQLite or process
//! configuration directly.

pub mod config;
pub mod crypto;
pub mod dedup;
pub mod kv;
pub mod lock;
pub mod ratelimit;
