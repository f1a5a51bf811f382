//! Chorus transaction protocol crate.
//!
//! This crate provides the leaderless multi-shard transaction core used by
//! chorus_store. The API surface is intentionally small: higher layers supply
//! a `DataStore` and a `Transport`, then drive transactions through `Node`.

pub mod protocol;
