//! Stream layers
//!
//! - [`channel`] - The [`Channel`](channel::Channel) trait plus file and memory channels
//! - [`sparse`] - Block-merging sparse memory buffer
//! - [`backing`] - Spill file arena
//! - [`tiered`] - Sparse buffer that spills to disk and recalls itself
//! - [`encryption`] - Block cipher providers
//! - [`overlay`] - Block-aligned cipher overlay with read/write caches
//! - [`header`] - Version record format
//! - [`versioned`] - Version-gated channel
//! - [`compression`] - Chunked compression records
//! - [`part`] - Package part composition
//! - [`digest`] - Content digests for signatures
//! - [`config`] - TOML-backed configuration
//! - [`error`] - Error types

pub mod backing;
pub mod channel;
pub mod compression;
pub mod config;
pub mod digest;
pub mod encryption;
pub mod error;
pub mod header;
pub mod overlay;
pub mod part;
pub mod sparse;
pub mod tiered;
pub mod versioned;
