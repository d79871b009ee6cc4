//! cacheio Common - Shared types and utilities
//!
//! This crate provides the identity types, object classification, I/O flags,
//! error definitions and configuration used across all cacheio crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, EngineConfig, PageCacheConfig, WritebackConfig};
pub use error::{Error, Result};
pub use types::*;
