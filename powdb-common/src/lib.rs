//! # powdb common library
//!
//! Shared code for the places-of-worship tools:
//! - Common error type
//! - Configuration file discovery and TOML loading
//! - Human-readable size formatting

pub mod config;
pub mod error;
pub mod human_size;

pub use error::{Error, Result};
