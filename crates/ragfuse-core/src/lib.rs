//! ragfuse-core - Core types and traits for the hybrid retrieval engine
//!
//! This crate provides the data model, the adapter and store contracts,
//! configuration and error handling shared by the ragfuse crates.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::*;
pub use error::{RagError, Result};
pub use traits::*;
pub use types::*;
