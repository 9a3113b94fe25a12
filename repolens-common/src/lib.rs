//! # RepoLens Common Library
//!
//! Shared code for the RepoLens services:
//! - Error type and result alias
//! - TOML configuration and root folder resolution
//! - Analysis event model and the per-subscriber event broadcaster
//! - Server-Sent Events helpers

pub mod config;
pub mod error;
pub mod events;
pub mod sse;

pub use error::{Error, Result};
