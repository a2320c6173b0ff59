//! Repository metadata cache library
//!
//! This module exposes the cache core so the CLI and other front ends share one implementation.

pub mod cache;
pub mod config;
pub mod github;
