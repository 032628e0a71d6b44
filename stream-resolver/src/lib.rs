//! stream-resolver library crate.
//!
//! Resolves playable stream sources for movies and tv episodes from a ranked
//! set of providers, with circuit breaking, health scoring, caching,
//! tracked workers and an HLS playlist proxy.

pub mod api;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod extraction;
pub mod logging;
pub mod proxy;
pub mod services;
pub mod worker;

pub use error::{Error, Result};
