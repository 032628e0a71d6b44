//! Hoster chain: turns provider embed links into playable stream sources.
//!
//! Each [`Hoster`] matches embed URLs by domain and path, fetches the hoster's
//! media endpoint, sends encrypted payloads to an external [`DecryptionClient`]
//! and decodes the result into [`StreamSource`]s. [`HosterManager`] keeps the
//! registry and applies per-hoster timeouts and cancellation.

pub mod config;
pub mod decrypt;
pub mod error;
pub mod hoster;
pub mod hosters;
pub mod manager;
pub mod source;

pub use config::HosterConfig;
pub use decrypt::{DecryptionClient, DecryptionHealth, HttpDecryptionClient};
pub use error::HosterError;
pub use hoster::{EncodedPayload, Hoster, HosterBase};
pub use manager::{HosterManager, HosterResolution};
pub use source::{
    RawSource, StreamSource, StreamType, finalize_sources, is_non_public_ip, is_restricted_host,
    quality_rank, validate_source_url,
};
