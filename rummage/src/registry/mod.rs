//! OCI registry client: manifests, configs and layer blobs over HTTP.

pub mod auth;
pub mod client;
pub mod progress;

pub use auth::{Credential, DefaultKeychain, Keychain};
pub use client::{RegistryClient, RegistryError};
