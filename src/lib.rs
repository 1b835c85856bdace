//! Stowry library -- self-hosted object storage with presigned URL auth.
//!
//! This crate provides the core components for running the Stowry server:
//! the object service that keeps metadata and stored bytes consistent,
//! presigned URL verification, pluggable metadata repositories and storage
//! backends, and the HTTP adapter.

use std::sync::Arc;

pub mod auth;
pub mod commands;
pub mod config;
pub mod cursor;
pub mod errors;
pub mod keys;
pub mod metadata;
pub mod metrics;
pub mod path;
pub mod server;
pub mod service;
pub mod storage;

use crate::auth::SignatureVerifier;
use crate::config::{Access, Config};
use crate::keys::SecretStore;
use crate::service::StowryService;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Object service over the configured repository and storage.
    pub service: StowryService,
    /// Verifier for GET/HEAD; `None` when reads are public.
    pub read_verifier: Option<Arc<SignatureVerifier>>,
    /// Verifier for PUT/DELETE; `None` when writes are public.
    pub write_verifier: Option<Arc<SignatureVerifier>>,
}

impl AppState {
    /// Build the state, installing a verifier for each private access level.
    /// Keys are only loaded when at least one side is private.
    pub fn new(config: Config, service: StowryService) -> anyhow::Result<Self> {
        let auth = &config.auth;
        let verifier = if auth.read == Access::Private || auth.write == Access::Private {
            let store: Arc<dyn SecretStore> = Arc::new(keys::secret_store_from_config(&auth.keys)?);
            Some(Arc::new(SignatureVerifier::new(
                auth.aws.region.clone(),
                auth.aws.service.clone(),
                store,
            )))
        } else {
            None
        };

        let pick = |access: Access| match access {
            Access::Private => verifier.clone(),
            Access::Public => None,
        };
        let read_verifier = pick(auth.read);
        let write_verifier = pick(auth.write);

        Ok(Self {
            config,
            service,
            read_verifier,
            write_verifier,
        })
    }
}
