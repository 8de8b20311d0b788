//! Postgres + object-store backend for the wharf registry.
//!
//! Metadata (the content graph, repository versions, upload sessions,
//! distributions, remotes) lives in Postgres; bulk bytes live in the
//! [`wharf_objectstore::ObjectStore`] under digest-derived keys.

mod blobs;
mod config;
mod errors;
mod manifests;
mod metadata;
mod reclaim;
mod repositories;
mod signatures;
mod uploads;
mod versions;

pub use config::PgBackendConfig;
pub use metadata::{MetadataPool, PostgresConfig};
pub use reclaim::{reclaim_orphans, ReclaimReport};
pub use repositories::{PgRepository, PgRepositoryManager};
