//! # Wharf Core
//!
//! `wharf_core` provides the content-addressed data model shared by the
//! [Distribution Spec](https://github.com/opencontainers/distribution-spec)
//! HTTP layer (`wharf_http`), the upstream synchronizer (`wharf_sync`) and
//! backend implementations such as `wharf_backend_postgres`.
//!
//! The model is a digest-keyed DAG: blobs, manifests (including manifest
//! lists / indexes) and signatures are deduplicated by content digest, while
//! repositories reference content through immutable, numbered
//! [`registry::RepositoryVersion`]s. The closure rules used to build new
//! versions live in [`version`] as pure set arithmetic so that backends only
//! have to load rows and persist results.
pub mod errors;
pub use errors::{DistributionErrorCode, Error, Result};

mod oci_digest;
pub use oci_digest::{DigestAlgorithm, DigestState, Digester, OciDigest};

pub mod media_types;
pub use media_types::MediaTypeRegistry;

pub mod model;
pub use model::ManifestSpec;

pub mod registry;

pub mod version;

mod stream;
pub use stream::ChunkedBody;
pub use stream::DigestBody;
