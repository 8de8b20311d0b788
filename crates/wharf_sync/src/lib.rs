//! Upstream registry synchronization.
//!
//! Implements mirror and additive syncs from remote Distribution-API
//! registries, tag filtering with shell-style wildcards, signature
//! discovery in the three layouts found in the wild (the signatures API
//! extension, cosign tag conventions and external sigstores), and the
//! pull-through cache used to populate repositories on first pull.

pub mod errors;
pub use errors::{Error, Result};

mod client;
pub use client::{FetchedManifest, UpstreamClient};

mod filter;
pub use filter::TagFilter;

mod sync;
pub use sync::{SyncJob, SyncOutcome};

mod signatures;

mod pull_through;
pub use pull_through::PullThroughCache;

mod signer;
pub use signer::ManifestSigner;
