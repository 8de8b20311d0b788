//! Orphan reclaim: deletes content rows and object-store bytes that no
//! repository version references anymore.
//!
//! Removing content from a repository never deletes bytes; this pass is the
//! only place unreferenced objects die. It runs on the task runtime under
//! the registry-wide content reservation so no version mutation can race a
//! deletion.

use std::sync::Arc;

use wharf_core::Result;
use wharf_objectstore::{Key, ObjectStore};

use super::errors::Error;
use super::metadata::{MetadataPool, Queries};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub blobs: u64,
    pub manifests: u64,
    pub signatures: u64,
}

fn content_key(digest: &wharf_core::OciDigest) -> Key {
    Key::content(digest.algorithm().as_str(), digest.encoded())
}

pub async fn reclaim_orphans(
    metadata: &MetadataPool,
    objects: &Arc<dyn ObjectStore>,
) -> Result<ReclaimReport> {
    let mut report = ReclaimReport::default();
    let mut tx = metadata.get_tx().await.map_err(Error::from)?;

    // signatures before manifests before blobs: each layer's rows may
    // reference the next one down
    let signatures = Queries::orphan_signatures(tx.executor().map_err(Error::from)?)
        .await
        .map_err(Error::from)?;
    for signature in &signatures {
        Queries::delete_signature(tx.executor().map_err(Error::from)?, &signature.id)
            .await
            .map_err(Error::from)?;
        objects
            .delete(&content_key(&signature.digest))
            .await
            .map_err(Error::from)?;
        report.signatures += 1;
    }

    let manifests = Queries::orphan_manifests(tx.executor().map_err(Error::from)?)
        .await
        .map_err(Error::from)?;
    for manifest in &manifests {
        Queries::delete_manifest(tx.executor().map_err(Error::from)?, &manifest.id)
            .await
            .map_err(Error::from)?;
        objects
            .delete(&content_key(&manifest.digest))
            .await
            .map_err(Error::from)?;
        report.manifests += 1;
    }

    let blobs = Queries::orphan_blobs(tx.executor().map_err(Error::from)?)
        .await
        .map_err(Error::from)?;
    for blob in &blobs {
        Queries::delete_blob(tx.executor().map_err(Error::from)?, &blob.id)
            .await
            .map_err(Error::from)?;
        objects
            .delete(&content_key(&blob.digest))
            .await
            .map_err(Error::from)?;
        report.blobs += 1;
    }

    tx.commit().await.map_err(Error::from)?;
    tracing::info!(
        blobs = report.blobs,
        manifests = report.manifests,
        signatures = report.signatures,
        "reclaimed orphaned content",
    );
    Ok(report)
}
