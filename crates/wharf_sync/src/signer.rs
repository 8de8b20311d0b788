//! Adapter around the external manifest signer.
//!
//! Signing itself happens in an operator-provided executable (typically a
//! GPG wrapper script); this adapter invokes it, validates the claim
//! payload it emits, and ingests the result as an atomic signature. The
//! number of concurrent signings is bounded by configuration.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use bytes::Bytes;
use tokio::process::Command;
use tokio::sync::Semaphore;
use uuid::Uuid;

use wharf_core::registry::{RepositoryStore, SignatureKind, SignatureRecord};
use wharf_core::OciDigest;

use super::errors::{Error, Result};

pub struct ManifestSigner {
    script: PathBuf,
    permits: Arc<Semaphore>,
}

impl ManifestSigner {
    pub fn new(script: PathBuf, max_parallel: usize) -> Self {
        Self {
            script,
            permits: Arc::new(Semaphore::new(max_parallel.max(1))),
        }
    }

    /// Validate a signer-produced claim: a JSON document whose
    /// `critical.image.docker-manifest-digest` names the signed manifest.
    pub fn validate_payload(payload: &[u8], manifest_digest: &OciDigest) -> Result<()> {
        let value: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| Error::Signer(format!("unparseable claim payload: {e}")))?;
        let claimed = value
            .get("critical")
            .and_then(|c| c.get("image"))
            .and_then(|i| i.get("docker-manifest-digest"))
            .and_then(|d| d.as_str())
            .ok_or_else(|| Error::Signer("claim payload missing manifest digest".to_string()))?;
        if claimed != String::from(manifest_digest) {
            return Err(Error::Signer(format!(
                "claim names {claimed}, expected {manifest_digest}"
            )));
        }
        Ok(())
    }

    /// Sign `manifest_digest` in `repository` under `reference` and store
    /// the resulting signature. The external signer receives the digest,
    /// the image reference and an optional key id as arguments and writes
    /// the claim payload to stdout.
    pub async fn sign(
        &self,
        repository: &Arc<dyn RepositoryStore>,
        manifest_digest: &OciDigest,
        reference: &str,
        key_id: Option<String>,
    ) -> Result<SignatureRecord> {
        let _permit = self
            .permits
            .acquire()
            .await
            .expect("signer semaphore is never closed");

        let mut command = Command::new(&self.script);
        command
            .arg(String::from(manifest_digest))
            .arg(format!("{}:{}", repository.name(), reference))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(key_id) = &key_id {
            command.arg(key_id);
        }

        tracing::debug!(
            script = %self.script.display(),
            digest = %manifest_digest,
            "invoking external signer",
        );
        let output = command.output().await?;
        if !output.status.success() {
            return Err(Error::Signer(format!(
                "signer exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr),
            )));
        }

        let payload = output.stdout;
        Self::validate_payload(&payload, manifest_digest)?;

        let name = format!("{manifest_digest}@{}", Uuid::new_v4().simple());
        let record = repository
            .signature_store()
            .put(
                &name,
                manifest_digest,
                SignatureKind::Atomic,
                key_id,
                Bytes::from(payload),
            )
            .await?;
        Ok(record)
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    fn digest() -> OciDigest {
        OciDigest::from("manifest bytes".as_bytes())
    }

    #[rstest]
    fn accepts_matching_claim() {
        let d = digest();
        let payload = serde_json::json!({
            "critical": {
                "type": "atomic container signature",
                "image": {"docker-manifest-digest": String::from(&d)},
                "identity": {"docker-reference": "wharf.example.com/alice/app:v1"},
            },
            "optional": {},
        })
        .to_string();
        assert!(ManifestSigner::validate_payload(payload.as_bytes(), &d).is_ok());
    }

    #[rstest]
    fn rejects_digest_mismatch() {
        let d = digest();
        let other = OciDigest::from("other bytes".as_bytes());
        let payload = serde_json::json!({
            "critical": {"image": {"docker-manifest-digest": String::from(&other)}},
        })
        .to_string();
        assert!(ManifestSigner::validate_payload(payload.as_bytes(), &d).is_err());
    }

    #[rstest]
    #[case::not_json(b"not json".as_slice())]
    #[case::missing_claim(br#"{"critical":{}}"#.as_slice())]
    fn rejects_malformed(#[case] payload: &[u8]) {
        assert!(ManifestSigner::validate_payload(payload, &digest()).is_err());
    }
}
