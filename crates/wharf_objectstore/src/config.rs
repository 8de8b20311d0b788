//! Storage backend selection.

use std::sync::Arc;

use serde::Deserialize;

use super::{ObjectStore, Result};

/// Tagged union of the supported storage backends, deserialized straight
/// from the daemon's YAML configuration.
#[derive(Clone, Deserialize)]
#[serde(tag = "type")]
pub enum Config {
    S3(super::s3::S3Config),
}

impl Config {
    /// Build the configured backend behind the [`ObjectStore`] trait.
    pub async fn build(&self) -> Result<Arc<dyn ObjectStore>> {
        match self {
            Config::S3(s3) => Ok(Arc::new(s3.build().await?)),
        }
    }
}
