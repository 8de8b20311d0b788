//! The repository version engine.
//!
//! Loads the reference edges touched by an operation into a
//! [`wharf_core::version::ContentIndex`], delegates the closure arithmetic
//! to `wharf_core`, and persists the resulting membership set as a new
//! immutable version inside one transaction. Callers serialize writes per
//! repository through task reservations; the engine additionally re-reads
//! `latest_version` inside its transaction so version numbers always
//! advance strictly.

use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use sqlx::PgConnection;
use uuid::Uuid;

use wharf_core::registry::{ContentKind, ContentRef, TagRecord, VersionStore};
use wharf_core::version::{ContentIndex, ContentSummary, ContentUnit, ManifestNode, TagNode};
use wharf_core::Error as CoreError;
use wharf_core::OciDigest;
use wharf_core::Result;

use super::errors::Error;
use super::metadata::{MetadataPool, Queries, Repository};

pub struct PgVersionStore {
    metadata: MetadataPool,
    repository: Repository,
}

impl PgVersionStore {
    pub fn new(metadata: MetadataPool, repository: Repository) -> Self {
        Self {
            metadata,
            repository,
        }
    }

    async fn latest_number(executor: &mut PgConnection, repository: &Repository) -> Result<i64> {
        Ok(Queries::get_repository(executor, &repository.name)
            .await
            .map_err(Error::from)?
            .ok_or(CoreError::NameUnknown(None))?
            .latest_version)
    }

    async fn version_id(
        executor: &mut PgConnection,
        repository_id: &Uuid,
        number: i64,
    ) -> Result<Uuid> {
        Ok(Queries::get_version(executor, repository_id, number)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| {
                CoreError::NameUnknown(Some(format!("unknown repository version {number}")))
            })?
            .id)
    }

    async fn load_membership(
        executor: &mut PgConnection,
        version_id: &Uuid,
    ) -> Result<BTreeSet<ContentUnit>> {
        let members = Queries::version_members(executor, version_id)
            .await
            .map_err(Error::from)?;
        members
            .into_iter()
            .map(|(id, kind)| {
                Ok(ContentUnit {
                    kind: ContentKind::try_from(kind.as_str())?,
                    id,
                })
            })
            .collect()
    }

    /// Load every reference edge reachable from the given seeds plus the
    /// base membership, iterating until index children stop introducing new
    /// manifests. Children whose manifests were never stored (deferred by an
    /// on-demand download policy) simply have no edge.
    async fn build_index(
        executor: &mut PgConnection,
        base: &BTreeSet<ContentUnit>,
        seed_tags: &[Uuid],
        seed_manifests: &[Uuid],
    ) -> Result<ContentIndex> {
        let mut index = ContentIndex::default();

        let mut tag_ids: HashSet<Uuid> = seed_tags.iter().copied().collect();
        let mut manifest_ids: HashSet<Uuid> = seed_manifests.iter().copied().collect();
        for unit in base {
            match unit.kind {
                ContentKind::Tag => {
                    tag_ids.insert(unit.id);
                }
                ContentKind::Manifest => {
                    manifest_ids.insert(unit.id);
                }
                _ => {}
            }
        }

        let tags = Queries::get_tags_by_ids(
            executor,
            &tag_ids.iter().copied().collect::<Vec<_>>(),
        )
        .await
        .map_err(Error::from)?;
        for tag in tags {
            manifest_ids.insert(tag.manifest_id);
            index.tags.insert(
                tag.id,
                TagNode {
                    name: tag.name,
                    manifest: tag.manifest_id,
                },
            );
        }

        let mut processed: HashSet<Uuid> = HashSet::new();
        while processed.len() < manifest_ids.len() {
            let pending: Vec<Uuid> = manifest_ids
                .iter()
                .filter(|id| !processed.contains(id))
                .copied()
                .collect();
            processed.extend(pending.iter().copied());

            let rows = Queries::get_manifests_by_ids(executor, &pending)
                .await
                .map_err(Error::from)?;
            let layers = Queries::get_manifest_layers(executor, &pending)
                .await
                .map_err(Error::from)?;
            let children = Queries::get_index_children(executor, &pending)
                .await
                .map_err(Error::from)?;

            let mut layer_map: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
            for (manifest_id, blob_id) in layers {
                layer_map.entry(manifest_id).or_default().push(blob_id);
            }

            // resolve child digests to stored manifest rows
            let child_digests: Vec<String> =
                children.iter().map(|(_, d)| d.clone()).collect();
            let child_rows = Queries::get_manifests_by_digests(executor, &child_digests)
                .await
                .map_err(Error::from)?;
            let child_by_digest: HashMap<String, Uuid> = child_rows
                .iter()
                .map(|m| (String::from(&m.digest), m.id))
                .collect();
            let mut child_map: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
            for (parent, digest) in &children {
                if let Some(child_id) = child_by_digest.get(digest) {
                    child_map.entry(*parent).or_default().push(*child_id);
                    manifest_ids.insert(*child_id);
                }
            }

            let manifest_digests: Vec<String> =
                rows.iter().map(|m| String::from(&m.digest)).collect();
            let signatures = Queries::signatures_for_manifests(executor, &manifest_digests)
                .await
                .map_err(Error::from)?;
            let mut signature_map: HashMap<String, Vec<Uuid>> = HashMap::new();
            for sig in &signatures {
                signature_map
                    .entry(String::from(&sig.manifest_digest))
                    .or_default()
                    .push(sig.id);
            }

            let config_digests: Vec<String> = rows
                .iter()
                .filter_map(|m| m.config_blob_digest.as_ref().map(String::from))
                .collect();
            let config_blobs = Queries::get_blobs(executor, &config_digests)
                .await
                .map_err(Error::from)?;
            let config_by_digest: HashMap<String, Uuid> = config_blobs
                .iter()
                .map(|b| (String::from(&b.digest), b.id))
                .collect();

            for row in rows {
                let digest = String::from(&row.digest);
                index.manifests.insert(
                    row.id,
                    ManifestNode {
                        config: row
                            .config_blob_digest
                            .as_ref()
                            .and_then(|d| config_by_digest.get(&String::from(d)).copied()),
                        layers: layer_map.remove(&row.id).unwrap_or_default(),
                        children: child_map.remove(&row.id).unwrap_or_default(),
                        signatures: signature_map.remove(&digest).unwrap_or_default(),
                    },
                );
            }
        }

        Ok(index)
    }

    /// Resolve external content descriptors to content units, creating tag
    /// rows for new name bindings.
    async fn resolve_refs(
        executor: &mut PgConnection,
        base_version_id: &Uuid,
        refs: &[ContentRef],
        for_removal: bool,
    ) -> Result<Vec<ContentUnit>> {
        let mut units = Vec::with_capacity(refs.len());
        for content_ref in refs {
            match content_ref {
                ContentRef::Tag { name, manifest } => match manifest {
                    Some(digest) => {
                        let manifest_row = Queries::get_manifest_by_digest(executor, digest)
                            .await
                            .map_err(Error::from)?
                            .ok_or_else(|| {
                                CoreError::ManifestUnknown(Some(String::from(digest)))
                            })?;
                        let tag_id = match Queries::find_tag(executor, name, &manifest_row.id)
                            .await
                            .map_err(Error::from)?
                        {
                            Some(tag) => tag.id,
                            None => Queries::insert_tag(executor, name, &manifest_row.id)
                                .await
                                .map_err(Error::from)?,
                        };
                        units.push(ContentUnit::tag(tag_id));
                    }
                    None => {
                        if !for_removal {
                            return Err(CoreError::BackendError(
                                "tag additions require a manifest digest".to_string(),
                            ));
                        }
                        let tag = Queries::tag_in_version_by_name(
                            executor,
                            base_version_id,
                            name,
                        )
                        .await
                        .map_err(Error::from)?
                        .ok_or_else(|| CoreError::ManifestUnknown(Some(name.clone())))?;
                        units.push(ContentUnit::tag(tag.id));
                    }
                },
                ContentRef::Manifest(digest) => {
                    let manifest_row = Queries::get_manifest_by_digest(executor, digest)
                        .await
                        .map_err(Error::from)?
                        .ok_or_else(|| CoreError::ManifestUnknown(Some(String::from(digest))))?;
                    units.push(ContentUnit::manifest(manifest_row.id));
                }
                ContentRef::Blob(digest) => {
                    let blob = Queries::get_blob(executor, digest)
                        .await
                        .map_err(Error::from)?
                        .ok_or_else(|| CoreError::BlobUnknown(Some(String::from(digest))))?;
                    units.push(ContentUnit::blob(blob.id));
                }
                ContentRef::Signature { id } => {
                    units.push(ContentUnit::signature(*id));
                }
            }
        }
        Ok(units)
    }

    async fn persist_version(
        &self,
        executor: &mut PgConnection,
        base_number: i64,
        members: &BTreeSet<ContentUnit>,
    ) -> Result<i64> {
        let number = base_number + 1;
        let version_id =
            Queries::insert_version(executor, &self.repository.id, number, Some(base_number))
                .await
                .map_err(Error::from)?;
        let rows: Vec<(Uuid, &str)> = members
            .iter()
            .map(|u| (u.id, u.kind.as_str()))
            .collect();
        Queries::insert_version_content(executor, &version_id, &rows)
            .await
            .map_err(Error::from)?;
        Queries::update_latest_version(executor, &self.repository.id, number)
            .await
            .map_err(Error::from)?;
        Ok(number)
    }

    /// Shared implementation for additions rooted at already-resolved
    /// units (used by copy operations) or external refs.
    async fn add_units(&self, refs: Vec<ContentRef>, units: Vec<ContentUnit>) -> Result<i64> {
        let mut tx = self.metadata.get_tx().await.map_err(Error::from)?;
        let executor = tx.executor().map_err(Error::from)?;

        let base_number = Self::latest_number(executor, &self.repository).await?;
        let base_version_id = Self::version_id(executor, &self.repository.id, base_number).await?;
        let base = Self::load_membership(executor, &base_version_id).await?;

        let mut roots = Self::resolve_refs(executor, &base_version_id, &refs, false).await?;
        roots.extend(units);

        let seed_tags: Vec<Uuid> = roots
            .iter()
            .filter(|u| u.kind == ContentKind::Tag)
            .map(|u| u.id)
            .collect();
        let seed_manifests: Vec<Uuid> = roots
            .iter()
            .filter(|u| u.kind == ContentKind::Manifest)
            .map(|u| u.id)
            .collect();
        let index = Self::build_index(executor, &base, &seed_tags, &seed_manifests).await?;

        let next = index.recursive_add(&base, &roots);
        if next == base {
            // no-op mutation; do not burn a version number
            return Ok(base_number);
        }
        let number = self.persist_version(executor, base_number, &next).await?;
        tx.commit().await.map_err(Error::from)?;
        Ok(number)
    }
}

#[async_trait]
impl VersionStore for PgVersionStore {
    async fn latest(&self) -> Result<i64> {
        let mut conn = self.metadata.get_conn().await.map_err(Error::from)?;
        Self::latest_number(conn.executor(), &self.repository).await
    }

    async fn exists(&self, number: i64) -> Result<bool> {
        let mut conn = self.metadata.get_conn().await.map_err(Error::from)?;
        Ok(
            Queries::get_version(conn.executor(), &self.repository.id, number)
                .await
                .map_err(Error::from)?
                .is_some(),
        )
    }

    async fn recursive_add(&self, refs: &[ContentRef]) -> Result<i64> {
        self.add_units(refs.to_vec(), vec![]).await
    }

    async fn recursive_remove(&self, refs: &[ContentRef]) -> Result<i64> {
        let mut tx = self.metadata.get_tx().await.map_err(Error::from)?;
        let executor = tx.executor().map_err(Error::from)?;

        let base_number = Self::latest_number(executor, &self.repository).await?;
        let base_version_id = Self::version_id(executor, &self.repository.id, base_number).await?;
        let base = Self::load_membership(executor, &base_version_id).await?;

        let roots = Self::resolve_refs(executor, &base_version_id, refs, true).await?;
        let seed_tags: Vec<Uuid> = roots
            .iter()
            .filter(|u| u.kind == ContentKind::Tag)
            .map(|u| u.id)
            .collect();
        let seed_manifests: Vec<Uuid> = roots
            .iter()
            .filter(|u| u.kind == ContentKind::Manifest)
            .map(|u| u.id)
            .collect();
        let index = Self::build_index(executor, &base, &seed_tags, &seed_manifests).await?;

        let next = index.recursive_remove(&base, &roots);
        if next == base {
            return Ok(base_number);
        }
        let number = self.persist_version(executor, base_number, &next).await?;
        tx.commit().await.map_err(Error::from)?;
        Ok(number)
    }

    async fn copy_tags(
        &self,
        src_repository: &str,
        src_version: i64,
        names: Option<&[String]>,
    ) -> Result<i64> {
        let mut conn = self.metadata.get_conn().await.map_err(Error::from)?;
        let executor = conn.executor();
        let src = Queries::get_repository(executor, src_repository)
            .await
            .map_err(Error::from)?
            .ok_or(CoreError::NameUnknown(Some(src_repository.to_string())))?;
        let src_version_id = Self::version_id(executor, &src.id, src_version).await?;
        let tags = Queries::tags_in_version(executor, &src_version_id, None, None)
            .await
            .map_err(Error::from)?;
        drop(conn);

        let units: Vec<ContentUnit> = tags
            .into_iter()
            .filter(|t| match names {
                Some(names) => names.iter().any(|n| n == &t.name),
                None => true,
            })
            .map(|t| ContentUnit::tag(t.id))
            .collect();
        self.add_units(vec![], units).await
    }

    async fn copy_manifests(
        &self,
        src_repository: &str,
        src_version: i64,
        digests: Option<&[OciDigest]>,
        media_types: Option<&[String]>,
    ) -> Result<i64> {
        let mut conn = self.metadata.get_conn().await.map_err(Error::from)?;
        let executor = conn.executor();
        let src = Queries::get_repository(executor, src_repository)
            .await
            .map_err(Error::from)?
            .ok_or(CoreError::NameUnknown(Some(src_repository.to_string())))?;
        let src_version_id = Self::version_id(executor, &src.id, src_version).await?;
        let manifests = Queries::manifests_in_version(executor, &src_version_id)
            .await
            .map_err(Error::from)?;
        drop(conn);

        let wanted_digests: Option<HashSet<String>> =
            digests.map(|ds| ds.iter().map(String::from).collect());
        let units: Vec<ContentUnit> = manifests
            .into_iter()
            .filter(|m| match &wanted_digests {
                Some(ds) => ds.contains(&String::from(&m.digest)),
                None => true,
            })
            .filter(|m| match media_types {
                Some(mts) => mts.iter().any(|mt| mt == &m.media_type),
                None => true,
            })
            .map(|m| ContentUnit::manifest(m.id))
            .collect();
        self.add_units(vec![], units).await
    }

    async fn tag(&self, manifest_digest: &OciDigest, name: &str) -> Result<i64> {
        wharf_core::registry::validate_tag_name(name)?;
        self.recursive_add(&[ContentRef::Tag {
            name: name.to_string(),
            manifest: Some(manifest_digest.clone()),
        }])
        .await
    }

    async fn untag(&self, name: &str) -> Result<i64> {
        let mut tx = self.metadata.get_tx().await.map_err(Error::from)?;
        let executor = tx.executor().map_err(Error::from)?;

        let base_number = Self::latest_number(executor, &self.repository).await?;
        let base_version_id = Self::version_id(executor, &self.repository.id, base_number).await?;
        let tag = Queries::tag_in_version_by_name(executor, &base_version_id, name)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| CoreError::ManifestUnknown(Some(name.to_string())))?;

        let mut next = Self::load_membership(executor, &base_version_id).await?;
        // untag is non-recursive: only the name binding leaves the version
        next.remove(&ContentUnit::tag(tag.id));
        let number = self.persist_version(executor, base_number, &next).await?;
        tx.commit().await.map_err(Error::from)?;
        Ok(number)
    }

    async fn prune_older_versions(&self) -> Result<u64> {
        let mut tx = self.metadata.get_tx().await.map_err(Error::from)?;
        let executor = tx.executor().map_err(Error::from)?;
        let latest = Self::latest_number(executor, &self.repository).await?;
        let pruned = Queries::delete_versions_before(executor, &self.repository.id, latest)
            .await
            .map_err(Error::from)?;
        tx.commit().await.map_err(Error::from)?;
        Ok(pruned)
    }

    async fn diff(&self, a: i64, b: i64) -> Result<ContentSummary> {
        let mut conn = self.metadata.get_conn().await.map_err(Error::from)?;
        let executor = conn.executor();
        let a_id = Self::version_id(executor, &self.repository.id, a).await?;
        let b_id = Self::version_id(executor, &self.repository.id, b).await?;
        let a_members = Self::load_membership(executor, &a_id).await?;
        let b_members = Self::load_membership(executor, &b_id).await?;
        Ok(ContentSummary::diff(&a_members, &b_members))
    }

    async fn tags(
        &self,
        version: Option<i64>,
        n: Option<i64>,
        last: Option<&str>,
    ) -> Result<Vec<TagRecord>> {
        let mut conn = self.metadata.get_conn().await.map_err(Error::from)?;
        let executor = conn.executor();
        let number = match version {
            Some(n) => n,
            None => Self::latest_number(executor, &self.repository).await?,
        };
        let version_id = Self::version_id(executor, &self.repository.id, number).await?;
        Ok(Queries::tags_in_version(executor, &version_id, n, last)
            .await
            .map_err(Error::from)?
            .into_iter()
            .map(Into::into)
            .collect())
    }
}
