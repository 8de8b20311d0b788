//! Pure closure arithmetic for repository versions.
//!
//! A repository version is an immutable set of `(kind, id)` content units.
//! Mutating operations never edit a version in place; they compute the
//! membership set of the successor version. The functions here operate on
//! an in-memory [`ContentIndex`] of reference edges loaded by the backend,
//! which keeps the closure rules independent of any database and directly
//! testable.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use uuid::Uuid;

use crate::registry::ContentKind;

pub type ContentId = Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentUnit {
    pub kind: ContentKind,
    pub id: ContentId,
}

impl ContentUnit {
    pub fn blob(id: ContentId) -> Self {
        Self {
            kind: ContentKind::Blob,
            id,
        }
    }
    pub fn manifest(id: ContentId) -> Self {
        Self {
            kind: ContentKind::Manifest,
            id,
        }
    }
    pub fn tag(id: ContentId) -> Self {
        Self {
            kind: ContentKind::Tag,
            id,
        }
    }
    pub fn signature(id: ContentId) -> Self {
        Self {
            kind: ContentKind::Signature,
            id,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TagNode {
    pub name: String,
    pub manifest: ContentId,
}

/// Outgoing reference edges of a manifest. Children of an index may be
/// absent from the graph (deferred by an on-demand download policy); the
/// closure silently skips ids with no node.
#[derive(Clone, Debug, Default)]
pub struct ManifestNode {
    pub config: Option<ContentId>,
    pub layers: Vec<ContentId>,
    pub children: Vec<ContentId>,
    pub signatures: Vec<ContentId>,
}

/// Reference edges for every content unit involved in a version operation.
#[derive(Clone, Debug, Default)]
pub struct ContentIndex {
    pub tags: HashMap<ContentId, TagNode>,
    pub manifests: HashMap<ContentId, ManifestNode>,
}

impl ContentIndex {
    /// The downward closure of `roots`: tags pull in their manifest,
    /// manifests pull in config and layer blobs, sub-manifests and attached
    /// signatures, recursively.
    pub fn closure(
        &self,
        roots: impl IntoIterator<Item = ContentUnit>,
    ) -> BTreeSet<ContentUnit> {
        let mut out: BTreeSet<ContentUnit> = BTreeSet::new();
        let mut stack: Vec<ContentUnit> = roots.into_iter().collect();
        while let Some(unit) = stack.pop() {
            if !out.insert(unit) {
                continue;
            }
            match unit.kind {
                ContentKind::Tag => {
                    if let Some(tag) = self.tags.get(&unit.id) {
                        stack.push(ContentUnit::manifest(tag.manifest));
                    }
                }
                ContentKind::Manifest => {
                    if let Some(node) = self.manifests.get(&unit.id) {
                        if let Some(config) = node.config {
                            stack.push(ContentUnit::blob(config));
                        }
                        for layer in &node.layers {
                            stack.push(ContentUnit::blob(*layer));
                        }
                        for child in &node.children {
                            stack.push(ContentUnit::manifest(*child));
                        }
                        for sig in &node.signatures {
                            stack.push(ContentUnit::signature(*sig));
                        }
                    }
                }
                ContentKind::Blob | ContentKind::Signature => {}
            }
        }
        out
    }

    /// Compute the successor membership set for a recursive add.
    ///
    /// A tag added over an existing name unbinds the previous tag row
    /// (non-recursively) in the new version.
    pub fn recursive_add(
        &self,
        base: &BTreeSet<ContentUnit>,
        refs: &[ContentUnit],
    ) -> BTreeSet<ContentUnit> {
        let additions = self.closure(refs.iter().copied());

        let mut next: BTreeSet<ContentUnit> = base.clone();
        for unit in &additions {
            if unit.kind == ContentKind::Tag {
                if let Some(tag) = self.tags.get(&unit.id) {
                    let conflicting: Vec<ContentUnit> = next
                        .iter()
                        .filter(|u| {
                            u.kind == ContentKind::Tag
                                && u.id != unit.id
                                && self
                                    .tags
                                    .get(&u.id)
                                    .map(|t| t.name == tag.name)
                                    .unwrap_or(false)
                        })
                        .copied()
                        .collect();
                    for c in conflicting {
                        next.remove(&c);
                    }
                }
            }
        }
        next.extend(additions);
        next
    }

    /// Compute the successor membership set for a recursive remove.
    ///
    /// The closure of the removed refs leaves the set, but any unit still
    /// reachable from the surviving content is preserved.
    pub fn recursive_remove(
        &self,
        base: &BTreeSet<ContentUnit>,
        refs: &[ContentUnit],
    ) -> BTreeSet<ContentUnit> {
        let removals = self.closure(refs.iter().copied());
        let survivors: BTreeSet<ContentUnit> =
            base.difference(&removals).copied().collect();

        // Re-expand from the survivors so content shared with what remains
        // is not lost. Restrict to the base set: the closure may reach edges
        // that never belonged to this version.
        let mut next: BTreeSet<ContentUnit> = self
            .closure(survivors.iter().copied())
            .intersection(base)
            .copied()
            .collect();
        next.extend(survivors);
        next
    }
}

/// Per-kind content counts describing the difference between two versions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ContentSummary {
    pub added: BTreeMap<ContentKind, u64>,
    pub removed: BTreeMap<ContentKind, u64>,
    pub present: BTreeMap<ContentKind, u64>,
}

impl ContentSummary {
    pub fn diff(a: &BTreeSet<ContentUnit>, b: &BTreeSet<ContentUnit>) -> Self {
        let mut summary = ContentSummary::default();
        for unit in b.difference(a) {
            *summary.added.entry(unit.kind).or_default() += 1;
        }
        for unit in a.difference(b) {
            *summary.removed.entry(unit.kind).or_default() += 1;
        }
        for unit in b {
            *summary.present.entry(unit.kind).or_default() += 1;
        }
        summary
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    struct Fixture {
        index: ContentIndex,
        config_a: ContentUnit,
        layer_shared: ContentUnit,
        layer_a: ContentUnit,
        manifest_a: ContentUnit,
        tag_a: ContentUnit,
        config_b: ContentUnit,
        manifest_b: ContentUnit,
        tag_b: ContentUnit,
        list: ContentUnit,
        tag_list: ContentUnit,
        sig_a: ContentUnit,
    }

    /// Two image manifests sharing a layer, one of them signed, plus a
    /// manifest list referencing both.
    fn fixture() -> Fixture {
        let mut index = ContentIndex::default();

        let config_a = ContentUnit::blob(Uuid::new_v4());
        let layer_shared = ContentUnit::blob(Uuid::new_v4());
        let layer_a = ContentUnit::blob(Uuid::new_v4());
        let manifest_a = ContentUnit::manifest(Uuid::new_v4());
        let sig_a = ContentUnit::signature(Uuid::new_v4());
        index.manifests.insert(
            manifest_a.id,
            ManifestNode {
                config: Some(config_a.id),
                layers: vec![layer_shared.id, layer_a.id],
                children: vec![],
                signatures: vec![sig_a.id],
            },
        );

        let config_b = ContentUnit::blob(Uuid::new_v4());
        let manifest_b = ContentUnit::manifest(Uuid::new_v4());
        index.manifests.insert(
            manifest_b.id,
            ManifestNode {
                config: Some(config_b.id),
                layers: vec![layer_shared.id],
                children: vec![],
                signatures: vec![],
            },
        );

        let list = ContentUnit::manifest(Uuid::new_v4());
        index.manifests.insert(
            list.id,
            ManifestNode {
                config: None,
                layers: vec![],
                children: vec![manifest_a.id, manifest_b.id],
                signatures: vec![],
            },
        );

        let tag_a = ContentUnit::tag(Uuid::new_v4());
        index.tags.insert(
            tag_a.id,
            TagNode {
                name: "a".to_string(),
                manifest: manifest_a.id,
            },
        );
        let tag_b = ContentUnit::tag(Uuid::new_v4());
        index.tags.insert(
            tag_b.id,
            TagNode {
                name: "b".to_string(),
                manifest: manifest_b.id,
            },
        );
        let tag_list = ContentUnit::tag(Uuid::new_v4());
        index.tags.insert(
            tag_list.id,
            TagNode {
                name: "multi".to_string(),
                manifest: list.id,
            },
        );

        Fixture {
            index,
            config_a,
            layer_shared,
            layer_a,
            manifest_a,
            tag_a,
            config_b,
            manifest_b,
            tag_b,
            list,
            tag_list,
            sig_a,
        }
    }

    #[rstest]
    fn tag_closure_pulls_manifest_blobs_and_signatures() {
        let f = fixture();
        let set = f.index.recursive_add(&BTreeSet::new(), &[f.tag_a]);
        let expected: BTreeSet<ContentUnit> = [
            f.tag_a,
            f.manifest_a,
            f.config_a,
            f.layer_shared,
            f.layer_a,
            f.sig_a,
        ]
        .into_iter()
        .collect();
        assert_eq!(set, expected);
    }

    #[rstest]
    fn list_closure_pulls_children() {
        let f = fixture();
        let set = f.index.recursive_add(&BTreeSet::new(), &[f.tag_list]);
        assert!(set.contains(&f.list));
        assert!(set.contains(&f.manifest_a));
        assert!(set.contains(&f.manifest_b));
        assert!(set.contains(&f.layer_shared));
        assert!(set.contains(&f.config_b));
    }

    #[rstest]
    fn remove_preserves_shared_content() {
        let f = fixture();
        let base = f.index.recursive_add(&BTreeSet::new(), &[f.tag_a, f.tag_b]);
        let next = f.index.recursive_remove(&base, &[f.tag_a]);

        // manifest_a's closure is gone except the layer manifest_b shares.
        assert!(!next.contains(&f.tag_a));
        assert!(!next.contains(&f.manifest_a));
        assert!(!next.contains(&f.config_a));
        assert!(!next.contains(&f.layer_a));
        assert!(!next.contains(&f.sig_a));
        assert!(next.contains(&f.layer_shared));
        assert!(next.contains(&f.manifest_b));
        assert!(next.contains(&f.tag_b));
    }

    #[rstest]
    fn add_remove_symmetry() {
        let f = fixture();
        let base = f.index.recursive_add(&BTreeSet::new(), &[f.tag_b]);
        let added = f.index.recursive_add(&base, &[f.tag_a]);
        let removed = f.index.recursive_remove(&added, &[f.tag_a]);
        assert_eq!(removed, base);
    }

    #[rstest]
    fn retagging_a_name_replaces_the_binding() {
        let f = fixture();
        let base = f.index.recursive_add(&BTreeSet::new(), &[f.tag_a]);

        // a new tag row with the same name bound to manifest_b
        let mut index = f.index.clone();
        let retag = ContentUnit::tag(Uuid::new_v4());
        index.tags.insert(
            retag.id,
            TagNode {
                name: "a".to_string(),
                manifest: f.manifest_b.id,
            },
        );

        let next = index.recursive_add(&base, &[retag]);
        assert!(!next.contains(&f.tag_a), "old binding must be unbound");
        assert!(next.contains(&retag));
        // unbinding is non-recursive: manifest_a's closure stays
        assert!(next.contains(&f.manifest_a));
        assert!(next.contains(&f.layer_a));

        let names: Vec<&str> = next
            .iter()
            .filter(|u| u.kind == ContentKind::Tag)
            .map(|u| index.tags[&u.id].name.as_str())
            .collect();
        let unique: BTreeSet<&str> = names.iter().copied().collect();
        assert_eq!(names.len(), unique.len(), "tag names must stay unique");
    }

    #[rstest]
    fn removing_child_of_surviving_list_preserves_it() {
        let f = fixture();
        let base = f.index.recursive_add(&BTreeSet::new(), &[f.tag_list, f.tag_a]);
        let next = f.index.recursive_remove(&base, &[f.tag_a]);
        // manifest_a is still referenced through the list
        assert!(next.contains(&f.manifest_a));
        assert!(next.contains(&f.layer_a));
        assert!(!next.contains(&f.tag_a));
    }

    #[rstest]
    fn diff_counts_by_kind() {
        let f = fixture();
        let a = f.index.recursive_add(&BTreeSet::new(), &[f.tag_b]);
        let b = f.index.recursive_add(&a, &[f.tag_a]);
        let summary = ContentSummary::diff(&a, &b);
        assert_eq!(summary.added[&ContentKind::Tag], 1);
        assert_eq!(summary.added[&ContentKind::Manifest], 1);
        assert_eq!(summary.added[&ContentKind::Blob], 2); // config_a + layer_a
        assert_eq!(summary.added[&ContentKind::Signature], 1);
        assert!(summary.removed.is_empty());
        assert_eq!(summary.present[&ContentKind::Tag], 2);
    }
}
