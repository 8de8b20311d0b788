//! Permission evaluation at token issuance.
//!
//! The policy itself is provisioned externally (user/group administration
//! is not this system's concern); this module evaluates a loaded policy
//! against requested scopes. Granted access is always the intersection of
//! the request and the evaluation, so a token can never carry more than the
//! account's permissions at issuance time.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Deserialize;

use crate::claims::AccessEntry;
use crate::scope::{Action, Scope, ScopeType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceRole {
    /// May create and delete repositories in the namespace, push and pull.
    Owner,
    /// May push and pull.
    Collaborator,
    /// May pull.
    Consumer,
}

impl NamespaceRole {
    fn allowed_actions(&self) -> BTreeSet<Action> {
        match self {
            NamespaceRole::Owner => BTreeSet::from([Action::Pull, Action::Push, Action::All]),
            NamespaceRole::Collaborator => BTreeSet::from([Action::Pull, Action::Push]),
            NamespaceRole::Consumer => BTreeSet::from([Action::Pull]),
        }
    }
}

/// Statically provisioned access policy: credentials, per-namespace roles
/// and the set of private base paths with their allowed pullers.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AccessPolicy {
    /// Username -> password. Verified for Basic auth at the token endpoint.
    #[serde(default)]
    pub users: HashMap<String, String>,

    /// Namespace -> (username -> role).
    #[serde(default)]
    pub namespace_roles: HashMap<String, HashMap<String, NamespaceRole>>,

    /// Base paths whose distributions are private, mapped to the users
    /// allowed to view/pull them.
    #[serde(default)]
    pub private_distributions: HashMap<String, HashSet<String>>,
}

impl AccessPolicy {
    /// Verify Basic credentials. Unknown users and wrong passwords are
    /// indistinguishable to callers.
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .map(|expected| expected == password)
            .unwrap_or(false)
    }

    fn role(&self, namespace: &str, user: &str) -> Option<NamespaceRole> {
        self.namespace_roles
            .get(namespace)
            .and_then(|m| m.get(user))
            .copied()
    }

    fn is_private(&self, name: &str) -> bool {
        self.private_distributions.contains_key(name)
    }

    fn may_pull_private(&self, name: &str, user: &str) -> bool {
        self.private_distributions
            .get(name)
            .map(|users| users.contains(user))
            .unwrap_or(false)
    }

    /// Evaluate the actions `user` may perform on a repository path.
    pub fn allowed_repository_actions(
        &self,
        user: Option<&str>,
        name: &str,
    ) -> BTreeSet<Action> {
        let namespace = match name.find('/') {
            Some(i) => &name[..i],
            None => name,
        };

        let mut allowed = BTreeSet::new();

        // Public repositories are pullable by anyone, including anonymous
        // accounts; private ones require an explicit per-distribution grant.
        if !self.is_private(name) {
            allowed.insert(Action::Pull);
        }

        let user = match user {
            Some(u) if !u.is_empty() => u,
            _ => return allowed,
        };

        if self.may_pull_private(name, user) {
            allowed.insert(Action::Pull);
        }

        if let Some(role) = self.role(namespace, user) {
            allowed.extend(role.allowed_actions());
            if self.is_private(name) && role != NamespaceRole::Owner {
                // namespace roles do not bypass a private distribution
                if !self.may_pull_private(name, user) {
                    allowed.remove(&Action::Pull);
                }
            }
        }

        // A user may always act as owner of the namespace matching their
        // own username, which is how first-push namespace creation works.
        if namespace == user {
            allowed.extend(NamespaceRole::Owner.allowed_actions());
        }

        allowed
    }

    /// Evaluate one requested scope into an access entry. The result's
    /// actions are the intersection of request and policy; empty action
    /// sets still produce an entry so clients can see what was denied.
    pub fn evaluate(&self, user: Option<&str>, scope: &Scope) -> AccessEntry {
        let granted: BTreeSet<Action> = match scope.scope_type {
            ScopeType::Repository => {
                let allowed = self.allowed_repository_actions(user, &scope.resource);
                scope
                    .actions
                    .iter()
                    .copied()
                    .filter(|a| allowed.contains(a))
                    .collect()
            }
            ScopeType::Registry => {
                // catalog access requires an authenticated account
                if scope.is_catalog() && user.map(|u| !u.is_empty()).unwrap_or(false) {
                    scope.actions.iter().copied().collect()
                } else {
                    BTreeSet::new()
                }
            }
        };
        AccessEntry::from_scope(scope, granted)
    }

    /// Repositories out of `names` that `user` may pull; used to filter the
    /// catalog listing.
    pub fn filter_pullable<'a>(
        &self,
        user: Option<&'a str>,
        names: impl IntoIterator<Item = String>,
    ) -> Vec<String> {
        names
            .into_iter()
            .filter(|name| {
                self.allowed_repository_actions(user, name)
                    .contains(&Action::Pull)
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    fn policy() -> AccessPolicy {
        AccessPolicy {
            users: HashMap::from([
                ("alice".to_string(), "wonderland".to_string()),
                ("bob".to_string(), "builder".to_string()),
            ]),
            namespace_roles: HashMap::from([(
                "team".to_string(),
                HashMap::from([
                    ("alice".to_string(), NamespaceRole::Owner),
                    ("bob".to_string(), NamespaceRole::Collaborator),
                    ("carol".to_string(), NamespaceRole::Consumer),
                ]),
            )]),
            private_distributions: HashMap::from([(
                "secret/app".to_string(),
                HashSet::from(["alice".to_string()]),
            )]),
        }
    }

    #[rstest]
    fn authentication() {
        let p = policy();
        assert!(p.authenticate("alice", "wonderland"));
        assert!(!p.authenticate("alice", "rabbit"));
        assert!(!p.authenticate("mallory", "whatever"));
    }

    #[rstest]
    fn anonymous_pulls_public_only() {
        let p = policy();
        let scope = Scope::parse("repository:library/busybox:pull,push").unwrap();
        let entry = p.evaluate(None, &scope);
        assert_eq!(entry.actions, vec!["pull".to_string()]);

        let scope = Scope::parse("repository:secret/app:pull").unwrap();
        let entry = p.evaluate(None, &scope);
        assert!(entry.actions.is_empty());
    }

    #[rstest]
    fn roles_grant_expected_actions() {
        let p = policy();
        let scope = Scope::parse("repository:team/app:pull,push").unwrap();

        let owner = p.evaluate(Some("alice"), &scope);
        assert!(owner.allows(Action::Push));

        let collaborator = p.evaluate(Some("bob"), &scope);
        assert!(collaborator.allows(Action::Push));

        let consumer = p.evaluate(Some("carol"), &scope);
        assert!(consumer.allows(Action::Pull));
        assert!(!consumer.allows(Action::Push));
    }

    #[rstest]
    fn username_namespace_is_implicitly_owned() {
        let p = policy();
        let scope = Scope::parse("repository:bob/sandbox:pull,push").unwrap();
        let entry = p.evaluate(Some("bob"), &scope);
        assert!(entry.allows(Action::Push));
    }

    #[rstest]
    fn private_distribution_requires_grant() {
        let p = policy();
        let scope = Scope::parse("repository:secret/app:pull").unwrap();
        assert!(p.evaluate(Some("alice"), &scope).allows(Action::Pull));
        assert!(!p.evaluate(Some("bob"), &scope).allows(Action::Pull));
    }

    #[rstest]
    fn granted_is_subset_of_requested() {
        let p = policy();
        let scope = Scope::parse("repository:team/app:pull").unwrap();
        let entry = p.evaluate(Some("alice"), &scope);
        // owner could push, but only pull was requested
        assert_eq!(entry.actions, vec!["pull".to_string()]);
    }

    #[rstest]
    fn catalog_scope_requires_authentication() {
        let p = policy();
        let scope = Scope::parse("registry:catalog:*").unwrap();
        assert!(p.evaluate(None, &scope).actions.is_empty());
        assert!(!p.evaluate(Some("alice"), &scope).actions.is_empty());
    }
}
