//! The `type:resource:actions` scope grammar used by token requests.

use std::collections::BTreeSet;

use crate::errors::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScopeType {
    Repository,
    Registry,
}

impl ScopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeType::Repository => "repository",
            ScopeType::Registry => "registry",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Action {
    Pull,
    Push,
    All,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Pull => "pull",
            Action::Push => "push",
            Action::All => "*",
        }
    }
}

/// A single parsed scope, e.g. `repository:library/busybox:pull,push` or
/// `registry:catalog:*`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scope {
    pub scope_type: ScopeType,
    pub resource: String,
    pub actions: BTreeSet<Action>,
}

impl Scope {
    /// Parse one scope string. Unknown action names are ignored, matching
    /// the tolerance of other token servers; an entirely unknown action set
    /// yields an empty-action scope.
    pub fn parse(s: &str) -> Result<Scope> {
        let mut parts = s.splitn(3, ':');
        let scope_type = match parts.next() {
            Some("repository") => ScopeType::Repository,
            Some("registry") => ScopeType::Registry,
            _ => return Err(Error::InvalidScope(s.to_string())),
        };
        let resource = match parts.next() {
            Some(r) if !r.is_empty() => r.to_string(),
            _ => return Err(Error::InvalidScope(s.to_string())),
        };
        let actions_raw = parts
            .next()
            .ok_or_else(|| Error::InvalidScope(s.to_string()))?;

        let mut actions = BTreeSet::new();
        for action in actions_raw.split(',') {
            match action {
                "pull" => {
                    actions.insert(Action::Pull);
                }
                "push" => {
                    actions.insert(Action::Push);
                }
                "*" => {
                    actions.insert(Action::All);
                }
                _ => {}
            }
        }

        Ok(Scope {
            scope_type,
            resource,
            actions,
        })
    }

    pub fn is_catalog(&self) -> bool {
        self.scope_type == ScopeType::Registry && self.resource == "catalog"
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let actions = self
            .actions
            .iter()
            .map(Action::as_str)
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "{}:{}:{}", self.scope_type.as_str(), self.resource, actions)
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    #[rstest]
    fn parses_repository_scope() {
        let scope = Scope::parse("repository:library/busybox:pull,push").unwrap();
        assert_eq!(scope.scope_type, ScopeType::Repository);
        assert_eq!(scope.resource, "library/busybox");
        assert_eq!(
            scope.actions,
            BTreeSet::from([Action::Pull, Action::Push])
        );
    }

    #[rstest]
    fn parses_catalog_scope() {
        let scope = Scope::parse("registry:catalog:*").unwrap();
        assert!(scope.is_catalog());
        assert_eq!(scope.actions, BTreeSet::from([Action::All]));
    }

    #[rstest]
    #[case::missing_actions("repository:library/busybox")]
    #[case::empty_resource("repository::pull")]
    #[case::unknown_type("admin:everything:*")]
    fn rejects_malformed(#[case] s: &str) {
        assert!(Scope::parse(s).is_err());
    }

    #[rstest]
    fn unknown_actions_are_ignored() {
        let scope = Scope::parse("repository:library/busybox:pull,delete").unwrap();
        assert_eq!(scope.actions, BTreeSet::from([Action::Pull]));
    }

    #[rstest]
    fn display_roundtrip() {
        let scope = Scope::parse("repository:library/busybox:pull,push").unwrap();
        assert_eq!(scope.to_string(), "repository:library/busybox:pull,push");
    }
}
