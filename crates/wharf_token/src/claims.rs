use serde::{Deserialize, Serialize};

use crate::scope::{Action, Scope};

/// One `access` claim entry granting `actions` on the named resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEntry {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    pub actions: Vec<String>,
}

impl AccessEntry {
    pub fn from_scope(scope: &Scope, granted: impl IntoIterator<Item = Action>) -> Self {
        Self {
            resource_type: scope.scope_type.as_str().to_string(),
            name: scope.resource.clone(),
            actions: granted
                .into_iter()
                .map(|a| a.as_str().to_string())
                .collect(),
        }
    }

    pub fn allows(&self, action: Action) -> bool {
        self.actions
            .iter()
            .any(|a| a == action.as_str() || a == Action::All.as_str())
    }
}

/// The claim set carried by issued bearer tokens.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: i64,
    pub nbf: i64,
    pub iat: i64,
    pub jti: String,
    #[serde(default)]
    pub access: Vec<AccessEntry>,
}

impl Claims {
    pub fn is_anonymous(&self) -> bool {
        self.sub.is_empty()
    }

    /// Check whether this token authorizes `action` on the repository
    /// `name`.
    pub fn allows_repository(&self, name: &str, action: Action) -> bool {
        self.access
            .iter()
            .any(|e| e.resource_type == "repository" && e.name == name && e.allows(action))
    }

    pub fn allows_catalog(&self) -> bool {
        self.access
            .iter()
            .any(|e| e.resource_type == "registry" && e.name == "catalog")
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    fn claims(access: Vec<AccessEntry>) -> Claims {
        Claims {
            iss: "wharf-token".to_string(),
            sub: "alice".to_string(),
            aud: "wharf".to_string(),
            exp: 0,
            nbf: 0,
            iat: 0,
            jti: "x".to_string(),
            access,
        }
    }

    #[rstest]
    fn wildcard_action_allows_everything() {
        let c = claims(vec![AccessEntry {
            resource_type: "repository".to_string(),
            name: "alice/app".to_string(),
            actions: vec!["*".to_string()],
        }]);
        assert!(c.allows_repository("alice/app", Action::Pull));
        assert!(c.allows_repository("alice/app", Action::Push));
        assert!(!c.allows_repository("bob/app", Action::Pull));
    }

    #[rstest]
    fn pull_only_denies_push() {
        let c = claims(vec![AccessEntry {
            resource_type: "repository".to_string(),
            name: "library/busybox".to_string(),
            actions: vec!["pull".to_string()],
        }]);
        assert!(c.allows_repository("library/busybox", Action::Pull));
        assert!(!c.allows_repository("library/busybox", Action::Push));
    }
}
