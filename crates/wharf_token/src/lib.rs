//! Bearer-token authorization for the Distribution API.
//!
//! Implements the [docker token
//! protocol](https://distribution.github.io/distribution/spec/auth/token/):
//! clients failing authorization receive a `WWW-Authenticate: Bearer`
//! challenge pointing at the token endpoint served from [`routes`], exchange
//! credentials for a signed JWT whose `access` claim is the intersection of
//! the requested scope and the account's evaluated permissions, then retry
//! with the token.
//!
//! Signing is asymmetric only (ES256 / RS256 / PS256, PEM keys).
pub mod errors;
pub use errors::{Error, Result};

mod scope;
pub use scope::{Action, Scope, ScopeType};

mod claims;
pub use claims::{AccessEntry, Claims};

mod issuer;
pub use issuer::{IssuedToken, SignatureAlgorithm, TokenIssuer, DEFAULT_TOKEN_TTL_SECONDS};

mod verifier;
pub use verifier::TokenVerifier;

mod permissions;
pub use permissions::{AccessPolicy, NamespaceRole};

pub mod routes;
pub use routes::TokenService;
