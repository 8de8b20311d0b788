//! Bearer authorization for registry requests.
//!
//! With token auth enabled, every request (other than the token endpoint)
//! must carry a bearer token whose `access` claims cover the endpoint's
//! required action; requests without one receive a `WWW-Authenticate:
//! Bearer` challenge pointing at the token service. With token auth
//! disabled, Basic / Remote-User identification is accepted and evaluated
//! directly against the access policy.

use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::header::{HeaderMap, HeaderValue};
use http::StatusCode;

use wharf_core::DistributionErrorCode;
use wharf_token::{AccessPolicy, Action, Claims, TokenVerifier};

use super::errors::into_error_response;

/// The authenticated (or anonymous) principal of one request.
#[derive(Clone, Debug, Default)]
pub struct AuthContext {
    pub subject: Option<String>,
    pub claims: Option<Claims>,
}

impl AuthContext {
    pub fn is_authenticated(&self) -> bool {
        self.subject.as_deref().map(|s| !s.is_empty()).unwrap_or(false)
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref().filter(|s| !s.is_empty())
    }
}

#[derive(Clone)]
pub struct Authorizer {
    /// `None` disables the bearer flow entirely (`token_auth_disabled`).
    pub verifier: Option<Arc<TokenVerifier>>,
    pub policy: Arc<AccessPolicy>,
    /// Absolute URL of the token endpoint, advertised in challenges.
    pub realm: String,
    /// The audience tokens must be issued for.
    pub service: String,
}

impl Authorizer {
    fn challenge(&self, scope: Option<&str>) -> HeaderValue {
        let mut value = format!(
            "Bearer realm=\"{}\",service=\"{}\"",
            self.realm, self.service
        );
        if let Some(scope) = scope {
            value.push_str(&format!(",scope=\"{scope}\""));
        }
        HeaderValue::from_str(&value)
            .unwrap_or_else(|_| HeaderValue::from_static("Bearer"))
    }

    pub fn unauthorized(&self, scope: Option<&str>, message: &str) -> Response {
        let mut response =
            into_error_response(DistributionErrorCode::Unauthorized, Some(message.to_string()));
        response
            .headers_mut()
            .insert(http::header::WWW_AUTHENTICATE, self.challenge(scope));
        response
    }

    fn denied(message: &str) -> Response {
        into_error_response(DistributionErrorCode::Denied, Some(message.to_string()))
    }

    fn bearer_token<'a>(headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
    }

    fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
        let raw = headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())?
            .strip_prefix("Basic ")?;
        let decoded = BASE64.decode(raw.as_bytes()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, password) = decoded.split_once(':')?;
        Some((user.to_string(), password.to_string()))
    }

    /// Identify the request principal without enforcing any permission.
    pub fn identify(&self, headers: &HeaderMap) -> Result<AuthContext, Response> {
        match &self.verifier {
            Some(verifier) => {
                let Some(token) = Self::bearer_token(headers) else {
                    return Ok(AuthContext::default());
                };
                let claims = verifier.verify(token, &self.service).map_err(|e| {
                    tracing::debug!("token verification failed: {e}");
                    self.unauthorized(None, "invalid bearer token")
                })?;
                Ok(AuthContext {
                    subject: Some(claims.sub.clone()),
                    claims: Some(claims),
                })
            }
            None => {
                // token auth disabled: fall back to Basic / Remote-User
                if let Some((user, password)) = Self::basic_credentials(headers) {
                    if self.policy.authenticate(&user, &password) {
                        return Ok(AuthContext {
                            subject: Some(user),
                            claims: None,
                        });
                    }
                    return Err(self.unauthorized(None, "invalid credentials"));
                }
                if let Some(user) = headers
                    .get("remote-user")
                    .and_then(|v| v.to_str().ok())
                    .filter(|v| !v.is_empty())
                {
                    return Ok(AuthContext {
                        subject: Some(user.to_string()),
                        claims: None,
                    });
                }
                Ok(AuthContext::default())
            }
        }
    }

    /// Enforce `action` on the repository `name`.
    pub fn authorize_repository(
        &self,
        headers: &HeaderMap,
        name: &str,
        action: Action,
    ) -> Result<AuthContext, Response> {
        let scope = format!("repository:{}:{}", name, action.as_str());
        let ctx = self.identify(headers)?;

        match (&self.verifier, &ctx.claims) {
            (Some(_), Some(claims)) => {
                if claims.allows_repository(name, action) {
                    Ok(ctx)
                } else if claims.is_anonymous() {
                    Err(self.unauthorized(Some(&scope), "insufficient scope"))
                } else {
                    Err(Self::denied("insufficient scope"))
                }
            }
            (Some(_), None) => Err(self.unauthorized(Some(&scope), "authentication required")),
            (None, _) => {
                let allowed = self
                    .policy
                    .allowed_repository_actions(ctx.subject(), name);
                if allowed.contains(&action) {
                    Ok(ctx)
                } else if ctx.is_authenticated() {
                    Err(Self::denied("insufficient permissions"))
                } else {
                    Err(self.unauthorized(Some(&scope), "authentication required"))
                }
            }
        }
    }

    /// Enforce catalog access: an authenticated token with the catalog
    /// scope (or, without token auth, any authenticated principal).
    pub fn authorize_catalog(&self, headers: &HeaderMap) -> Result<AuthContext, Response> {
        let ctx = self.identify(headers)?;
        match (&self.verifier, &ctx.claims) {
            (Some(_), Some(claims)) => {
                if claims.allows_catalog() && !claims.is_anonymous() {
                    Ok(ctx)
                } else {
                    Err(self.unauthorized(Some("registry:catalog:*"), "insufficient scope"))
                }
            }
            (Some(_), None) => {
                Err(self.unauthorized(Some("registry:catalog:*"), "authentication required"))
            }
            (None, _) => Ok(ctx),
        }
    }

    /// The `/v2/` version check: 401 with a challenge when token auth is on
    /// and no valid token was presented.
    pub fn authorize_base(&self, headers: &HeaderMap) -> Result<AuthContext, Response> {
        let ctx = self.identify(headers)?;
        if self.verifier.is_some() && ctx.claims.is_none() {
            return Err(self.unauthorized(None, "authentication required"));
        }
        Ok(ctx)
    }
}

/// `200 {}` body for the version check endpoint.
pub(crate) fn version_check_ok() -> Response {
    (
        StatusCode::OK,
        [(http::header::CONTENT_TYPE, "application/json")],
        "{}",
    )
        .into_response()
}
