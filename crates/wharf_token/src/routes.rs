//! The token endpoint: `GET /token/?service=...&scope=...&account=...`.

use std::sync::Arc;

use axum::extract::{RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router, TypedHeader};
use chrono::SecondsFormat;
use headers::authorization::Basic;
use headers::Authorization;
use serde::Serialize;

use crate::claims::AccessEntry;
use crate::issuer::TokenIssuer;
use crate::permissions::AccessPolicy;
use crate::scope::Scope;

/// Shared state for the token endpoint.
#[derive(Clone)]
pub struct TokenService {
    pub issuer: Arc<TokenIssuer>,
    pub policy: Arc<AccessPolicy>,
}

impl TokenService {
    pub fn new(issuer: Arc<TokenIssuer>, policy: Arc<AccessPolicy>) -> Self {
        Self { issuer, policy }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/token/", get(issue_token))
            .route("/token", get(issue_token))
            .with_state(self.clone())
    }
}

#[derive(Serialize)]
struct TokenResponse {
    token: String,
    // some clients read `access_token` (OAuth2 naming) instead of `token`
    access_token: String,
    expires_in: i64,
    issued_at: String,
}

#[derive(Default)]
struct TokenQuery {
    service: Option<String>,
    account: Option<String>,
    scopes: Vec<String>,
}

fn parse_query(raw: Option<&str>) -> TokenQuery {
    let mut query = TokenQuery::default();
    let Some(raw) = raw else {
        return query;
    };
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        match key.as_ref() {
            "service" => query.service = Some(value.into_owned()),
            "account" => query.account = Some(value.into_owned()),
            // scope may repeat; each occurrence is one scope string
            "scope" => query.scopes.push(value.into_owned()),
            _ => {}
        }
    }
    query
}

async fn issue_token(
    State(service): State<TokenService>,
    basic: Option<TypedHeader<Authorization<Basic>>>,
    RawQuery(raw_query): RawQuery,
) -> Response {
    let query = parse_query(raw_query.as_deref());

    let Some(audience) = query.service else {
        return (StatusCode::BAD_REQUEST, "missing service parameter").into_response();
    };

    // Basic credentials, when present, must verify; requests without
    // credentials proceed anonymously and receive an empty-access token
    // usable only against public content.
    let subject = match &basic {
        Some(TypedHeader(auth)) => {
            if !service.policy.authenticate(auth.username(), auth.password()) {
                tracing::warn!(user = auth.username(), "failed basic authentication");
                return (StatusCode::UNAUTHORIZED, "invalid credentials").into_response();
            }
            auth.username().to_string()
        }
        None => {
            if let Some(account) = &query.account {
                tracing::debug!(account, "unauthenticated token request");
            }
            String::new()
        }
    };
    let user = if subject.is_empty() {
        None
    } else {
        Some(subject.as_str())
    };

    let mut access: Vec<AccessEntry> = Vec::with_capacity(query.scopes.len());
    for raw_scope in &query.scopes {
        match Scope::parse(raw_scope) {
            Ok(scope) => access.push(service.policy.evaluate(user, &scope)),
            Err(e) => {
                tracing::debug!("ignoring unparseable scope {raw_scope:?}: {e}");
            }
        }
    }

    match service.issuer.issue(&subject, &audience, access) {
        Ok(issued) => {
            let body = TokenResponse {
                token: issued.token.clone(),
                access_token: issued.token,
                expires_in: issued.expires_in,
                issued_at: issued
                    .issued_at
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => {
            tracing::error!("failed to sign token: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "token signing failed").into_response()
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    #[rstest]
    fn query_parsing_handles_repeated_scopes() {
        let query = parse_query(Some(
            "service=wharf&account=alice&scope=repository%3Alibrary%2Fbusybox%3Apull&scope=registry:catalog:*",
        ));
        assert_eq!(query.service.as_deref(), Some("wharf"));
        assert_eq!(query.account.as_deref(), Some("alice"));
        assert_eq!(
            query.scopes,
            vec![
                "repository:library/busybox:pull".to_string(),
                "registry:catalog:*".to_string(),
            ]
        );
    }

    #[rstest]
    fn query_parsing_tolerates_missing_everything() {
        let query = parse_query(None);
        assert!(query.service.is_none());
        assert!(query.scopes.is_empty());
    }
}
