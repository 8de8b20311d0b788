//! HTTP client for upstream Distribution-API registries.
//!
//! Authenticates on demand by answering the upstream's `WWW-Authenticate`
//! challenge (Bearer token exchange or Basic), lists tags with pagination,
//! negotiates manifest media types with a full `Accept` set, and retries
//! transient failures with exponential backoff.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;

use wharf_core::media_types::MANIFEST_ACCEPT;
use wharf_core::registry::Remote;
use wharf_core::OciDigest;

use super::errors::{Error, Result};

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const TAG_PAGE_SIZE: usize = 100;

/// Split a `WWW-Authenticate` parameter list of `key="value"` pairs.
pub(crate) fn parse_comma_separated_quoted_kv_str(input: &str) -> Vec<(String, String)> {
    let mut ret = Vec::new();
    let mut input = input;

    while let Some((key, remaining)) = input.split_once('=') {
        // expecting double quoted value, assume there can be no escape character
        if let Some(remaining) = remaining.strip_prefix('\"') {
            if let Some((value, remaining)) = remaining.split_once('\"') {
                ret.push((key.trim().to_string(), value.to_string()));
                match remaining.strip_prefix(',') {
                    None => break,
                    Some(remaining) => input = remaining,
                }
            } else {
                break;
            }
        } else {
            break;
        }
    }
    ret
}

#[derive(Debug, Deserialize)]
struct UpstreamToken {
    token: Option<String>,
    access_token: Option<String>,
}

impl UpstreamToken {
    fn into_token(self) -> Option<String> {
        self.token.or(self.access_token)
    }
}

#[derive(Debug, Deserialize)]
struct UpstreamTagList {
    #[allow(dead_code)]
    name: Option<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// A manifest as received from upstream: the exact bytes, the advertised
/// media type, and the digest header if the upstream sent one.
#[derive(Clone, Debug)]
pub struct FetchedManifest {
    pub bytes: Bytes,
    pub media_type: String,
    pub digest_header: Option<OciDigest>,
}

pub struct UpstreamClient {
    http: Client,
    base_url: String,
    repository: String,
    basic_auth: Option<(String, String)>,
    bearer_token: Option<String>,
    max_retries: u32,
}

impl UpstreamClient {
    pub fn for_remote(remote: &Remote) -> Self {
        Self {
            http: Client::new(),
            base_url: remote.url.trim_end_matches('/').to_string(),
            repository: remote.upstream_name.clone(),
            basic_auth: match (&remote.username, &remote.password) {
                (Some(u), Some(p)) => Some((u.clone(), p.clone())),
                _ => None,
            },
            bearer_token: None,
            max_retries: remote.max_retries,
        }
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    fn apply_auth(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(token) = &self.bearer_token {
            request.bearer_auth(token)
        } else {
            request
        }
    }

    /// Answer a `WWW-Authenticate` challenge. Bearer challenges are
    /// exchanged for a token at the advertised realm; Basic challenges are
    /// satisfied by attaching the remote's credentials directly.
    async fn try_authenticate(&mut self, www_auth: &str) -> Result<()> {
        let fields: HashMap<String, String> =
            HashMap::from_iter(parse_comma_separated_quoted_kv_str(www_auth));
        if let Some(realm) = fields.get("Bearer realm") {
            let scope = fields
                .get("scope")
                .cloned()
                .unwrap_or_else(|| format!("repository:{}:pull", self.repository));
            let service = fields.get("service").cloned().unwrap_or_default();
            let mut request = self
                .http
                .get(format!("{realm}?service={service}&scope={scope}"));
            if let Some((username, password)) = self.basic_auth.clone() {
                request = request.basic_auth(username, Some(password));
            }
            let response = request.send().await?;
            if !response.status().is_success() {
                return Err(Error::Auth(format!(
                    "token endpoint returned {}",
                    response.status()
                )));
            }
            let token: UpstreamToken = response.json().await?;
            match token.into_token() {
                Some(token) => {
                    self.bearer_token = Some(token);
                    Ok(())
                }
                None => Err(Error::Auth("token response carried no token".to_string())),
            }
        } else if www_auth.trim_start().starts_with("Basic") {
            if self.basic_auth.is_none() {
                return Err(Error::Auth(
                    "upstream requires basic credentials".to_string(),
                ));
            }
            Ok(())
        } else {
            Err(Error::Auth(format!("unsupported challenge: {www_auth}")))
        }
    }

    async fn send_once(&mut self, request: RequestBuilder) -> Result<Response> {
        let cloned = request
            .try_clone()
            .expect("sync requests carry no streaming body");
        let mut req = self.apply_auth(request);
        if self.bearer_token.is_none() {
            if let Some((username, password)) = self.basic_auth.clone() {
                req = req.basic_auth(username, Some(password));
            }
        }
        let response = req.send().await?;
        if response.status().as_u16() == 401 {
            let www_auth = response
                .headers()
                .get("www-authenticate")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| Error::Auth("401 without www-authenticate".to_string()))?;
            self.try_authenticate(&www_auth).await?;
            let response = self.apply_auth(cloned).send().await?;
            return Ok(response);
        }
        Ok(response)
    }

    /// Send with retry: transient transport errors, 5xx, 408 and 429 back
    /// off exponentially up to the remote's `max_retries`. The upstream's
    /// suggested delay on 429 is deliberately ignored.
    async fn send(&mut self, request: RequestBuilder) -> Result<Response> {
        let mut attempt = 0u32;
        loop {
            let cloned = request
                .try_clone()
                .expect("sync requests carry no streaming body");
            let result: Result<Response> = match self.send_once(cloned).await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() || status.is_redirection() || status.as_u16() == 404 {
                        return Ok(response);
                    }
                    Err(Error::Upstream {
                        status: status.as_u16(),
                        message: format!("{} {}", status, response.url()),
                    })
                }
                Err(e) => Err(e),
            };

            let err = result.unwrap_err();
            if !err.is_transient() || attempt >= self.max_retries {
                return Err(err);
            }
            let delay = BACKOFF_BASE * 2u32.saturating_pow(attempt);
            tracing::debug!("retrying after {delay:?}: {err}");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// List all tags, following `n`/`last` pagination until a short page.
    pub async fn list_tags(&mut self) -> Result<Vec<String>> {
        let mut tags: Vec<String> = Vec::new();
        let mut last: Option<String> = None;
        loop {
            let mut url = format!(
                "{}/v2/{}/tags/list?n={}",
                self.base_url, self.repository, TAG_PAGE_SIZE
            );
            if let Some(last) = &last {
                url.push_str(&format!("&last={last}"));
            }
            let response = self.send(self.http.get(url)).await?;
            if response.status().as_u16() == 404 {
                return Err(Error::Upstream {
                    status: 404,
                    message: format!("repository {} not found upstream", self.repository),
                });
            }
            let page: UpstreamTagList = response.json().await?;
            let page = page.tags.unwrap_or_default();
            let page_len = page.len();
            tags.extend(page);
            if page_len < TAG_PAGE_SIZE {
                break;
            }
            last = tags.last().cloned();
        }
        Ok(tags)
    }

    /// HEAD the manifest to learn its digest without the body; used to skip
    /// downloads of content the registry already holds.
    pub async fn head_manifest_digest(&mut self, reference: &str) -> Result<Option<OciDigest>> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url, self.repository, reference
        );
        let request = self
            .http
            .head(url)
            .header("accept", MANIFEST_ACCEPT.join(", "));
        let response = self.send(request).await?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        Ok(response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| OciDigest::try_from(v).ok()))
    }

    pub async fn get_manifest(&mut self, reference: &str) -> Result<Option<FetchedManifest>> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url, self.repository, reference
        );
        let request = self
            .http
            .get(url)
            .header("accept", MANIFEST_ACCEPT.join(", "));
        let response = self.send(request).await?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let media_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let digest_header = response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| OciDigest::try_from(v).ok());
        let bytes = response.bytes().await?;
        Ok(Some(FetchedManifest {
            bytes,
            media_type,
            digest_header,
        }))
    }

    /// Stream a blob. The response body is handed to the blob store
    /// unbuffered.
    pub async fn get_blob(&mut self, digest: &OciDigest) -> Result<Response> {
        let url = format!("{}/v2/{}/blobs/{}", self.base_url, self.repository, digest);
        let response = self.send(self.http.get(url)).await?;
        if response.status().as_u16() == 404 {
            return Err(Error::Upstream {
                status: 404,
                message: format!("blob {digest} not found upstream"),
            });
        }
        Ok(response)
    }

    /// Fetch the signatures API extension document for a manifest, if the
    /// upstream serves one.
    pub async fn get_signatures_extension(
        &mut self,
        digest: &OciDigest,
    ) -> Result<Option<serde_json::Value>> {
        let url = format!(
            "{}/extensions/v2/{}/signatures/{}",
            self.base_url, self.repository, digest
        );
        let response = self.send(self.http.get(url)).await?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        Ok(Some(response.json().await?))
    }

    /// Fetch one signature object from an external sigstore laid out as
    /// `{sigstore}/{name}@{algo}={hex}/signature-{n}`.
    pub async fn get_sigstore_signature(
        &mut self,
        sigstore: &str,
        digest: &OciDigest,
        index: u32,
    ) -> Result<Option<Bytes>> {
        let url = format!(
            "{}/{}@{}={}/signature-{}",
            sigstore.trim_end_matches('/'),
            self.repository,
            digest.algorithm().as_str(),
            digest.encoded(),
            index,
        );
        let response = self.send(self.http.get(url)).await?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        Ok(Some(response.bytes().await?))
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    #[rstest]
    fn parses_bearer_challenge_params() {
        let fields = parse_comma_separated_quoted_kv_str(
            "Bearer realm=\"https://auth.docker.io/token\",service=\"registry.docker.io\",scope=\"repository:library/busybox:pull\"",
        );
        let map: HashMap<String, String> = fields.into_iter().collect();
        assert_eq!(
            map.get("Bearer realm").map(String::as_str),
            Some("https://auth.docker.io/token")
        );
        assert_eq!(
            map.get("service").map(String::as_str),
            Some("registry.docker.io")
        );
        assert_eq!(
            map.get("scope").map(String::as_str),
            Some("repository:library/busybox:pull")
        );
    }

    #[rstest]
    fn challenge_parser_tolerates_garbage() {
        assert!(parse_comma_separated_quoted_kv_str("Basic").is_empty());
        assert!(parse_comma_separated_quoted_kv_str("realm=unquoted").is_empty());
    }
}
