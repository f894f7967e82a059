use anyhow::Context as _;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Discovered OAuth endpoints for an MCP server.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub auth_url: Option<String>,
    pub token_url: Option<String>,
    pub registration_url: Option<String>,
    pub scopes: Vec<String>,
    /// The MCP server URL, sent as the `resource` parameter (RFC 8707).
    pub resource: String,
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("could not discover OAuth resource metadata")]
    NoResourceMetadata,
    #[error("no authorization servers in resource metadata")]
    NoAuthorizationServers,
    #[error("could not discover authorization server metadata")]
    NoAuthServerMetadata,
}

#[derive(Debug, Clone, Deserialize)]
struct ProtectedResourceMetadata {
    #[serde(default)]
    authorization_servers: Vec<String>,
    #[serde(default)]
    scopes_supported: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct AuthServerMetadata {
    #[serde(default)]
    authorization_endpoint: Option<String>,
    #[serde(default)]
    token_endpoint: Option<String>,
    #[serde(default)]
    registration_endpoint: Option<String>,
    #[serde(default)]
    scopes_supported: Option<Vec<String>>,
}

/// Discover OAuth endpoints for a server URL (RFC 9728 then RFC 8414).
///
/// Resource metadata is looked for at the path-specific well-known URL, then
/// at the root; when neither exists, a dummy `initialize` POST is sent and a
/// 401 `WWW-Authenticate: ... resource_metadata="<url>"` pointer is followed.
pub async fn discover(http: &reqwest::Client, server_url: &str) -> anyhow::Result<Discovery> {
    let parsed = Url::parse(server_url).with_context(|| format!("parse server url {server_url}"))?;
    let base = origin_of(&parsed)?;

    let mut prm: Option<ProtectedResourceMetadata> = None;
    for candidate in [
        format!("{base}/.well-known/oauth-protected-resource{}", parsed.path()),
        format!("{base}/.well-known/oauth-protected-resource"),
    ] {
        if let Some(meta) = fetch_json::<ProtectedResourceMetadata>(http, &candidate).await {
            debug!(url = %candidate, "found resource metadata");
            prm = Some(meta);
            break;
        }
    }

    if prm.is_none() {
        if let Some(meta_url) = probe_www_authenticate(http, server_url).await {
            debug!(url = %meta_url, "following WWW-Authenticate resource_metadata");
            prm = fetch_json::<ProtectedResourceMetadata>(http, &meta_url).await;
        }
    }

    let prm = prm.ok_or(DiscoveryError::NoResourceMetadata)?;
    let issuer = prm
        .authorization_servers
        .first()
        .ok_or(DiscoveryError::NoAuthorizationServers)?;
    let issuer_url = Url::parse(issuer).with_context(|| format!("parse issuer {issuer}"))?;
    let issuer_base = origin_of(&issuer_url)?;

    let mut auth_meta: Option<AuthServerMetadata> = None;
    for candidate in [
        format!(
            "{issuer_base}/.well-known/oauth-authorization-server{}",
            issuer_url.path()
        ),
        format!("{issuer_base}/.well-known/oauth-authorization-server"),
        format!("{issuer_base}/.well-known/openid-configuration"),
    ] {
        if let Some(meta) = fetch_json::<AuthServerMetadata>(http, &candidate).await {
            debug!(url = %candidate, "found authorization server metadata");
            auth_meta = Some(meta);
            break;
        }
    }
    let auth_meta = auth_meta.ok_or(DiscoveryError::NoAuthServerMetadata)?;

    Ok(Discovery {
        auth_url: auth_meta.authorization_endpoint,
        token_url: auth_meta.token_endpoint,
        registration_url: auth_meta.registration_endpoint,
        scopes: auth_meta
            .scopes_supported
            .or(prm.scopes_supported)
            .unwrap_or_default(),
        resource: server_url.to_string(),
    })
}

/// POST a throwaway `initialize` and mine the 401 challenge for a
/// `resource_metadata` pointer.
async fn probe_www_authenticate(http: &reqwest::Client, server_url: &str) -> Option<String> {
    let resp = http
        .post(server_url)
        .header("content-type", "application/json")
        .body(r#"{"jsonrpc":"2.0","method":"initialize","id":"1"}"#)
        .send()
        .await
        .ok()?;
    if resp.status() != reqwest::StatusCode::UNAUTHORIZED {
        return None;
    }
    let challenge = resp
        .headers()
        .get("www-authenticate")
        .and_then(|v| v.to_str().ok())?;
    extract_resource_metadata(challenge)
}

/// Pull the quoted URL out of `resource_metadata="<url>"`.
fn extract_resource_metadata(challenge: &str) -> Option<String> {
    let rest = challenge.split_once("resource_metadata=\"")?.1;
    let (url, _) = rest.split_once('"')?;
    if url.is_empty() {
        None
    } else {
        Some(url.to_string())
    }
}

async fn fetch_json<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
) -> Option<T> {
    let resp = http
        .get(url)
        .header("accept", "application/json")
        .send()
        .await
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    resp.json::<T>().await.ok()
}

fn origin_of(url: &Url) -> anyhow::Result<String> {
    let host = url.host_str().context("url missing host")?;
    Ok(match url.port() {
        Some(p) => format!("{}://{host}:{p}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    })
}
