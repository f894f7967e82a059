use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use serde::Deserialize;
use tracing::warn;
use url::Url;

use toolgate_store::{ClientRegistration, CredStore, ServerSpec, TokenRecord, TokenState};

use crate::callback::{wait_for_callback, CALLBACK_PORT};
use crate::discovery::{discover, Discovery};
use crate::pkce::{generate_pkce, generate_state};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Client name used for dynamic registration and as the fallback client_id.
const CLIENT_NAME: &str = "toolgate";

fn http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("build oauth http client")
}

/// Run the full interactive authorization flow for a server and persist the
/// resulting token. Progress goes to stderr; stdout stays machine-readable.
pub async fn authorize(store: &CredStore, name: &str, spec: &ServerSpec) -> anyhow::Result<()> {
    let http = http_client()?;

    let explicit_auth_url = spec
        .oauth
        .as_ref()
        .and_then(|o| o.auth_url.as_deref())
        .is_some();
    let discovery = if explicit_auth_url {
        let oauth = spec.oauth.as_ref().context("oauth config present")?;
        Discovery {
            auth_url: oauth.auth_url.clone(),
            token_url: oauth.token_url.clone(),
            registration_url: oauth.registration_url.clone(),
            scopes: oauth.scopes.clone(),
            resource: oauth.resource.clone().unwrap_or_else(|| spec.url.clone()),
        }
    } else {
        eprintln!("No OAuth config found, attempting auto-discovery...");
        discover(&http, &spec.url)
            .await
            .with_context(|| format!("discover OAuth endpoints for '{name}'"))?
    };

    let auth_url = discovery
        .auth_url
        .as_deref()
        .context("OAuth config requires auth_url and token_url")?;
    let token_url = discovery
        .token_url
        .as_deref()
        .context("OAuth config requires auth_url and token_url")?;

    let scope = resolve_scope(spec, &discovery);
    let redirect_uri = format!("http://localhost:{CALLBACK_PORT}/callback");

    // Client credentials: config, then a saved registration, then RFC 7591.
    let (mut client_id, mut client_secret) = match &spec.oauth {
        Some(o) => (o.client_id.clone(), o.client_secret.clone()),
        None => (None, None),
    };
    if client_id.is_none() {
        if let Some(reg) = store.load_registrations().unwrap_or_default().remove(name) {
            client_id = Some(reg.client_id);
            client_secret = reg.client_secret;
        }
    }
    if client_id.is_none() {
        if let Some(reg_url) = discovery.registration_url.as_deref() {
            eprintln!("Performing dynamic client registration...");
            let reg = register_client(&http, reg_url, &redirect_uri, scope.as_deref()).await?;
            client_id = Some(reg.client_id.clone());
            client_secret = reg.client_secret.clone();
            store.save_registration(name, reg)?;
        }
    }
    let client_id = client_id.context("no client_id and dynamic registration unavailable")?;

    let pkce = generate_pkce();
    let state = generate_state();
    let full_auth_url = build_authorize_url(
        auth_url,
        &client_id,
        &redirect_uri,
        &state,
        &pkce.challenge,
        &discovery.resource,
        scope.as_deref(),
    )?;

    eprintln!("Opening browser for authorization...");
    eprintln!("If the browser doesn't open, visit: {full_auth_url}");
    if let Err(e) = open_browser(&full_auth_url) {
        warn!(error = %e, "failed to open browser");
    }

    let cb = wait_for_callback(CALLBACK_PORT).await?;
    if cb.state != state {
        anyhow::bail!("state mismatch - possible CSRF attack");
    }

    eprintln!("Exchanging authorization code for token...");
    let mut form = vec![
        ("grant_type", "authorization_code".to_string()),
        ("code", cb.code),
        ("redirect_uri", redirect_uri),
        ("client_id", client_id),
        ("code_verifier", pkce.verifier),
    ];
    if let Some(secret) = client_secret {
        form.push(("client_secret", secret));
    }

    let record = post_token_request(&http, token_url, &form)
        .await
        .context("token exchange failed")?;
    store.save_token(name, record)?;

    eprintln!("Authorization successful! Token saved for '{name}'");
    Ok(())
}

/// Refresh an expired token and persist the result. The previous refresh
/// token is kept when the server omits a new one.
pub async fn refresh(
    store: &CredStore,
    name: &str,
    spec: &ServerSpec,
    record: &TokenRecord,
) -> anyhow::Result<TokenRecord> {
    let token_url = spec
        .oauth
        .as_ref()
        .and_then(|o| o.token_url.as_deref())
        .context("no token URL configured")?;
    let refresh_token = record
        .refresh_token
        .as_deref()
        .context("no refresh token stored")?;
    let client_id = refresh_client_id(store, name, spec);

    let http = http_client()?;
    let form = vec![
        ("grant_type", "refresh_token".to_string()),
        ("refresh_token", refresh_token.to_string()),
        ("client_id", client_id),
    ];
    let mut refreshed = post_token_request(&http, token_url, &form)
        .await
        .context("token refresh failed")?;

    if refreshed.refresh_token.is_none() {
        refreshed.refresh_token = record.refresh_token.clone();
    }
    store.save_token(name, refreshed.clone())?;
    Ok(refreshed)
}

/// The spec's `GetToken`: `(token, need_reauth)`.
///
/// A stale token with a refresh token is refreshed in place; when that fails,
/// or no refresh token exists, the caller gets `(None, true)` and the next
/// upstream request goes out unauthenticated; re-auth is the operator's
/// move, never this function's.
pub async fn token_for(store: &CredStore, name: &str, spec: &ServerSpec) -> (Option<String>, bool) {
    match store.token_state(name, Utc::now().timestamp()) {
        TokenState::Missing => (None, false),
        TokenState::Fresh(token) => (Some(token), false),
        TokenState::Expired {
            refresh_token: None,
        } => (None, true),
        TokenState::Expired {
            refresh_token: Some(_),
        } => {
            let record = store
                .load_tokens()
                .unwrap_or_default()
                .remove(name)
                .unwrap_or_default();
            match refresh(store, name, spec, &record).await {
                Ok(new_record) => (Some(new_record.access_token), false),
                Err(e) => {
                    warn!(server = %name, error = %e, "token refresh failed");
                    (None, true)
                }
            }
        }
    }
}

fn resolve_scope(spec: &ServerSpec, discovery: &Discovery) -> Option<String> {
    if let Some(s) = spec.oauth.as_ref().and_then(|o| o.scope.clone()) {
        return Some(s);
    }
    if let Some(s) = spec.scope.clone() {
        return Some(s);
    }
    if !discovery.scopes.is_empty() {
        return Some(discovery.scopes.join(" "));
    }
    None
}

fn refresh_client_id(store: &CredStore, name: &str, spec: &ServerSpec) -> String {
    if let Some(id) = spec.oauth.as_ref().and_then(|o| o.client_id.clone()) {
        return id;
    }
    if let Some(reg) = store.load_registrations().unwrap_or_default().remove(name) {
        return reg.client_id;
    }
    CLIENT_NAME.to_string()
}

fn build_authorize_url(
    auth_url: &str,
    client_id: &str,
    redirect_uri: &str,
    state: &str,
    code_challenge: &str,
    resource: &str,
    scope: Option<&str>,
) -> anyhow::Result<String> {
    let mut url = Url::parse(auth_url).with_context(|| format!("parse auth_url {auth_url}"))?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("state", state)
        .append_pair("code_challenge", code_challenge)
        .append_pair("code_challenge_method", "S256")
        .append_pair("resource", resource);
    if let Some(scope) = scope {
        url.query_pairs_mut().append_pair("scope", scope);
    }
    Ok(url.into())
}

/// Register a client dynamically (RFC 7591). 200 and 201 both count.
async fn register_client(
    http: &reqwest::Client,
    registration_url: &str,
    redirect_uri: &str,
    scope: Option<&str>,
) -> anyhow::Result<ClientRegistration> {
    let mut body = serde_json::json!({
        "client_name": CLIENT_NAME,
        "redirect_uris": [redirect_uri],
        "grant_types": ["authorization_code", "refresh_token"],
        "response_types": ["code"],
    });
    if let Some(scope) = scope {
        body["scope"] = serde_json::Value::String(scope.to_string());
    }

    let resp = http
        .post(registration_url)
        .json(&body)
        .send()
        .await
        .context("registration request failed")?;
    let status = resp.status();
    if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::CREATED {
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("registration failed: {status} - {body}");
    }

    #[derive(Deserialize)]
    struct Registered {
        client_id: String,
        #[serde(default)]
        client_secret: Option<String>,
    }
    let reg: Registered = resp.json().await.context("decode registration response")?;
    Ok(ClientRegistration {
        client_id: reg.client_id,
        client_secret: reg.client_secret,
    })
}

/// POST a form to a token endpoint and decode the token, stamping
/// `expires_at` from `expires_in` when present. 200 and 201 both count.
async fn post_token_request(
    http: &reqwest::Client,
    token_url: &str,
    form: &[(&str, String)],
) -> anyhow::Result<TokenRecord> {
    let resp = http
        .post(token_url)
        .form(form)
        .send()
        .await
        .context("token endpoint request")?;
    let status = resp.status();
    if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::CREATED {
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("token endpoint returned {status} - {body}");
    }

    let mut record: TokenRecord = resp.json().await.context("decode token response")?;
    if let Some(expires_in) = record.expires_in {
        if expires_in > 0 {
            record.expires_at = Some(Utc::now().timestamp() + expires_in);
        }
    }
    Ok(record)
}

fn open_browser(url: &str) -> anyhow::Result<()> {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open")
            .arg(url)
            .spawn()
            .context("spawn browser opener")?;
        Ok(())
    }
    #[cfg(target_os = "linux")]
    {
        std::process::Command::new("xdg-open")
            .arg(url)
            .spawn()
            .context("spawn browser opener")?;
        Ok(())
    }
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("cmd")
            .args(["/c", "start", url])
            .spawn()
            .context("spawn browser opener")?;
        Ok(())
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        let _ = url;
        anyhow::bail!("unsupported platform for opening a browser")
    }
}
