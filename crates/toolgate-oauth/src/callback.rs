use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use tokio::sync::{oneshot, Mutex};

/// Fixed loopback port for the authorization redirect. Registered redirect
/// URIs have to match exactly, so this cannot float per run.
pub const CALLBACK_PORT: u16 = 8085;

/// Maximum time to sit waiting for the user to finish in the browser.
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(120);

/// Outcome of the loopback redirect.
#[derive(Debug)]
pub struct AuthCallback {
    pub code: String,
    pub state: String,
}

#[derive(Clone)]
struct CallbackState {
    tx: Arc<Mutex<Option<oneshot::Sender<Result<AuthCallback, String>>>>>,
}

async fn callback(
    State(st): State<CallbackState>,
    Query(query): Query<HashMap<String, String>>,
) -> (StatusCode, Html<String>) {
    let (status, page, outcome) = match (query.get("code"), query.get("error")) {
        (Some(code), _) => (
            StatusCode::OK,
            success_page(),
            Some(Ok(AuthCallback {
                code: code.clone(),
                state: query.get("state").cloned().unwrap_or_default(),
            })),
        ),
        (None, Some(error)) => (
            StatusCode::BAD_REQUEST,
            error_page(error),
            Some(Err(error.clone())),
        ),
        (None, None) => (StatusCode::NOT_FOUND, String::new(), None),
    };

    if let Some(outcome) = outcome {
        let tx = st.tx.clone();
        // Let the browser receive the page before the listener is torn down.
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Some(tx) = tx.lock().await.take() {
                let _ = tx.send(outcome);
            }
        });
    }

    (status, Html(page))
}

fn success_page() -> String {
    "<html><body style=\"font-family: system-ui; text-align: center; padding: 50px;\">\
     <h1>Authorization successful</h1>\
     <p>You can close this window and return to your terminal.</p>\
     </body></html>"
        .to_string()
}

fn error_page(error: &str) -> String {
    format!(
        "<html><body style=\"font-family: system-ui; text-align: center; padding: 50px;\">\
         <h1>Authorization failed</h1><p>Error: {error}</p></body></html>"
    )
}

/// Serve `/callback` on the loopback port until one redirect arrives or the
/// timeout passes. Any other path 404s.
pub async fn wait_for_callback(port: u16) -> anyhow::Result<AuthCallback> {
    let (tx, rx) = oneshot::channel();
    let st = CallbackState {
        tx: Arc::new(Mutex::new(Some(tx))),
    };

    let app = Router::new().route("/callback", get(callback)).with_state(st);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("bind oauth callback listener on port {port}"))?;
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let outcome = tokio::time::timeout(CALLBACK_TIMEOUT, rx).await;
    server.abort();

    match outcome {
        Err(_) => anyhow::bail!("authorization timed out or was cancelled"),
        Ok(Err(_)) => anyhow::bail!("authorization callback listener closed"),
        Ok(Ok(Err(error))) => anyhow::bail!("authorization error: {error}"),
        Ok(Ok(Ok(cb))) => Ok(cb),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests drive the handler through a real listener on an ephemeral port;
    // the fixed CALLBACK_PORT is only the production default.
    async fn spawn_and_hit(path_and_query: &str) -> (StatusCode, anyhow::Result<AuthCallback>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let wait = tokio::spawn(wait_for_callback(port));
        // Give the listener a moment to come up.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let resp = reqwest::get(format!("http://127.0.0.1:{port}{path_and_query}"))
            .await
            .expect("request callback");
        let status = StatusCode::from_u16(resp.status().as_u16()).expect("status");

        let outcome = tokio::time::timeout(Duration::from_secs(2), wait)
            .await
            .expect("callback resolved")
            .expect("join");
        (status, outcome)
    }

    #[tokio::test]
    async fn success_redirect_delivers_code_and_state() {
        let (status, outcome) = spawn_and_hit("/callback?code=abc&state=xyz").await;
        assert_eq!(status, StatusCode::OK);
        let cb = outcome.expect("callback ok");
        assert_eq!(cb.code, "abc");
        assert_eq!(cb.state, "xyz");
    }

    #[tokio::test]
    async fn error_redirect_fails_the_wait() {
        let (status, outcome) = spawn_and_hit("/callback?error=access_denied").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let err = outcome.expect_err("callback err").to_string();
        assert!(err.contains("access_denied"), "{err}");
    }

    #[tokio::test]
    async fn unrelated_paths_are_404() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let wait = tokio::spawn(wait_for_callback(port));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let resp = reqwest::get(format!("http://127.0.0.1:{port}/favicon.ico"))
            .await
            .expect("request");
        assert_eq!(resp.status(), 404);

        // A 404 must not resolve the wait; the real callback still lands.
        let resp = reqwest::get(format!("http://127.0.0.1:{port}/callback?code=c&state=s"))
            .await
            .expect("request");
        assert_eq!(resp.status(), 200);
        let cb = tokio::time::timeout(Duration::from_secs(2), wait)
            .await
            .expect("resolved")
            .expect("join")
            .expect("callback ok");
        assert_eq!(cb.code, "c");
    }
}
