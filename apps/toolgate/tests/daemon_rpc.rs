//! End-to-end daemon scenarios over a redirected state directory: socket
//! round-trips, tool caching, hot reload, and shutdown ordering.

#![cfg(unix)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use tempfile::tempdir;
use tokio::time::timeout;

use toolgate::daemon::Daemon;
use toolgate::rpc::{send_command, Command, ErrorCode};
use toolgate_store::{Config, LocalSpec, ServerSpec, StatePaths};

/// Upstream that serves `tools/list` once, then errors; a cache hit is the
/// only way a second listing can succeed.
#[derive(Clone, Default)]
struct Upstream {
    list_calls: Arc<tokio::sync::Mutex<u32>>,
}

async fn mcp_endpoint(
    State(st): State<Upstream>,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let id = body.get("id").cloned().unwrap_or(serde_json::Value::Null);
    let method = body.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let result = match method {
        "initialize" => serde_json::json!({"protocolVersion": "2024-11-05"}),
        "tools/list" => {
            let mut calls = st.list_calls.lock().await;
            *calls += 1;
            if *calls > 1 {
                return Json(serde_json::json!({
                    "jsonrpc": "2.0", "id": id,
                    "error": {"code": -32000, "message": "upstream contacted twice"}
                }));
            }
            serde_json::json!({"tools": [{"name": "t1", "description": "d"}]})
        }
        "tools/call" => serde_json::json!({"content": [{"type": "text", "text": "done"}]}),
        _ => serde_json::json!({}),
    };
    Json(serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

async fn start_upstream(st: Upstream) -> (String, tokio::task::JoinHandle<()>) {
    let app = Router::new().route("/mcp", post(mcp_endpoint)).with_state(st);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream");
    let addr = listener.local_addr().expect("addr");
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/mcp"), handle)
}

fn write_config(paths: &StatePaths, servers: &[(&str, ServerSpec)]) {
    let mut config = Config::default();
    for (name, spec) in servers {
        config.servers.insert(name.to_string(), spec.clone());
    }
    config.save(paths).expect("save config");
}

async fn wait_for_socket(paths: &StatePaths) {
    for _ in 0..100 {
        if toolgate::rpc::ping(paths).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("daemon socket never came up at {:?}", paths.socket_file());
}

#[tokio::test]
async fn ping_over_the_socket() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let paths = StatePaths::new(dir.path());
    write_config(&paths, &[]);

    let daemon = Arc::new(Daemon::new(paths.clone())?);
    let run = tokio::spawn(daemon.clone().run());
    wait_for_socket(&paths).await;

    let resp = send_command(&paths, &Command::new("ping")).await?;
    assert!(resp.ok);
    assert_eq!(resp.data, Some(serde_json::json!("pong")));

    let resp = send_command(&paths, &Command::new("shutdown")).await?;
    assert!(resp.ok);
    assert_eq!(resp.data, Some(serde_json::json!("shutting down")));

    timeout(Duration::from_secs(5), run).await??.expect("run ok");
    assert!(!paths.socket_file().exists());
    assert!(!paths.pid_file().exists());
    Ok(())
}

#[tokio::test]
async fn tools_are_cached_within_ttl() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let paths = StatePaths::new(dir.path());
    let upstream = Upstream::default();
    let (url, task) = start_upstream(upstream.clone()).await;
    write_config(&paths, &[("x", ServerSpec::new(&url))]);

    let daemon = Daemon::new(paths.clone())?;
    let mut cmd = Command::new("tools");
    cmd.server = Some("x".to_string());

    let first = daemon.handle_command(&cmd).await;
    assert!(first.ok, "{first:?}");
    let second = daemon.handle_command(&cmd).await;
    assert!(second.ok, "{second:?}");
    assert_eq!(first.data, second.data);

    // The second listing never reached upstream.
    assert_eq!(*upstream.list_calls.lock().await, 1);
    let data = first.data.unwrap();
    assert_eq!(data["tools"][0]["name"], "t1");
    task.abort();
    Ok(())
}

#[tokio::test]
async fn reload_with_changed_url_evicts_client_and_cache() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let paths = StatePaths::new(dir.path());
    let (url, task) = start_upstream(Upstream::default()).await;
    write_config(&paths, &[("s1", ServerSpec::new(&url))]);

    let daemon = Daemon::new(paths.clone())?;
    let mut cmd = Command::new("tools");
    cmd.server = Some("s1".to_string());
    assert!(daemon.handle_command(&cmd).await.ok);
    assert_eq!(daemon.client_names().await, vec!["s1"]);
    assert_eq!(daemon.cached_tool_servers().await, vec!["s1"]);

    write_config(&paths, &[("s1", ServerSpec::new("http://127.0.0.1:1/mcp"))]);
    daemon.reload().await?;

    assert!(daemon.client_names().await.is_empty());
    assert!(daemon.cached_tool_servers().await.is_empty());
    task.abort();
    Ok(())
}

#[tokio::test]
async fn reload_with_unchanged_config_keeps_clients() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let paths = StatePaths::new(dir.path());
    let upstream = Upstream::default();
    let (url, task) = start_upstream(upstream.clone()).await;
    write_config(&paths, &[("s1", ServerSpec::new(&url))]);

    let daemon = Daemon::new(paths.clone())?;
    let mut cmd = Command::new("tools");
    cmd.server = Some("s1".to_string());
    assert!(daemon.handle_command(&cmd).await.ok);

    // Reloading the same config N times reconstructs nothing.
    daemon.reload().await?;
    daemon.reload().await?;
    assert_eq!(daemon.client_names().await, vec!["s1"]);
    assert_eq!(daemon.cached_tool_servers().await, vec!["s1"]);

    // Cache survived too: upstream is still at one call.
    assert!(daemon.handle_command(&cmd).await.ok);
    assert_eq!(*upstream.list_calls.lock().await, 1);
    task.abort();
    Ok(())
}

#[tokio::test]
async fn removed_server_is_evicted_on_reload() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let paths = StatePaths::new(dir.path());
    let (url, task) = start_upstream(Upstream::default()).await;
    write_config(&paths, &[("gone", ServerSpec::new(&url))]);

    let daemon = Daemon::new(paths.clone())?;
    let mut cmd = Command::new("tools");
    cmd.server = Some("gone".to_string());
    assert!(daemon.handle_command(&cmd).await.ok);

    write_config(&paths, &[]);
    daemon.reload().await?;
    assert!(daemon.client_names().await.is_empty());

    // The next request fails cleanly instead of using the dead client.
    let resp = daemon.handle_command(&cmd).await;
    assert!(!resp.ok);
    assert_eq!(resp.error.unwrap().code, ErrorCode::NotFound);
    task.abort();
    Ok(())
}

#[tokio::test]
async fn dispatch_validates_arguments() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let paths = StatePaths::new(dir.path());
    write_config(&paths, &[]);
    let daemon = Daemon::new(paths)?;

    let resp = daemon.handle_command(&Command::new("tools")).await;
    assert_eq!(resp.error.unwrap().code, ErrorCode::InvalidArgs);

    let mut cmd = Command::new("call");
    cmd.server = Some("s".to_string());
    let resp = daemon.handle_command(&cmd).await;
    assert_eq!(resp.error.unwrap().code, ErrorCode::InvalidArgs);

    let mut cmd = Command::new("tools");
    cmd.server = Some("nowhere".to_string());
    let resp = daemon.handle_command(&cmd).await;
    assert_eq!(resp.error.unwrap().code, ErrorCode::NotFound);
    Ok(())
}

#[tokio::test]
async fn unknown_actions_mutate_nothing() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let paths = StatePaths::new(dir.path());
    let (url, task) = start_upstream(Upstream::default()).await;
    write_config(&paths, &[("x", ServerSpec::new(&url))]);

    let daemon = Daemon::new(paths)?;
    let resp = daemon.handle_command(&Command::new("frobnicate")).await;
    assert!(!resp.ok);
    let err = resp.error.unwrap();
    assert_eq!(err.code, ErrorCode::UnknownAction);
    assert!(err.message.contains("frobnicate"));

    assert!(daemon.client_names().await.is_empty());
    assert!(daemon.cached_tool_servers().await.is_empty());
    assert!(daemon.is_running());
    task.abort();
    Ok(())
}

#[tokio::test]
async fn servers_action_snapshots_config() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let paths = StatePaths::new(dir.path());
    let mut with_auth = ServerSpec::new("https://a.example.com/mcp");
    with_auth
        .headers
        .insert("Authorization".to_string(), "Bearer x".to_string());
    write_config(
        &paths,
        &[
            ("alpha", with_auth),
            ("beta", ServerSpec::new("https://b.example.com/mcp")),
        ],
    );

    let daemon = Daemon::new(paths)?;
    let resp = daemon.handle_command(&Command::new("servers")).await;
    assert!(resp.ok);
    let servers = resp.data.unwrap()["servers"].clone();
    assert_eq!(servers[0]["name"], "alpha");
    assert_eq!(servers[0]["has_auth"], true);
    assert_eq!(servers[1]["name"], "beta");
    assert!(servers[1].get("has_auth").is_none());
    Ok(())
}

#[tokio::test]
async fn malformed_frames_get_parse_error() -> anyhow::Result<()> {
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    let dir = tempdir()?;
    let paths = StatePaths::new(dir.path());
    write_config(&paths, &[]);

    let daemon = Arc::new(Daemon::new(paths.clone())?);
    let run = tokio::spawn(daemon.clone().run());
    wait_for_socket(&paths).await;

    let mut stream = tokio::net::UnixStream::connect(paths.socket_file()).await?;
    stream.write_all(b"{this is not json").await?;
    stream.shutdown().await?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    let resp: toolgate::rpc::Response = serde_json::from_slice(&buf)?;
    assert!(!resp.ok);
    assert_eq!(resp.error.unwrap().code, ErrorCode::ParseError);

    send_command(&paths, &Command::new("shutdown")).await?;
    timeout(Duration::from_secs(5), run).await??.expect("run ok");
    Ok(())
}

#[tokio::test]
async fn shutdown_reaps_children_before_removing_socket() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let paths = StatePaths::new(dir.path());

    // A listener the readiness probe can reach; the child just sleeps.
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("http://{}/mcp", probe.local_addr()?);
    let mut spec = ServerSpec::new(&url);
    spec.local = Some(LocalSpec {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), "sleep 30".to_string()],
        env: HashMap::new(),
    });
    write_config(&paths, &[("bg", spec)]);

    let daemon = Arc::new(Daemon::new(paths.clone())?);
    let run = tokio::spawn(daemon.clone().run());
    wait_for_socket(&paths).await;

    let resp = send_command(&paths, &Command::new("status")).await?;
    assert!(resp.ok);
    let data = resp.data.unwrap();
    assert_eq!(data["local"], 1);
    assert_eq!(data["processes"][0]["name"], "bg");
    assert_eq!(data["processes"][0]["running"], true);
    let pid = data["processes"][0]["pid"].as_u64().expect("pid") as i32;

    let resp = send_command(&paths, &Command::new("shutdown")).await?;
    assert!(resp.ok);
    timeout(Duration::from_secs(10), run).await??.expect("run ok");

    // Socket gone, and the child is no longer signallable.
    assert!(!paths.socket_file().exists());
    let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
    assert!(!alive, "child {pid} survived shutdown");
    Ok(())
}
