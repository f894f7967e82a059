//! The long-lived supervisor: a unix-socket RPC server owning the MCP client
//! pool, the tool-schema cache, and the local-process supervisor.
//!
//! Each accepted connection carries exactly one JSON command and receives
//! exactly one JSON response; handlers run concurrently on their own tasks.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Notify, RwLock};
use tracing::{error, info, warn};

use toolgate_mcp::{McpClient, Tool};
use toolgate_oauth::token_for;
use toolgate_store::{Config, CredStore, StatePaths};

use crate::local::Supervisor;
use crate::rpc::{self, Command, ErrorCode, Response};

/// How long a `tools/list` result stays served from cache.
pub const TOOLS_CACHE_TTL: Duration = Duration::from_secs(300);

struct CachedTools {
    tools: Vec<Tool>,
    expires: Instant,
}

struct DaemonState {
    config: Config,
    clients: HashMap<String, Arc<McpClient>>,
    tools_cache: HashMap<String, CachedTools>,
}

#[derive(Debug, Serialize)]
struct ServerEntry {
    name: String,
    url: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    has_auth: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    is_local: bool,
}

pub struct Daemon {
    paths: StatePaths,
    store: CredStore,
    state: RwLock<DaemonState>,
    supervisor: Supervisor,
    running: AtomicBool,
    shutdown: Notify,
}

impl Daemon {
    pub fn new(paths: StatePaths) -> anyhow::Result<Self> {
        let config = Config::load(&paths)?;
        let store = CredStore::new(paths.clone());
        Ok(Self {
            paths: paths.clone(),
            store,
            state: RwLock::new(DaemonState {
                config,
                clients: HashMap::new(),
                tools_cache: HashMap::new(),
            }),
            supervisor: Supervisor::new(paths),
            running: AtomicBool::new(true),
            shutdown: Notify::new(),
        })
    }

    /// Get or lazily construct the persistent client for a server, attaching
    /// the current OAuth token at construction. A token that goes stale
    /// between acquisition and use is upstream's problem to report; the
    /// daemon never re-drives the interactive flow.
    async fn get_client(&self, name: &str) -> Result<Arc<McpClient>, Response> {
        let mut state = self.state.write().await;
        if let Some(client) = state.clients.get(name) {
            return Ok(client.clone());
        }

        let Some(spec) = state.config.servers.get(name).cloned() else {
            return Err(Response::err(
                ErrorCode::NotFound,
                format!("server '{name}' not configured"),
            ));
        };

        let client = match McpClient::new(name, spec.clone(), self.store.clone()) {
            Ok(c) => Arc::new(c),
            Err(e) => return Err(Response::err(ErrorCode::DaemonError, e.to_string())),
        };

        let (token, need_reauth) = token_for(&self.store, name, &spec).await;
        if need_reauth {
            warn!(server = %name, "stored token expired and refresh unavailable; run `toolgate auth {name}`");
        }
        client.set_token(token);

        state.clients.insert(name.to_string(), client.clone());
        Ok(client)
    }

    /// Cached-if-fresh `tools/list`.
    async fn get_tools(&self, name: &str) -> Result<Vec<Tool>, Response> {
        {
            let state = self.state.read().await;
            if let Some(cached) = state.tools_cache.get(name) {
                if Instant::now() < cached.expires {
                    return Ok(cached.tools.clone());
                }
            }
        }

        let client = self.get_client(name).await?;
        let tools = client
            .list_tools()
            .await
            .map_err(|e| Response::err(ErrorCode::from_mcp_error(&e), e.to_string()))?;

        self.state.write().await.tools_cache.insert(
            name.to_string(),
            CachedTools {
                tools: tools.clone(),
                expires: Instant::now() + TOOLS_CACHE_TTL,
            },
        );
        Ok(tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        tool: &str,
        arguments: Option<Value>,
    ) -> Result<Value, Response> {
        let client = self.get_client(name).await?;
        client
            .call_tool(tool, arguments)
            .await
            .map_err(|e| Response::err(ErrorCode::from_mcp_error(&e), e.to_string()))
    }

    /// Reload config and evict exactly the clients whose server disappeared
    /// or whose `url`/`session_based` changed; untouched specs keep their
    /// clients and caches. Local process membership is reconciled only at
    /// daemon startup.
    pub async fn reload(&self) -> anyhow::Result<()> {
        let new_config = Config::load(&self.paths)?;
        let mut state = self.state.write().await;
        let old_config = std::mem::replace(&mut state.config, new_config);

        let names: Vec<String> = state.clients.keys().cloned().collect();
        for name in names {
            let evict = match (old_config.servers.get(&name), state.config.servers.get(&name)) {
                (_, None) => true,
                (None, Some(_)) => true,
                (Some(old), Some(new)) => {
                    old.url != new.url || old.session_based != new.session_based
                }
            };
            if evict {
                info!(server = %name, "config changed, dropping client");
                if let Some(client) = state.clients.remove(&name) {
                    client.close().await;
                }
                state.tools_cache.remove(&name);
            }
        }
        Ok(())
    }

    async fn close_all_clients(&self) {
        let mut state = self.state.write().await;
        for (_, client) in state.clients.drain() {
            client.close().await;
        }
        state.tools_cache.clear();
    }

    /// Dispatch one command. Unknown actions touch nothing.
    pub async fn handle_command(&self, cmd: &Command) -> Response {
        match cmd.action.as_str() {
            "ping" => Response::ok("pong"),

            "servers" => {
                let state = self.state.read().await;
                let mut servers: Vec<ServerEntry> = state
                    .config
                    .servers
                    .iter()
                    .map(|(name, spec)| ServerEntry {
                        name: name.clone(),
                        url: spec.url.clone(),
                        has_auth: !spec.headers.is_empty(),
                        is_local: spec.local.is_some(),
                    })
                    .collect();
                servers.sort_by(|a, b| a.name.cmp(&b.name));
                Response::ok(serde_json::json!({ "servers": servers }))
            }

            "tools" => {
                let Some(server) = cmd.server.as_deref() else {
                    return Response::err(ErrorCode::InvalidArgs, "server name required");
                };
                match self.get_tools(server).await {
                    Ok(tools) => {
                        Response::ok(serde_json::json!({ "server": server, "tools": tools }))
                    }
                    Err(resp) => resp,
                }
            }

            "call" => {
                let (Some(server), Some(tool)) = (cmd.server.as_deref(), cmd.tool.as_deref())
                else {
                    return Response::err(ErrorCode::InvalidArgs, "server and tool names required");
                };
                match self.call_tool(server, tool, cmd.arguments.clone()).await {
                    Ok(result) => Response::ok(serde_json::json!({
                        "server": server,
                        "tool": tool,
                        "result": result,
                    })),
                    Err(resp) => resp,
                }
            }

            "status" => {
                let processes = self.supervisor.status().await;
                let state = self.state.read().await;
                let local = state
                    .config
                    .servers
                    .values()
                    .filter(|s| s.local.is_some())
                    .count();
                Response::ok(serde_json::json!({
                    "daemon": "running",
                    "servers": state.config.servers.len(),
                    "local": local,
                    "processes": processes,
                }))
            }

            "reload" => match self.reload().await {
                Ok(()) => Response::ok("config reloaded"),
                Err(e) => Response::err(ErrorCode::DaemonError, e.to_string()),
            },

            "shutdown" => {
                self.running.store(false, Ordering::SeqCst);
                self.supervisor.stop_all().await;
                self.shutdown.notify_waiters();
                Response::ok("shutting down")
            }

            other => Response::err(
                ErrorCode::UnknownAction,
                format!("unknown action: {other}"),
            ),
        }
    }

    async fn handle_connection(&self, mut stream: UnixStream) {
        let start = Instant::now();

        let cmd = match read_command(&mut stream).await {
            Ok(cmd) => cmd,
            Err(e) => {
                error!(error = %e, "failed to parse command");
                let resp = Response::err(ErrorCode::ParseError, e.to_string());
                let _ = write_response(&mut stream, &resp).await;
                return;
            }
        };

        let response = self.handle_command(&cmd).await;

        if cmd.action != "ping" {
            info!(
                action = %cmd.action,
                server = cmd.server.as_deref().unwrap_or("-"),
                tool = cmd.tool.as_deref().unwrap_or("-"),
                status = if response.ok { "OK" } else { "ERR" },
                elapsed_ms = start.elapsed().as_millis() as u64,
                "handled command"
            );
        }

        let _ = write_response(&mut stream, &response).await;
    }

    /// Bind the socket, start local servers, and serve until a `shutdown`
    /// command or a SIGTERM/SIGINT. On the way out: children first, then
    /// clients, then the socket and PID files.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        self.paths.ensure_base()?;

        let socket = self.paths.socket_file();
        if socket.exists() {
            std::fs::remove_file(&socket)
                .with_context(|| format!("remove stale socket {}", socket.display()))?;
        }
        std::fs::write(self.paths.pid_file(), std::process::id().to_string())
            .context("write pid file")?;

        let listener = UnixListener::bind(&socket)
            .with_context(|| format!("bind unix socket {}", socket.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            std::fs::set_permissions(&socket, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("chmod 600 {}", socket.display()))?;
        }
        info!(socket = %socket.display(), pid = std::process::id(), "daemon started");

        let me = self.clone();
        tokio::spawn(async move {
            me.wait_for_signal().await;
        });

        {
            let servers = self.state.read().await.config.servers.clone();
            self.supervisor.start_all(&servers).await;
        }

        // One long-lived notified future: registration happens on the first
        // select poll, so a shutdown raised from a handler task can never
        // slip between loop iterations unobserved.
        let shutdown_notified = self.shutdown.notified();
        tokio::pin!(shutdown_notified);

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let me = self.clone();
                        tokio::spawn(async move {
                            me.handle_connection(stream).await;
                        });
                    }
                    Err(e) => {
                        if self.running.load(Ordering::SeqCst) {
                            error!(error = %e, "accept failed");
                        }
                    }
                },
                _ = &mut shutdown_notified => break,
            }
        }

        // Children must be reaped before the socket disappears.
        self.supervisor.stop_all().await;
        self.close_all_clients().await;
        drop(listener);
        let _ = std::fs::remove_file(&socket);
        let _ = std::fs::remove_file(self.paths.pid_file());
        info!("daemon stopped");
        Ok(())
    }

    async fn wait_for_signal(&self) {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "install SIGTERM handler");
                return;
            }
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "install SIGINT handler");
                return;
            }
        };
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        info!("shutdown signal received");
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    // Introspection used by the integration tests.

    pub async fn client_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().await.clients.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn cached_tool_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .read()
            .await
            .tools_cache
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Read until one complete JSON command has arrived. Incomplete JSON keeps
/// reading; malformed JSON (or EOF mid-value) is a parse failure.
async fn read_command(stream: &mut UnixStream) -> anyhow::Result<Command> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await.context("read command")?;
        if n == 0 {
            anyhow::bail!("connection closed before a complete command");
        }
        buf.extend_from_slice(&chunk[..n]);
        match serde_json::from_slice::<Command>(&buf) {
            Ok(cmd) => return Ok(cmd),
            Err(e) if e.is_eof() => continue,
            Err(e) => return Err(e).context("decode command"),
        }
    }
}

async fn write_response(stream: &mut UnixStream, response: &Response) -> anyhow::Result<()> {
    let mut payload = serde_json::to_vec(response).context("encode response")?;
    payload.push(b'\n');
    stream.write_all(&payload).await.context("write response")?;
    stream.shutdown().await.context("close connection")?;
    Ok(())
}

/// Re-exec this binary as a detached foreground daemon, then poll the socket
/// until it answers.
pub async fn start_background(paths: &StatePaths) -> anyhow::Result<()> {
    if rpc::ping(paths).await {
        eprintln!("Daemon already running");
        return Ok(());
    }

    let exe = std::env::current_exe().context("resolve current executable")?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("--state-dir")
        .arg(paths.base())
        .args(["daemon", "start", "--foreground"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        cmd.process_group(0);
    }
    let child = cmd.spawn().context("spawn daemon process")?;

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if rpc::ping(paths).await {
            eprintln!("Daemon started (pid {})", child.id());
            return Ok(());
        }
    }
    anyhow::bail!("daemon did not come up (pid {})", child.id())
}
