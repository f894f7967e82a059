use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use toolgate::daemon::{self, Daemon};
use toolgate::rpc::{self, Command, ErrorCode, Response};
use toolgate_mcp::McpClient;
use toolgate_oauth::{authorize, token_for};
use toolgate_store::{Config, CredStore, ServerSpec, StatePaths};

#[derive(Debug, Parser)]
#[command(name = "toolgate", version, about = "MCP bridge for AI agents")]
struct Args {
    /// Directory for runtime state (config, tokens, socket, logs).
    #[arg(long, env = "TOOLGATE_STATE_DIR", global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Create the state directory and a starter config file.
    Init,
    /// List configured servers.
    Servers,
    /// List tools on a server (through the daemon when it is running).
    Tools { server: String },
    /// Call a tool with JSON arguments.
    Call {
        server: String,
        tool: String,
        /// Tool arguments as a JSON object, e.g. '{"query":"rust"}'.
        #[arg(default_value = "{}")]
        args_json: String,
    },
    /// OAuth login for a server (opens a browser).
    Auth { server: String },
    /// Add a server to the config.
    Add {
        name: String,
        url: String,
        /// Static header, repeatable: --header 'Authorization: Bearer TOKEN'.
        #[arg(long = "header")]
        headers: Vec<String>,
        /// Session state on this server is bound to the TCP connection.
        #[arg(long)]
        session_based: bool,
        /// OAuth scope hint.
        #[arg(long)]
        scope: Option<String>,
    },
    /// Remove a server from the config.
    Remove { name: String },
    /// Clear cached session IDs.
    ClearSessions,
    /// Clear stored OAuth tokens.
    ClearTokens,
    /// Daemon and local-process status.
    Status,
    /// Ask a running daemon to reload its config.
    Reload,
    /// Tail logs for a locally-managed server.
    Logs { server: String },
    /// Manage the daemon process.
    Daemon {
        #[command(subcommand)]
        cmd: DaemonCmd,
    },
}

#[derive(Debug, Subcommand)]
enum DaemonCmd {
    /// Start the daemon (detached unless --foreground).
    Start {
        #[arg(long)]
        foreground: bool,
    },
    /// Stop a running daemon.
    Stop,
    /// Report whether the daemon is running.
    Status,
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if matches!(
        args.cmd,
        Cmd::Daemon {
            cmd: DaemonCmd::Start { foreground: true }
        }
    ) {
        init_tracing("info");
    } else {
        init_tracing("warn");
    }

    let paths = match StatePaths::resolve(args.state_dir.as_deref()) {
        Ok(p) => p,
        Err(e) => return print_response(&Response::err(ErrorCode::DaemonError, e.to_string())),
    };

    let response = match args.cmd {
        Cmd::Init => cmd_init(&paths),
        Cmd::Servers => cmd_servers(&paths),
        Cmd::Tools { server } => cmd_tools(&paths, &server).await,
        Cmd::Call {
            server,
            tool,
            args_json,
        } => cmd_call(&paths, &server, &tool, &args_json).await,
        Cmd::Auth { server } => cmd_auth(&paths, &server).await,
        Cmd::Add {
            name,
            url,
            headers,
            session_based,
            scope,
        } => cmd_add(&paths, &name, &url, &headers, session_based, scope),
        Cmd::Remove { name } => cmd_remove(&paths, &name),
        Cmd::ClearSessions => cmd_clear_sessions(&paths),
        Cmd::ClearTokens => cmd_clear_tokens(&paths),
        Cmd::Status => rpc_or_error(&paths, Command::new("status")).await,
        Cmd::Reload => rpc_or_error(&paths, Command::new("reload")).await,
        Cmd::Logs { server } => return cmd_logs(&paths, &server),
        Cmd::Daemon { cmd } => match cmd {
            DaemonCmd::Start { foreground } => return cmd_daemon_start(paths, foreground).await,
            DaemonCmd::Stop => cmd_daemon_stop(&paths).await,
            DaemonCmd::Status => cmd_daemon_status(&paths).await,
        },
    };

    print_response(&response)
}

/// The whole CLI contract: stdout is one JSON `Response`, exit code mirrors
/// `ok`.
fn print_response(response: &Response) -> ExitCode {
    match serde_json::to_string_pretty(response) {
        Ok(out) => println!("{out}"),
        Err(e) => {
            eprintln!("failed to encode response: {e}");
            return ExitCode::FAILURE;
        }
    }
    if response.ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn cmd_init(paths: &StatePaths) -> Response {
    match Config::init_default(paths) {
        Ok(created) => Response::ok(serde_json::json!({
            "message": if created { "config created" } else { "config already exists" },
            "config_file": paths.servers_file().display().to_string(),
        })),
        Err(e) => Response::err(ErrorCode::DaemonError, e.to_string()),
    }
}

fn cmd_servers(paths: &StatePaths) -> Response {
    let config = match Config::load(paths) {
        Ok(c) => c,
        Err(e) => return Response::err(ErrorCode::DaemonError, e.to_string()),
    };
    let mut servers: Vec<serde_json::Value> = config
        .servers
        .iter()
        .map(|(name, spec)| {
            serde_json::json!({
                "name": name,
                "url": spec.url,
                "has_auth": !spec.headers.is_empty(),
                "is_local": spec.local.is_some(),
            })
        })
        .collect();
    servers.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    Response::ok(serde_json::json!({ "servers": servers }))
}

async fn rpc_or_error(paths: &StatePaths, command: Command) -> Response {
    match rpc::send_command(paths, &command).await {
        Ok(resp) => resp,
        Err(e) => Response::err(ErrorCode::ConnectionFailed, e.to_string()),
    }
}

/// One-shot client for daemon-less operation.
async fn direct_client(paths: &StatePaths, name: &str) -> Result<McpClient, Response> {
    let config = Config::load(paths)
        .map_err(|e| Response::err(ErrorCode::DaemonError, e.to_string()))?;
    let Some(spec) = config.servers.get(name).cloned() else {
        return Err(Response::err(
            ErrorCode::NotFound,
            format!("server '{name}' not configured. Run `toolgate servers` to list."),
        ));
    };

    let store = CredStore::new(paths.clone());
    let client = McpClient::new(name, spec.clone(), store.clone())
        .map_err(|e| Response::err(ErrorCode::DaemonError, e.to_string()))?;
    let (token, _need_reauth) = token_for(&store, name, &spec).await;
    client.set_token(token);
    Ok(client)
}

async fn cmd_tools(paths: &StatePaths, server: &str) -> Response {
    if rpc::ping(paths).await {
        let mut cmd = Command::new("tools");
        cmd.server = Some(server.to_string());
        return rpc_or_error(paths, cmd).await;
    }

    let client = match direct_client(paths, server).await {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match client.list_tools().await {
        Ok(tools) => Response::ok(serde_json::json!({ "server": server, "tools": tools })),
        Err(e) => Response::err(ErrorCode::from_mcp_error(&e), e.to_string()),
    }
}

async fn cmd_call(paths: &StatePaths, server: &str, tool: &str, args_json: &str) -> Response {
    let arguments: serde_json::Value = match serde_json::from_str(args_json) {
        Ok(v @ serde_json::Value::Object(_)) => v,
        Ok(_) => {
            return Response::err(ErrorCode::InvalidJson, "arguments must be a JSON object");
        }
        Err(e) => {
            return Response::err(
                ErrorCode::InvalidJson,
                format!("invalid JSON arguments: {e}"),
            );
        }
    };

    if rpc::ping(paths).await {
        let mut cmd = Command::new("call");
        cmd.server = Some(server.to_string());
        cmd.tool = Some(tool.to_string());
        cmd.arguments = Some(arguments);
        return rpc_or_error(paths, cmd).await;
    }

    let client = match direct_client(paths, server).await {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match client.call_tool(tool, Some(arguments)).await {
        Ok(result) => Response::ok(serde_json::json!({
            "server": server,
            "tool": tool,
            "result": result,
        })),
        Err(e) => Response::err(ErrorCode::from_mcp_error(&e), e.to_string()),
    }
}

async fn cmd_auth(paths: &StatePaths, server: &str) -> Response {
    let config = match Config::load(paths) {
        Ok(c) => c,
        Err(e) => return Response::err(ErrorCode::DaemonError, e.to_string()),
    };
    let Some(spec) = config.servers.get(server) else {
        return Response::err(
            ErrorCode::NotFound,
            format!("server '{server}' not configured"),
        );
    };

    let store = CredStore::new(paths.clone());
    match authorize(&store, server, spec).await {
        Ok(()) => Response::ok(serde_json::json!({
            "message": format!("authorization successful, token saved for '{server}'"),
        })),
        Err(e) => Response::err(ErrorCode::AuthExpired, e.to_string()),
    }
}

fn cmd_add(
    paths: &StatePaths,
    name: &str,
    url: &str,
    headers: &[String],
    session_based: bool,
    scope: Option<String>,
) -> Response {
    let mut config = match Config::load(paths) {
        Ok(c) => c,
        Err(e) => return Response::err(ErrorCode::DaemonError, e.to_string()),
    };
    if config.servers.contains_key(name) {
        return Response::err(
            ErrorCode::Exists,
            format!("server '{name}' already exists. Remove it first with `toolgate remove`."),
        );
    }

    let mut parsed = HashMap::new();
    for header in headers {
        let Some((k, v)) = header.split_once(':') else {
            return Response::err(
                ErrorCode::InvalidArgs,
                format!("invalid header format: '{header}'. Use 'Name: Value'."),
            );
        };
        parsed.insert(k.trim().to_string(), v.trim().to_string());
    }

    let mut spec = ServerSpec::new(url);
    spec.headers = parsed;
    spec.session_based = session_based;
    spec.scope = scope;
    let entry = serde_json::json!({
        "name": name,
        "url": spec.url,
        "has_auth": !spec.headers.is_empty(),
    });
    config.servers.insert(name.to_string(), spec);

    if let Err(e) = config.save(paths) {
        return Response::err(ErrorCode::DaemonError, e.to_string());
    }
    Response::ok(serde_json::json!({
        "message": format!("server '{name}' added"),
        "server": entry,
    }))
}

fn cmd_remove(paths: &StatePaths, name: &str) -> Response {
    let mut config = match Config::load(paths) {
        Ok(c) => c,
        Err(e) => return Response::err(ErrorCode::DaemonError, e.to_string()),
    };
    if config.servers.remove(name).is_none() {
        return Response::err(ErrorCode::NotFound, format!("server '{name}' not found"));
    }
    if let Err(e) = config.save(paths) {
        return Response::err(ErrorCode::DaemonError, e.to_string());
    }
    Response::ok(serde_json::json!({ "message": format!("server '{name}' removed") }))
}

fn cmd_clear_sessions(paths: &StatePaths) -> Response {
    match CredStore::new(paths.clone()).clear_sessions() {
        Ok(()) => Response::ok("sessions cleared"),
        Err(e) => Response::err(ErrorCode::DaemonError, e.to_string()),
    }
}

fn cmd_clear_tokens(paths: &StatePaths) -> Response {
    match CredStore::new(paths.clone()).clear_tokens() {
        Ok(()) => Response::ok("OAuth tokens cleared"),
        Err(e) => Response::err(ErrorCode::DaemonError, e.to_string()),
    }
}

fn cmd_logs(paths: &StatePaths, server: &str) -> ExitCode {
    let log_path = paths.log_file(server);
    if !log_path.exists() {
        return print_response(&Response::err(
            ErrorCode::NotFound,
            format!(
                "no logs for server '{server}' (expected {})",
                log_path.display()
            ),
        ));
    }

    eprintln!("Tailing logs for '{server}' (Ctrl+C to stop)");
    let status = std::process::Command::new("tail")
        .args(["-f", "-n", "100"])
        .arg(&log_path)
        .status();
    match status {
        Ok(s) if s.success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("failed to run tail: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn cmd_daemon_start(paths: StatePaths, foreground: bool) -> ExitCode {
    if foreground {
        let daemon = match Daemon::new(paths) {
            Ok(d) => Arc::new(d),
            Err(e) => {
                return print_response(&Response::err(ErrorCode::DaemonError, e.to_string()));
            }
        };
        return match daemon.run().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => print_response(&Response::err(ErrorCode::DaemonError, e.to_string())),
        };
    }

    match daemon::start_background(&paths).await {
        Ok(()) => print_response(&Response::ok("daemon started")),
        Err(e) => print_response(&Response::err(ErrorCode::DaemonError, e.to_string())),
    }
}

async fn cmd_daemon_stop(paths: &StatePaths) -> Response {
    if !rpc::ping(paths).await {
        return Response::ok("daemon not running");
    }
    rpc_or_error(paths, Command::new("shutdown")).await
}

async fn cmd_daemon_status(paths: &StatePaths) -> Response {
    let running = rpc::ping(paths).await;
    let pid = std::fs::read_to_string(paths.pid_file())
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok());
    Response::ok(serde_json::json!({ "running": running, "pid": pid }))
}
