//! Supervision of locally-spawned MCP servers.
//!
//! A local server is still spoken to over HTTP: the child is a local HTTP
//! listener whose lifecycle (spawn, log capture, readiness, crash-restart,
//! shutdown) is the daemon's responsibility.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{error, info, warn};

use toolgate_store::{LocalSpec, ServerSpec, StatePaths};

const READY_DEADLINE: Duration = Duration::from_secs(30);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const STOP_GRACE: Duration = Duration::from_secs(5);
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// One supervised child. The `exited` watch flips to true exactly once, when
/// the OS child has been reaped.
pub struct LocalProcess {
    name: String,
    url: String,
    pid: u32,
    started: Instant,
    restarts: u32,
    stopping: AtomicBool,
    exited: watch::Receiver<bool>,
    log_path: PathBuf,
}

/// Status snapshot reported over the `status` RPC.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub running: bool,
    pub url: String,
    pub restarts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,
    pub log_file: String,
}

impl LocalProcess {
    /// Spawn the child with stdout/stderr streamed into the per-server log
    /// file, each line stamped with a clock time.
    async fn spawn(
        name: &str,
        url: &str,
        local: &LocalSpec,
        restarts: u32,
        paths: &StatePaths,
    ) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(paths.logs_dir())
            .await
            .context("create logs directory")?;
        let log_path = paths.log_file(name);
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .with_context(|| format!("open log file {}", log_path.display()))?;
        log.write_all(
            format!(
                "\n=== Starting {name} at {} ===\n",
                chrono::Utc::now().to_rfc3339()
            )
            .as_bytes(),
        )
        .await
        .context("write log marker")?;
        let log = Arc::new(Mutex::new(log));

        let mut child = Command::new(&local.command)
            .args(&local.args)
            .envs(&local.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("start '{}' (command: {})", name, local.command))?;
        let pid = child.id().context("child has no pid")?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, log.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, log.clone()));
        }

        let (tx, exited) = watch::channel(false);
        tokio::spawn(async move {
            let _ = child.wait().await;
            let _ = tx.send(true);
        });

        info!(server = %name, pid, restarts, "started local server");
        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
            pid,
            started: Instant::now(),
            restarts,
            stopping: AtomicBool::new(false),
            exited,
            log_path,
        })
    }

    /// Dial the server's TCP endpoint until it accepts, the child dies, or
    /// 30 s pass.
    async fn wait_ready(&self) -> anyhow::Result<()> {
        let authority = host_port(&self.url)?;
        let deadline = Instant::now() + READY_DEADLINE;

        while Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_secs(1), TcpStream::connect(&authority)).await
            {
                Ok(Ok(conn)) => {
                    drop(conn);
                    return Ok(());
                }
                _ => {}
            }
            if *self.exited.borrow() {
                anyhow::bail!("process exited before becoming ready");
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
        anyhow::bail!("timeout waiting for '{}' to become ready", self.name)
    }

    /// SIGINT, five seconds of grace, then SIGKILL. Blocks until the child is
    /// reaped either way.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);

        let pid = nix::unistd::Pid::from_raw(self.pid as i32);
        let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGINT);

        let mut rx = self.exited.clone();
        if tokio::time::timeout(STOP_GRACE, rx.wait_for(|exited| *exited))
            .await
            .is_err()
        {
            let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
            let _ = rx.wait_for(|exited| *exited).await;
        }
        info!(server = %self.name, "stopped local server");
    }

    pub fn is_running(&self) -> bool {
        !*self.exited.borrow()
    }

    pub fn info(&self) -> ProcessInfo {
        let running = self.is_running();
        ProcessInfo {
            name: self.name.clone(),
            pid: running.then_some(self.pid),
            running,
            url: self.url.clone(),
            restarts: self.restarts,
            uptime: running.then(|| format!("{}s", self.started.elapsed().as_secs())),
            log_file: self.log_path.display().to_string(),
        }
    }
}

async fn pump_lines(pipe: impl tokio::io::AsyncRead + Unpin, log: Arc<Mutex<tokio::fs::File>>) {
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let stamped = format!("[{}] {line}\n", chrono::Local::now().format("%H:%M:%S"));
        let mut file = log.lock().await;
        let _ = file.write_all(stamped.as_bytes()).await;
    }
}

/// `host:port` for the TCP readiness dial.
fn host_port(url: &str) -> anyhow::Result<String> {
    let parsed = url::Url::parse(url).with_context(|| format!("parse local server url {url}"))?;
    let host = parsed.host_str().context("local server url missing host")?;
    let port = parsed
        .port_or_known_default()
        .context("local server url missing port")?;
    Ok(format!("{host}:{port}"))
}

/// Tracks every `local`-configured server the daemon has spawned.
#[derive(Clone)]
pub struct Supervisor {
    paths: StatePaths,
    processes: Arc<RwLock<HashMap<String, Arc<LocalProcess>>>>,
}

impl Supervisor {
    pub fn new(paths: StatePaths) -> Self {
        Self {
            paths,
            processes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Spawn one server, wait for readiness, then begin supervising it.
    pub async fn start_server(&self, name: &str, spec: &ServerSpec) -> anyhow::Result<()> {
        let local = spec
            .local
            .clone()
            .with_context(|| format!("server '{name}' has no local config"))?;
        if self.processes.read().await.contains_key(name) {
            anyhow::bail!("server '{name}' already running");
        }

        let proc = LocalProcess::spawn(name, &spec.url, &local, 0, &self.paths).await?;
        if let Err(e) = proc.wait_ready().await {
            proc.stop().await;
            return Err(e);
        }

        self.processes
            .write()
            .await
            .insert(name.to_string(), Arc::new(proc));

        let supervisor = self.clone();
        let name = name.to_string();
        let spec = spec.clone();
        tokio::spawn(async move {
            supervisor.monitor(name, spec).await;
        });
        Ok(())
    }

    /// Start every configured `local` server; failures are logged, not fatal.
    pub async fn start_all(&self, servers: &HashMap<String, ServerSpec>) {
        let mut names: Vec<&String> = servers
            .iter()
            .filter(|(_, s)| s.local.is_some())
            .map(|(n, _)| n)
            .collect();
        names.sort();
        for name in names {
            info!(server = %name, "starting local server");
            if let Err(e) = self.start_server(name, &servers[name]).await {
                error!(server = %name, error = %e, "failed to start local server");
            }
        }
    }

    pub async fn stop_server(&self, name: &str) -> anyhow::Result<()> {
        let proc = self
            .processes
            .write()
            .await
            .remove(name)
            .with_context(|| format!("server '{name}' not running"))?;
        proc.stop().await;
        Ok(())
    }

    /// Stop everything and wait until every child has been reaped.
    pub async fn stop_all(&self) {
        let procs: Vec<Arc<LocalProcess>> = self.processes.write().await.drain().map(|(_, p)| p).collect();
        for proc in procs {
            proc.stop().await;
        }
    }

    pub async fn status(&self) -> Vec<ProcessInfo> {
        let mut infos: Vec<ProcessInfo> = self
            .processes
            .read()
            .await
            .values()
            .map(|p| p.info())
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub async fn is_running(&self, name: &str) -> bool {
        match self.processes.read().await.get(name) {
            Some(p) => p.is_running(),
            None => false,
        }
    }

    /// Per-server crash-restart loop: wait for exit, and unless the stop was
    /// deliberate (or the server was untracked meanwhile), respawn with an
    /// incremented restart counter. A failed respawn ends supervision.
    async fn monitor(&self, name: String, spec: ServerSpec) {
        loop {
            let proc = match self.processes.read().await.get(&name) {
                Some(p) => p.clone(),
                None => return,
            };

            let mut rx = proc.exited.clone();
            let _ = rx.wait_for(|exited| *exited).await;

            if proc.stopping.load(Ordering::SeqCst) {
                return;
            }

            warn!(server = %name, "local server crashed, restarting");
            tokio::time::sleep(RESTART_DELAY).await;

            if !self.processes.read().await.contains_key(&name) {
                return;
            }
            let Some(local) = spec.local.clone() else {
                return;
            };

            let restarted = async {
                let new_proc =
                    LocalProcess::spawn(&name, &spec.url, &local, proc.restarts + 1, &self.paths)
                        .await?;
                new_proc.wait_ready().await?;
                anyhow::Ok(new_proc)
            }
            .await;

            match restarted {
                Ok(new_proc) => {
                    let mut map = self.processes.write().await;
                    if !map.contains_key(&name) {
                        // Stopped while we were restarting.
                        drop(map);
                        new_proc.stop().await;
                        return;
                    }
                    map.insert(name.clone(), Arc::new(new_proc));
                }
                Err(e) => {
                    error!(server = %name, error = %e, "failed to restart local server");
                    self.processes.write().await.remove(&name);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn local_spec(script: &str) -> LocalSpec {
        LocalSpec {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
        }
    }

    /// A listener the readiness probe can hit; the child itself is inert.
    async fn probe_target() -> (tokio::net::TcpListener, String) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind probe target");
        let url = format!("http://{}/mcp", listener.local_addr().expect("addr"));
        (listener, url)
    }

    #[test]
    fn host_port_extraction() -> anyhow::Result<()> {
        assert_eq!(host_port("http://127.0.0.1:8931/mcp")?, "127.0.0.1:8931");
        assert_eq!(host_port("http://localhost:9000")?, "localhost:9000");
        assert_eq!(host_port("https://example.com/mcp")?, "example.com:443");
        Ok(())
    }

    #[tokio::test]
    async fn crash_restart_increments_counter() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let supervisor = Supervisor::new(StatePaths::new(dir.path()));
        let (_listener, url) = probe_target().await;

        let mut spec = ServerSpec::new(&url);
        spec.local = Some(local_spec("sleep 0.2; exit 1"));
        supervisor.start_server("crashy", &spec).await?;

        let status = supervisor.status().await;
        assert_eq!(status[0].restarts, 0);
        assert!(status[0].running);

        // Child exits at ~0.2s, the monitor restarts after a 1s delay.
        let mut restarted = false;
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let status = supervisor.status().await;
            if !status.is_empty() && status[0].restarts >= 1 {
                restarted = true;
                break;
            }
        }
        assert!(restarted, "supervisor never restarted the child");

        supervisor.stop_all().await;
        assert!(supervisor.status().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn stop_suppresses_restart() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let supervisor = Supervisor::new(StatePaths::new(dir.path()));
        let (_listener, url) = probe_target().await;

        let mut spec = ServerSpec::new(&url);
        spec.local = Some(local_spec("sleep 30"));
        supervisor.start_server("steady", &spec).await?;
        assert!(supervisor.is_running("steady").await);

        supervisor.stop_server("steady").await?;
        assert!(!supervisor.is_running("steady").await);

        // Give a would-be restart loop time to misbehave.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(supervisor.status().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn child_death_during_probe_fails_start() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let supervisor = Supervisor::new(StatePaths::new(dir.path()));

        // Nothing listens on this URL and the child exits immediately.
        let mut spec = ServerSpec::new("http://127.0.0.1:1/mcp");
        spec.local = Some(local_spec("exit 1"));
        let err = supervisor.start_server("doomed", &spec).await.unwrap_err();
        assert!(
            err.to_string().contains("exited before becoming ready"),
            "{err}"
        );
        assert!(supervisor.status().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn double_start_is_rejected() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let supervisor = Supervisor::new(StatePaths::new(dir.path()));
        let (_listener, url) = probe_target().await;

        let mut spec = ServerSpec::new(&url);
        spec.local = Some(local_spec("sleep 30"));
        supervisor.start_server("one", &spec).await?;
        let err = supervisor.start_server("one", &spec).await.unwrap_err();
        assert!(err.to_string().contains("already running"));
        supervisor.stop_all().await;
        Ok(())
    }

    #[tokio::test]
    async fn child_output_lands_in_log_file() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let paths = StatePaths::new(dir.path());

        let local = local_spec("echo hello-from-child; echo oops >&2");
        let proc = LocalProcess::spawn("talker", "http://127.0.0.1:1/", &local, 0, &paths).await?;
        let mut rx = proc.exited.clone();
        let _ = rx.wait_for(|exited| *exited).await;
        // Let the pump tasks drain the pipes.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let log = tokio::fs::read_to_string(paths.log_file("talker")).await?;
        assert!(log.contains("=== Starting talker at "), "{log}");
        assert!(log.contains("hello-from-child"), "{log}");
        assert!(log.contains("oops"), "{log}");
        Ok(())
    }
}
