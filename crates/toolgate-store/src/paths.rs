use std::path::{Path, PathBuf};

use anyhow::Context as _;
use directories::ProjectDirs;

/// Layout of the per-user state directory.
///
/// All paths are derived from one base directory so tests can redirect the
/// whole tree with a tempdir (the CLI exposes `--state-dir` /
/// `TOOLGATE_STATE_DIR` for the same reason).
#[derive(Debug, Clone)]
pub struct StatePaths {
    base: PathBuf,
}

impl StatePaths {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Resolve the state directory: an explicit override wins, otherwise the
    /// platform-local data dir.
    pub fn resolve(cli: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(p) = cli {
            return Ok(Self::new(p));
        }
        let proj =
            ProjectDirs::from("dev", "toolgate", "toolgate").context("resolve platform data dir")?;
        Ok(Self::new(proj.data_local_dir()))
    }

    /// Create the base directory (user-private) if it does not exist yet.
    pub fn ensure_base(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.base)
            .with_context(|| format!("create state dir {}", self.base.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            std::fs::set_permissions(&self.base, std::fs::Permissions::from_mode(0o700))
                .with_context(|| format!("chmod 700 {}", self.base.display()))?;
        }
        Ok(())
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn servers_file(&self) -> PathBuf {
        self.base.join("servers.json")
    }

    pub fn tokens_file(&self) -> PathBuf {
        self.base.join("tokens.json")
    }

    pub fn registrations_file(&self) -> PathBuf {
        self.base.join("registrations.json")
    }

    pub fn sessions_file(&self) -> PathBuf {
        self.base.join("sessions.json")
    }

    pub fn socket_file(&self) -> PathBuf {
        self.base.join("daemon.sock")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.base.join("daemon.pid")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    pub fn log_file(&self, server: &str) -> PathBuf {
        self.logs_dir().join(format!("{server}.log"))
    }
}
