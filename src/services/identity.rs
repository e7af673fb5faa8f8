//! Outbound identity rotation through a local Tor process.
//!
//! Each rotation starts `tor` against one state directory, waits for the
//! circuit to bootstrap, and hands back an HTTP client proxied through its
//! SOCKS port. The process lives exactly as long as the [`Identity`].

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use reqwest::{Client, Proxy};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Something that can produce a fresh outbound identity for a state directory.
pub trait IdentityProvider {
    fn rotate(&self, data_dir: &Path) -> impl Future<Output = Result<Identity, IdentityError>> + Send;
}

/// A live outbound identity: an HTTP client and, when proxied, the process
/// backing it. Dropping the identity kills the process.
#[derive(Debug)]
pub struct Identity {
    client: Client,
    data_dir: PathBuf,
    process: Option<Child>,
}

impl Identity {
    /// Identity without a backing process, connecting directly.
    pub fn direct(client: Client, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            data_dir: data_dir.into(),
            process: None,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Stop the backing process and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(mut child) = self.process.take() {
            if let Err(e) = child.kill().await {
                warn!(data_dir = %self.data_dir.display(), error = %e, "Failed to stop Tor");
            } else {
                info!(data_dir = %self.data_dir.display(), "Tor stopped");
            }
        }
    }
}

/// Launches the `tor` executable for each rotation.
#[derive(Debug, Clone)]
pub struct TorLauncher {
    binary: PathBuf,
    bootstrap_timeout: Duration,
}

impl TorLauncher {
    pub fn new(binary: impl Into<PathBuf>, bootstrap_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            bootstrap_timeout,
        }
    }

    async fn start(&self, data_dir: &Path) -> Result<Identity, IdentityError> {
        let socks_port = free_local_port()?;

        let mut child = Command::new(&self.binary)
            .arg("--DataDirectory")
            .arg(data_dir)
            .arg("--SocksPort")
            .arg(socks_port.to_string())
            .args(["--Log", "notice stdout"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| IdentityError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(IdentityError::NoOutput)?;
        let mut lines = BufReader::new(stdout).lines();

        let bootstrap = wait_for_bootstrap(&mut lines, socks_port);
        match tokio::time::timeout(self.bootstrap_timeout, bootstrap).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(IdentityError::BootstrapTimeout(self.bootstrap_timeout)),
        }

        // Keep reading so tor never blocks on a full pipe.
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "tor", "{line}");
            }
        });

        let proxy = Proxy::all(format!("socks5h://127.0.0.1:{socks_port}"))
            .map_err(IdentityError::Client)?;
        let client = Client::builder()
            .proxy(proxy)
            .build()
            .map_err(IdentityError::Client)?;

        Ok(Identity {
            client,
            data_dir: data_dir.to_path_buf(),
            process: Some(child),
        })
    }
}

impl IdentityProvider for TorLauncher {
    fn rotate(&self, data_dir: &Path) -> impl Future<Output = Result<Identity, IdentityError>> + Send {
        let data_dir = data_dir.to_path_buf();
        async move {
            info!(data_dir = %data_dir.display(), "Starting Tor");
            let identity = self.start(&data_dir).await?;
            info!(data_dir = %data_dir.display(), "Tor circuit ready");
            Ok(identity)
        }
    }
}

/// Read tor's log until the circuit is ready or the process gives up.
async fn wait_for_bootstrap<R>(lines: &mut Lines<R>, socks_port: u16) -> Result<(), IdentityError>
where
    R: AsyncBufRead + Unpin,
{
    let mut bind_failed = false;
    while let Some(line) = lines.next_line().await.map_err(IdentityError::Output)? {
        if line.contains("Could not bind to") {
            warn!(socks_port, "{line}");
            bind_failed = true;
        } else if let Some(percent) = bootstrap_progress(&line) {
            debug!(percent, "Tor bootstrapping");
            if percent >= 100 {
                return Ok(());
            }
        }
    }
    if bind_failed {
        return Err(IdentityError::SocksBind(socks_port));
    }
    Err(IdentityError::Exited)
}

/// Extract `N` from a tor `Bootstrapped N%` notice.
pub fn bootstrap_progress(line: &str) -> Option<u8> {
    let rest = &line[line.find("Bootstrapped ")? + "Bootstrapped ".len()..];
    rest[..rest.find('%')?].trim().parse().ok()
}

fn free_local_port() -> Result<u16, IdentityError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").map_err(IdentityError::Port)?;
    let port = listener.local_addr().map_err(IdentityError::Port)?.port();
    Ok(port)
}

/// Directories in `root` whose name starts with `prefix`, sorted.
pub async fn discover_data_dirs(root: &Path, prefix: &str) -> Result<Vec<PathBuf>, IdentityError> {
    let root = tokio::fs::canonicalize(root)
        .await
        .map_err(IdentityError::DataDirs)?;
    let mut entries = tokio::fs::read_dir(&root)
        .await
        .map_err(IdentityError::DataDirs)?;

    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(IdentityError::DataDirs)? {
        let is_dir = entry
            .file_type()
            .await
            .map_err(IdentityError::DataDirs)?
            .is_dir();
        if is_dir && entry.file_name().to_string_lossy().starts_with(prefix) {
            dirs.push(entry.path());
        }
    }

    dirs.sort();
    Ok(dirs)
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Could not start {}: {source}", binary.display())]
    Spawn {
        binary: PathBuf,
        source: std::io::Error,
    },

    #[error("Tor process has no stdout")]
    NoOutput,

    #[error("Failed to read Tor output: {0}")]
    Output(#[source] std::io::Error),

    #[error("Tor exited before the circuit was ready")]
    Exited,

    #[error("Tor could not bind SOCKS port {0}, another process took it")]
    SocksBind(u16),

    #[error("Tor did not bootstrap within {0:?}")]
    BootstrapTimeout(Duration),

    #[error("No free local port for the SOCKS proxy: {0}")]
    Port(#[source] std::io::Error),

    #[error("Failed to build proxied HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Failed to list Tor data directories: {0}")]
    DataDirs(#[source] std::io::Error),
}
