//! Invocation of the Cassandra `nodetool` administrative CLI.

mod status;

pub use self::status::{parse_gossip_active, Datacenter, Node, Status};

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info, warn};
use tempfile::NamedTempFile;
use tokio::process::Command;

use crate::config::BootstrapConfig;
use crate::errors::*;

/// Administrative access to a Cassandra node.
#[async_trait]
pub trait AdminClient: Send + Sync {
    /// Run a nodetool subcommand, returning its combined output.
    async fn run_command(&self, command: &str) -> Result<String>;

    async fn status(&self) -> Result<Status> {
        let output = self.run_command("status").await?;
        Ok(Status::parse(&output))
    }

    async fn has_active_gossip(&self) -> Result<bool> {
        let output = self.run_command("info").await?;
        parse_gossip_active(&output)
    }
}

/// Builds admin clients for the local node or for another node of the ring.
pub trait AdminConnector: Send + Sync {
    fn local(&self) -> Box<dyn AdminClient>;
    fn remote(&self, host: &str) -> Result<Box<dyn AdminClient>>;
}

/// Credentials handed to nodetool through `--password-file`.
#[derive(Debug)]
struct Credentials {
    username: String,
    // Removed from disk once the client is dropped.
    password_file: NamedTempFile,
}

impl Credentials {
    /// Read credentials if and only if both files exist.
    fn load(username_file: &Path, password_file: &Path) -> Result<Option<Self>> {
        if !username_file.is_file() || !password_file.is_file() {
            info!("no nodetool credentials found, connecting unauthenticated");
            return Ok(None);
        }
        let username = std::fs::read_to_string(username_file)
            .chain_err(|| format!("failed to read user file {}", username_file.display()))?
            .trim()
            .to_string();
        let password = std::fs::read_to_string(password_file)
            .chain_err(|| format!("failed to read password file {}", password_file.display()))?
            .trim()
            .to_string();

        let mut file = NamedTempFile::new().chain_err(|| "failed to create temp password file")?;
        write!(file, "{} {}", username, password).chain_err(|| "failed to write temp password file")?;
        file.flush()?;
        info!("using user '{}' and password file '{}'", username, file.path().display());
        Ok(Some(Credentials {
            username,
            password_file: file,
        }))
    }
}

/// `nodetool` against either the local node or a remote one.
#[derive(Debug)]
pub struct Nodetool {
    executable: String,
    host: Option<String>,
    port: Option<u16>,
    credentials: Option<Credentials>,
    ssl: bool,
}

impl Nodetool {
    pub fn local(executable: impl Into<String>, ssl: bool) -> Self {
        Nodetool {
            executable: executable.into(),
            host: None,
            port: None,
            credentials: None,
            ssl,
        }
    }

    pub fn remote(
        executable: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        ssl: bool,
        username_file: &Path,
        password_file: &Path,
    ) -> Result<Self> {
        Ok(Nodetool {
            executable: executable.into(),
            host: Some(host.into()),
            port: Some(port),
            credentials: Credentials::load(username_file, password_file)?,
            ssl,
        })
    }

    fn args(&self, command: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(host) = &self.host {
            args.push("--host".to_string());
            args.push(host.clone());
        }
        if let Some(port) = self.port {
            args.push("--port".to_string());
            args.push(port.to_string());
        }
        if let Some(creds) = &self.credentials {
            args.push("--username".to_string());
            args.push(creds.username.clone());
            args.push("--password-file".to_string());
            args.push(creds.password_file.path().display().to_string());
        }
        if self.ssl {
            args.push("--ssl".to_string());
        }
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl AdminClient for Nodetool {
    async fn run_command(&self, command: &str) -> Result<String> {
        let args = self.args(command);
        debug!("running {} {:?}", self.executable, args);
        let output = Command::new(&self.executable)
            .args(&args)
            .output()
            .await
            .chain_err(|| ErrorKind::NodetoolFailed(command.to_string(), format!("could not run {}", self.executable)))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        debug!("{} output:\n{}", command, combined);
        if !output.status.success() {
            bail!(ErrorKind::NodetoolFailed(command.to_string(), combined));
        }
        Ok(combined)
    }
}

/// The production connector, configured from the bootstrap environment.
pub struct NodetoolConnector {
    executable: String,
    jmx_port: u16,
    ssl: bool,
    username_file: PathBuf,
    password_file: PathBuf,
}

impl NodetoolConnector {
    pub fn new(config: &BootstrapConfig) -> Self {
        NodetoolConnector {
            executable: config.nodetool_path.clone(),
            jmx_port: config.jmx_port,
            ssl: config.use_ssl,
            username_file: config.auth_username_file.clone(),
            password_file: config.auth_password_file.clone(),
        }
    }
}

impl AdminConnector for NodetoolConnector {
    fn local(&self) -> Box<dyn AdminClient> {
        Box::new(Nodetool::local(self.executable.clone(), self.ssl))
    }

    fn remote(&self, host: &str) -> Result<Box<dyn AdminClient>> {
        let nodetool = Nodetool::remote(
            self.executable.clone(),
            host,
            self.jmx_port,
            self.ssl,
            &self.username_file,
            &self.password_file,
        )
        .map_err(|err| {
            warn!("failed to build remote nodetool for {}: {}", host, err);
            err
        })?;
        Ok(Box::new(nodetool))
    }
}
