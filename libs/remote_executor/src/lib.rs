//! Scoped SSH/SFTP sessions for driving a remote batch cluster.
//!
//! A [`RemoteSession`] lazily opens the SSH connection on the first command
//! and the SFTP channel on the first file operation; dropping or closing the
//! session releases both. Commands run serially on one session. The
//! HTCondor flavor prepends an environment loader when the deployment
//! targets the CMS CAF pool and selects the matching accounting group.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use camino::Utf8Path;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};

/// Default per-command timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(3600);
/// How many times a command is retried after an AFS stutter.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Transient AFS/home trouble on lxplus surfaces as the login scripts being
/// unreadable. Such a failure is worth a fresh connection and another try.
const AFS_STUTTER_MARKER: &str = ".bashrc: Permission denied";
const RETRY_PAUSE: Duration = Duration::from_secs(3);

const ENABLE_CMS_CAF_ENV: &str = "module load lxbatch/tzero";
const CMS_CAF_GROUP: &str = "group_u_CMS.CAF.PHYS";
const LXBATCH_PRIORITY_GROUP: &str = "group_u_CMS.u_zh.priority";

#[derive(Debug, Clone)]
pub struct SshCredentials {
    pub username: String,
    pub password: String,
}

/// Result of one remote command (or `; `-joined command sequence).
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: u32,
}

/// Session contract: command execution plus SFTP file operations.
///
/// File operations report failure instead of erroring; transport problems
/// are logged and yield `false`/`None` so callers can decide whether a
/// missing file matters.
#[async_trait]
pub trait RemoteSession: Send {
    async fn execute(&mut self, commands: &[&str]) -> anyhow::Result<CommandOutput>;
    async fn upload_file(&mut self, copy_from: &Utf8Path, copy_to: &str) -> bool;
    async fn upload_as_file(&mut self, content: &[u8], copy_to: &str) -> bool;
    async fn download_file(&mut self, copy_from: &str, copy_to: &Utf8Path) -> bool;
    async fn download_as_string(&mut self, copy_from: &str) -> Option<String>;
    async fn close(&mut self);
}

/// Hands out sessions scoped to a single controller action.
pub trait SessionProvider: Send + Sync {
    /// Plain session to the submission host.
    fn session(&self) -> Box<dyn RemoteSession>;
    /// Session prepared for HTCondor commands (pool environment applied).
    fn condor_session(&self) -> Box<dyn RemoteSession>;
    /// `AccountingGroup` to put in job descriptions submitted through this
    /// executor.
    fn accounting_group(&self) -> &'static str;
}

/// SSH executor factory for one remote host.
pub struct SshExecutor {
    host: String,
    credentials: SshCredentials,
    timeout: Duration,
    max_retries: u32,
    use_cms_caf: bool,
}

impl SshExecutor {
    pub fn new(host: impl Into<String>, credentials: SshCredentials) -> Self {
        SshExecutor {
            host: host.into(),
            credentials,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            use_cms_caf: false,
        }
    }

    /// Submit HTCondor work through the CMS CAF pool instead of the default
    /// lxbatch share.
    pub fn with_cms_caf(mut self, use_cms_caf: bool) -> Self {
        self.use_cms_caf = use_cms_caf;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn open(&self, env_prefix: Option<&'static str>) -> SshSession {
        SshSession {
            host: self.host.clone(),
            credentials: self.credentials.clone(),
            timeout: self.timeout,
            max_retries: self.max_retries,
            env_prefix,
            handle: None,
            sftp: None,
        }
    }
}

impl SessionProvider for SshExecutor {
    fn session(&self) -> Box<dyn RemoteSession> {
        Box::new(self.open(None))
    }

    fn condor_session(&self) -> Box<dyn RemoteSession> {
        let env = self.use_cms_caf.then_some(ENABLE_CMS_CAF_ENV);
        Box::new(self.open(env))
    }

    fn accounting_group(&self) -> &'static str {
        if self.use_cms_caf {
            CMS_CAF_GROUP
        } else {
            LXBATCH_PRIORITY_GROUP
        }
    }
}

/// Join a command sequence and prepend the pool environment loader, if any.
fn compose_command(commands: &[&str], env_prefix: Option<&str>) -> String {
    let joined = commands.join("; ");
    match env_prefix {
        Some(env) => format!("{env}; {joined}"),
        None => joined,
    }
}

fn is_afs_stutter(stderr: &str) -> bool {
    stderr.contains(AFS_STUTTER_MARKER)
}

struct Handler;

#[async_trait]
impl client::Handler for Handler {
    type Error = russh::Error;

    async fn check_server_key(
        self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<(Self, bool), Self::Error> {
        // Submission hosts rotate behind a DNS alias; host keys are not
        // pinned, the password never leaves the service account.
        Ok((self, true))
    }
}

pub struct SshSession {
    host: String,
    credentials: SshCredentials,
    timeout: Duration,
    max_retries: u32,
    env_prefix: Option<&'static str>,
    handle: Option<client::Handle<Handler>>,
    sftp: Option<SftpSession>,
}

impl SshSession {
    async fn connect(&mut self) -> anyhow::Result<()> {
        if self.handle.is_some() {
            self.teardown().await;
        }

        debug!("connecting to {}", self.host);
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let mut handle = client::connect(config, (self.host.as_str(), 22), Handler)
            .await
            .with_context(|| format!("connecting to {}", self.host))?;
        let authenticated = handle
            .authenticate_password(
                self.credentials.username.as_str(),
                self.credentials.password.as_str(),
            )
            .await
            .with_context(|| format!("authenticating to {}", self.host))?;
        if !authenticated {
            bail!(
                "authentication to {} as {} rejected",
                self.host,
                self.credentials.username
            );
        }

        self.handle = Some(handle);
        debug!("connected to {}", self.host);
        Ok(())
    }

    async fn sftp(&mut self) -> anyhow::Result<&SftpSession> {
        if self.sftp.is_none() {
            if self.handle.is_none() {
                self.connect().await?;
            }
            let handle = self.handle.as_ref().expect("connected above");
            let mut channel = handle
                .channel_open_session()
                .await
                .context("opening sftp channel")?;
            channel
                .request_subsystem(true, "sftp")
                .await
                .context("requesting sftp subsystem")?;
            let sftp = SftpSession::new(channel.into_stream())
                .await
                .context("initializing sftp session")?;
            self.sftp = Some(sftp);
        }
        Ok(self.sftp.as_ref().expect("initialized above"))
    }

    async fn run_once(&mut self, command: &str) -> anyhow::Result<CommandOutput> {
        if self.handle.is_none() {
            self.connect().await?;
        }
        let handle = self.handle.as_ref().expect("connected above");
        let mut channel = handle
            .channel_open_session()
            .await
            .context("opening exec channel")?;
        channel.exec(true, command).await.context("sending exec")?;

        let mut stdout: Vec<u8> = Vec::new();
        let mut stderr: Vec<u8> = Vec::new();
        let mut exit_code = 0u32;
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let msg = tokio::time::timeout_at(deadline, channel.wait())
                .await
                .map_err(|_| anyhow!("command timed out after {:?}", self.timeout))?;
            match msg {
                Some(ChannelMsg::Data { ref data }) => stdout.extend_from_slice(data),
                Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => {
                    stderr.extend_from_slice(data)
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = exit_status,
                Some(_) => {}
                None => break,
            }
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            exit_code,
        })
    }

    async fn teardown(&mut self) {
        if let Some(sftp) = self.sftp.take() {
            let _ = sftp.close().await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
        }
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn execute(&mut self, commands: &[&str]) -> anyhow::Result<CommandOutput> {
        let command = compose_command(commands, self.env_prefix);
        let started = std::time::Instant::now();
        let mut retries = 0;
        let output = loop {
            let output = match self.run_once(&command).await {
                Ok(output) => output,
                Err(e) => {
                    // Timeouts and transport errors invalidate the session.
                    self.teardown().await;
                    return Err(e);
                }
            };
            if is_afs_stutter(&output.stderr) && retries < self.max_retries {
                retries += 1;
                warn!("ssh execution hit an AFS stutter, retry number {retries}");
                self.teardown().await;
                tokio::time::sleep(RETRY_PAUSE).await;
                continue;
            }
            break output;
        };

        info!(
            "ssh command exit code {}, executed in {:.2}s:\n{}",
            output.exit_code,
            started.elapsed().as_secs_f64(),
            command.replace("; ", "\n"),
        );
        if !output.stderr.is_empty() {
            debug!("stderr: {}", output.stderr);
        }

        Ok(output)
    }

    async fn upload_file(&mut self, copy_from: &Utf8Path, copy_to: &str) -> bool {
        let content = match tokio::fs::read(copy_from).await {
            Ok(content) => content,
            Err(e) => {
                error!("error reading {copy_from} for upload: {e}");
                return false;
            }
        };
        self.upload_as_file(&content, copy_to).await
    }

    async fn upload_as_file(&mut self, content: &[u8], copy_to: &str) -> bool {
        debug!("uploading {} bytes to {copy_to}", content.len());
        let result = async {
            let sftp = self.sftp().await?;
            let mut remote = sftp.create(copy_to).await.context("creating remote file")?;
            remote.write_all(content).await.context("writing remote file")?;
            remote.shutdown().await.context("flushing remote file")?;
            anyhow::Ok(())
        }
        .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                error!("error uploading to {copy_to}: {e:#}");
                false
            }
        }
    }

    async fn download_file(&mut self, copy_from: &str, copy_to: &Utf8Path) -> bool {
        debug!("downloading {copy_from} to {copy_to}");
        let result = async {
            let sftp = self.sftp().await?;
            let mut remote = sftp.open(copy_from).await.context("opening remote file")?;
            let mut content = Vec::new();
            remote
                .read_to_end(&mut content)
                .await
                .context("reading remote file")?;
            tokio::fs::write(copy_to, content)
                .await
                .context("writing local file")?;
            anyhow::Ok(())
        }
        .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                error!("error downloading {copy_from} to {copy_to}: {e:#}");
                false
            }
        }
    }

    async fn download_as_string(&mut self, copy_from: &str) -> Option<String> {
        debug!("downloading {copy_from} as string");
        let result = async {
            let sftp = self.sftp().await?;
            let mut remote = sftp.open(copy_from).await.context("opening remote file")?;
            let mut content = String::new();
            remote
                .read_to_string(&mut content)
                .await
                .context("reading remote file")?;
            anyhow::Ok(content)
        }
        .await;
        match result {
            Ok(content) => Some(content),
            Err(e) => {
                error!("error downloading {copy_from}: {e:#}");
                None
            }
        }
    }

    async fn close(&mut self) {
        self.teardown().await;
    }
}
