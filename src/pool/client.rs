//! russh-backed SSH transport
//!
//! Server host keys are accepted without verification, the equivalent of
//! `ssh -o StrictHostKeyChecking=no`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::connector::{AuthMethod, Connector, DialError};
use super::PoolKey;
use crate::context::{ContextError, ExecContext};
use crate::runner::output::BoundedBuffer;

/// Budget for the liveness probe's channel round trip.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// How a remote command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Exited(i32),
    Signaled(String),
    Cancelled(ContextError),
    /// The channel closed without reporting an exit status.
    Closed,
}

#[derive(Debug)]
pub struct RemoteOutput {
    pub stdout: BoundedBuffer,
    pub stderr: BoundedBuffer,
    pub status: RemoteStatus,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.status == RemoteStatus::Exited(0)
    }
}

enum Step {
    Msg(Option<ChannelMsg>),
    Cancelled(ContextError),
}

/// An authenticated SSH transport. Sessions are opened per command; only
/// the transport is shared.
pub struct SshConnection {
    handle: client::Handle<ClientHandler>,
    addr: String,
}

impl SshConnection {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Run `command` on a fresh session channel, stopping early when `ctx`
    /// finishes. Cancellation closes the channel; the remote process is not
    /// signalled.
    pub async fn exec(
        &self,
        ctx: &ExecContext,
        command: &str,
        limit: usize,
    ) -> Result<RemoteOutput, russh::Error> {
        let mut stdout = BoundedBuffer::new(limit);
        let mut stderr = BoundedBuffer::new(limit);
        let mut status = RemoteStatus::Closed;

        let opened = tokio::select! {
            opened = self.handle.channel_open_session() => opened,
            reason = ctx.done() => {
                return Ok(RemoteOutput {
                    stdout,
                    stderr,
                    status: RemoteStatus::Cancelled(reason),
                });
            }
        };
        let mut channel = opened?;
        channel.exec(true, command).await?;

        loop {
            let step = tokio::select! {
                msg = channel.wait() => Step::Msg(msg),
                reason = ctx.done() => Step::Cancelled(reason),
            };
            match step {
                Step::Cancelled(reason) => {
                    debug!(
                        addr = %self.addr,
                        reason = %reason,
                        "closing channel of cancelled command"
                    );
                    let _ = channel.close().await;
                    status = RemoteStatus::Cancelled(reason);
                    break;
                }
                Step::Msg(None) => break,
                Step::Msg(Some(msg)) => match msg {
                    ChannelMsg::Data { ref data } => {
                        stdout.push(data);
                    }
                    ChannelMsg::ExtendedData { ref data, .. } => {
                        stderr.push(data);
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        status = RemoteStatus::Exited(exit_status as i32);
                    }
                    ChannelMsg::ExitSignal { signal_name, .. } => {
                        status = RemoteStatus::Signaled(format!("{:?}", signal_name));
                    }
                    _ => {}
                },
            }
        }

        Ok(RemoteOutput {
            stdout,
            stderr,
            status,
        })
    }

    /// Write `local` to `remote` over SFTP.
    pub async fn upload(&self, local: &Path, remote: &str) -> Result<(), String> {
        let bytes = tokio::fs::read(local)
            .await
            .map_err(|e| format!("read {}: {}", local.display(), e))?;

        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| e.to_string())?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| e.to_string())?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| format!("sftp session: {}", e))?;

        let mut file = sftp
            .create(remote.to_string())
            .await
            .map_err(|e| format!("create {}: {}", remote, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| format!("write {}: {}", remote, e))?;
        file.shutdown()
            .await
            .map_err(|e| format!("close {}: {}", remote, e))?;
        let _ = sftp.close().await;
        Ok(())
    }

    /// Transport still open and able to open a channel.
    pub async fn probe(&self) -> bool {
        if self.handle.is_closed() {
            return false;
        }
        match tokio::time::timeout(PROBE_TIMEOUT, self.handle.channel_open_session()).await {
            Ok(Ok(channel)) => {
                let _ = channel.close().await;
                true
            }
            _ => false,
        }
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(addr = %self.addr, error = %e, "disconnect failed");
        }
    }
}

/// Dials real SSH servers with russh.
#[derive(Clone)]
pub struct RusshConnector {
    config: Arc<client::Config>,
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl RusshConnector {
    pub fn new() -> Self {
        Self {
            config: Arc::new(client::Config::default()),
        }
    }

    async fn authenticate(
        handle: &mut client::Handle<ClientHandler>,
        user: &str,
        method: &AuthMethod,
    ) -> Result<bool, DialError> {
        let accepted = match method {
            AuthMethod::PublicKey(path) => {
                let key_pair = russh_keys::load_secret_key(path, None).map_err(|e| {
                    DialError::Other(format!("failed to load key {}: {}", path.display(), e))
                })?;
                handle.authenticate_publickey(user, Arc::new(key_pair)).await
            }
            AuthMethod::Password(password) => {
                handle.authenticate_password(user, password.as_str()).await
            }
        };
        accepted.map_err(|e| DialError::classify(&e))
    }
}

#[async_trait]
impl Connector for RusshConnector {
    type Connection = SshConnection;

    async fn connect(
        &self,
        key: &PoolKey,
        auth: &[AuthMethod],
        timeout: Duration,
    ) -> Result<SshConnection, DialError> {
        let addr = key.addr();
        let connecting = client::connect(
            self.config.clone(),
            (key.host.as_str(), key.port),
            ClientHandler,
        );
        let mut handle = match tokio::time::timeout(timeout, connecting).await {
            Err(_) => {
                return Err(DialError::Network(format!(
                    "dial {} timed out after {:?}",
                    addr, timeout
                )))
            }
            Ok(Err(e)) => return Err(DialError::classify(&e)),
            Ok(Ok(handle)) => handle,
        };

        for method in auth {
            if Self::authenticate(&mut handle, &key.user, method).await? {
                debug!(%key, method = ?method, "ssh authentication accepted");
                return Ok(SshConnection { handle, addr });
            }
        }

        let _ = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
        Err(DialError::Auth(format!(
            "all authentication methods rejected for {}",
            key
        )))
    }

    async fn is_alive(&self, conn: &SshConnection) -> bool {
        conn.probe().await
    }

    async fn close(&self, conn: &SshConnection) {
        conn.disconnect().await;
    }
}
