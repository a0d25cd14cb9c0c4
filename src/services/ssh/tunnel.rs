//! SSH tunnel implementation using the system ssh binary.
//!
//! The tunnel is a plain `ssh -N -L` child process. Using the system client
//! keeps key handling, keep-alives and forward failure detection in OpenSSH.

use std::time::Duration;

use smol::io::AsyncWriteExt;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use super::reconnect::{BackoffConfig, ExponentialBackoff, is_retriable_error};
use super::types::TunnelConfig;
use crate::error::StartupError;
use crate::services::process::{ManagedProcess, ProcessRole, ProcessSpec};

/// How long ssh gets to fail on its own before we consider it started.
const EARLY_EXIT_WINDOW: Duration = Duration::from_millis(500);

/// Log level for a line of ssh stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Debug,
    Info,
    Error,
}

pub fn ssh_stderr_severity(line: &str) -> Severity {
    if line.contains("Permission denied")
        || line.contains("Authentication failed")
        || line.contains("Connection refused")
        || line.contains("Connection timed out")
        || line.contains("Could not resolve hostname")
        || line.contains("forwarding failed")
    {
        Severity::Error
    } else if line.starts_with("Warning: Permanently added") {
        Severity::Debug
    } else {
        Severity::Info
    }
}

/// Materialize the private key with owner-only permissions.
///
/// ssh refuses keys readable by group or others, so the file is created with
/// mode 0600 and the mode is re-applied in case the file already existed.
pub async fn write_private_key(config: &TunnelConfig) -> Result<(), StartupError> {
    let path = config.key_path.as_path();
    let key_error = |source| StartupError::KeyMaterial {
        path: path.to_path_buf(),
        source,
    };

    if config.private_key.trim().is_empty() {
        if async_fs::metadata(path).await.is_ok() {
            tracing::warn!(
                "SSH_PRIVATE_KEY is empty, using existing key file {}",
                path.display()
            );
            return Ok(());
        }
        return Err(StartupError::MissingPrivateKey(path.to_path_buf()));
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        async_fs::create_dir_all(parent).await.map_err(key_error)?;
    }

    let mut options = async_fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use async_fs::unix::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).await.map_err(key_error)?;
    file.write_all(config.private_key.as_bytes())
        .await
        .map_err(key_error)?;
    if !config.private_key.ends_with('\n') {
        file.write_all(b"\n").await.map_err(key_error)?;
    }
    file.flush().await.map_err(key_error)?;
    drop(file);

    #[cfg(unix)]
    async_fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(key_error)?;

    tracing::debug!("SSH private key written to {}", path.display());
    Ok(())
}

/// The ssh invocation for a background, non-interactive port forward.
pub fn ssh_command(config: &TunnelConfig) -> ProcessSpec {
    ProcessSpec::new(ProcessRole::Tunnel, &config.ssh_program)
        // Keep connection alive but don't execute a remote command
        .arg("-N")
        // Ephemeral containers have no known_hosts to verify against
        .args(["-o", "StrictHostKeyChecking=no"])
        .args(["-o", "UserKnownHostsFile=/dev/null"])
        // Never prompt; there is no terminal
        .args(["-o", "BatchMode=yes"])
        .args(["-o", "ExitOnForwardFailure=yes"])
        .args(["-o", "ServerAliveInterval=15"])
        .args(["-o", "ServerAliveCountMax=3"])
        .arg("-L")
        .arg(config.forward_spec())
        .arg("-p")
        .arg(config.ssh_port.to_string())
        .arg("-i")
        .arg(config.key_path.display().to_string())
        .arg(config.ssh_url())
}

/// An active SSH tunnel backed by a system ssh process.
pub struct SshTunnel {
    config: TunnelConfig,
    process: ManagedProcess,
}

impl SshTunnel {
    /// Write the key, spawn ssh, and fail if it exits straight away.
    ///
    /// Returning `Ok` does not mean the forwarded port accepts connections yet;
    /// readiness is decided by the caller's gate.
    pub async fn start(config: TunnelConfig) -> Result<Self, StartupError> {
        write_private_key(&config).await?;

        let spec = ssh_command(&config);
        tracing::info!(
            "Starting SSH tunnel: ssh -L {} -N {}",
            config.forward_spec(),
            config.ssh_url()
        );

        let mut process = ManagedProcess::start(&spec)?;

        smol::Timer::after(EARLY_EXIT_WINDOW).await;

        if let Some(status) = process.exit_status() {
            // Give the stderr reader a moment to catch the last lines
            smol::Timer::after(Duration::from_millis(50)).await;
            let stderr = process.recent_stderr().join("\n");
            return Err(StartupError::Tunnel(format!(
                "ssh exited immediately with {}. Check credentials and connectivity to {}:{}: {}",
                status, config.ssh_host, config.ssh_port, stderr
            )));
        }

        Ok(Self { config, process })
    }

    /// Start the tunnel, retrying transient failures with exponential backoff.
    pub async fn start_with_retry(
        config: TunnelConfig,
        backoff: BackoffConfig,
    ) -> Result<Self, StartupError> {
        let mut backoff = ExponentialBackoff::new(backoff);
        let max_attempts = backoff.max_attempts();

        loop {
            let error = match Self::start(config.clone()).await {
                Ok(tunnel) => {
                    if backoff.attempt() > 0 {
                        tracing::info!("SSH tunnel started after {} retries", backoff.attempt());
                    }
                    return Ok(tunnel);
                }
                Err(e) => e,
            };

            let retriable = match &error {
                StartupError::Tunnel(message) => is_retriable_error(message),
                _ => false,
            };
            if !retriable {
                tracing::warn!("SSH tunnel failed with non-retriable error: {}", error);
                return Err(error);
            }

            match backoff.next_delay() {
                Some(delay) => {
                    tracing::info!(
                        "SSH tunnel attempt {} failed, retrying in {:?}: {}",
                        backoff.attempt(),
                        delay,
                        error
                    );
                    smol::Timer::after(delay).await;
                }
                None => {
                    tracing::error!(
                        "SSH tunnel failed after {} attempts: {}",
                        max_attempts,
                        error
                    );
                    return Err(error);
                }
            }
        }
    }

    /// Get the local address to connect to (e.g., "127.0.0.1:3306").
    pub fn local_addr(&self) -> String {
        self.config.local_addr()
    }

    /// Check if the tunnel process is still running.
    pub fn is_alive(&mut self) -> bool {
        self.process.is_alive()
    }

    /// Hand the ssh process over to a supervisor.
    pub fn into_process(self) -> ManagedProcess {
        self.process
    }

    pub async fn shutdown(mut self) {
        tracing::debug!("Shutting down SSH tunnel to {}", self.config.ssh_url());
        if let Err(e) = self.process.terminate(Duration::from_secs(2)).await {
            tracing::warn!("SSH tunnel did not shut down cleanly: {}", e);
        }
    }
}
