//! Companion process that keeps the SSH tunnel up.
//!
//! Runs as `turnos-entrypoint monitor`. It owns the ssh process, checks the
//! database through the forwarded port, publishes readiness through the
//! sentinel file and restarts the tunnel with backoff when the check fails.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use sqlx::Connection;
use sqlx::mysql::MySqlConnection;
use url::Url;

use crate::services::readiness::{create_sentinel, port_accepting, remove_sentinel};
use crate::services::ssh::{BackoffConfig, ExponentialBackoff, SshTunnel, TunnelConfig};

/// How the monitor decides the database is reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbProbe {
    /// Connect with the application's credentials and run `SELECT 1`.
    Sql { uri: String },
    /// Only check that the forwarded port accepts connections.
    Tcp { addr: String, timeout: Duration },
}

impl DbProbe {
    pub async fn check(&self) -> Result<()> {
        match self {
            DbProbe::Sql { uri } => {
                let mut conn = MySqlConnection::connect(uri)
                    .await
                    .with_context(|| format!("failed to connect to {}", redact_uri(uri)))?;
                sqlx::query("SELECT 1")
                    .execute(&mut conn)
                    .await
                    .context("SELECT 1 failed")?;
                conn.close().await.context("failed to close connection")?;
                Ok(())
            }
            DbProbe::Tcp { addr, timeout } => {
                if port_accepting(addr, *timeout).await {
                    Ok(())
                } else {
                    Err(anyhow!("nothing is accepting connections on {}", addr))
                }
            }
        }
    }
}

/// Turn an SQLAlchemy style URI (`mysql+pymysql://...`) into one sqlx accepts.
pub fn normalize_database_uri(uri: &str) -> Result<String> {
    let mut url = Url::parse(uri).with_context(|| format!("invalid database URI {:?}", uri))?;

    let scheme = url.scheme().to_string();
    let base = scheme.split('+').next().unwrap_or(&scheme);
    let base = match base {
        "mariadb" => "mysql",
        other => other,
    };
    if base != "mysql" {
        return Err(anyhow!(
            "unsupported database scheme {:?}, expected mysql or mariadb",
            scheme
        ));
    }
    if base != scheme {
        url.set_scheme(base)
            .map_err(|()| anyhow!("cannot rewrite scheme of {}", redact_uri(uri)))?;
    }
    Ok(url.to_string())
}

/// The URI with its password replaced, safe for logs.
pub fn redact_uri(uri: &str) -> String {
    match Url::parse(uri) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<invalid uri>".to_string(),
    }
}

/// What the monitor does after a database check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorAction {
    /// Database reachable: publish readiness, check again later.
    MarkReady { next_check: Duration },
    /// Database unreachable: withdraw readiness, wait, restart the tunnel.
    Restart { cool_down: Duration },
}

/// Decision state of the monitor loop, kept apart from the I/O.
pub struct MonitorState {
    backoff: ExponentialBackoff,
    check_interval: Duration,
    max_cool_down: Duration,
}

impl MonitorState {
    pub fn new(check_interval: Duration, max_cool_down: Duration) -> Self {
        Self {
            backoff: ExponentialBackoff::new(BackoffConfig {
                initial_delay: Duration::from_secs(2).min(max_cool_down),
                max_delay: max_cool_down,
                multiplier: 2.0,
                max_attempts: None,
            }),
            check_interval,
            max_cool_down,
        }
    }

    pub fn record(&mut self, reachable: bool) -> MonitorAction {
        if reachable {
            self.backoff.reset();
            MonitorAction::MarkReady {
                next_check: self.check_interval,
            }
        } else {
            MonitorAction::Restart {
                cool_down: self.backoff.next_delay().unwrap_or(self.max_cool_down),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub sentinel_path: PathBuf,
    pub check_interval: Duration,
    pub max_cool_down: Duration,
    /// Time the tunnel gets to settle after a (re)start before it is checked.
    pub settle: Duration,
}

pub struct TunnelMonitor {
    tunnel_config: TunnelConfig,
    probe: DbProbe,
    settings: MonitorSettings,
}

impl TunnelMonitor {
    pub fn new(tunnel_config: TunnelConfig, probe: DbProbe, settings: MonitorSettings) -> Self {
        Self {
            tunnel_config,
            probe,
            settings,
        }
    }

    /// Keep the tunnel alive until the process is killed.
    pub async fn run(self) -> Result<()> {
        let mut state = MonitorState::new(self.settings.check_interval, self.settings.max_cool_down);
        let mut tunnel = self.restart_tunnel().await;

        loop {
            if let Some(ssh) = tunnel.as_mut() {
                if !ssh.is_alive() {
                    tracing::warn!("SSH tunnel on {} has exited", ssh.local_addr());
                }
            }

            let reachable = match self.probe.check().await {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!("Database connection check failed: {:#}", e);
                    false
                }
            };

            match state.record(reachable) {
                MonitorAction::MarkReady { next_check } => {
                    create_sentinel(&self.settings.sentinel_path).await?;
                    smol::Timer::after(next_check).await;
                }
                MonitorAction::Restart { cool_down } => {
                    if let Some(old) = tunnel.take() {
                        old.shutdown().await;
                    }
                    remove_sentinel(&self.settings.sentinel_path).await?;
                    tracing::info!("Retrying in {} seconds", cool_down.as_secs());
                    smol::Timer::after(cool_down).await;
                    tunnel = self.restart_tunnel().await;
                }
            }
        }
    }

    async fn restart_tunnel(&self) -> Option<SshTunnel> {
        match SshTunnel::start(self.tunnel_config.clone()).await {
            Ok(tunnel) => {
                smol::Timer::after(self.settings.settle).await;
                Some(tunnel)
            }
            Err(e) => {
                // The next failed check brings us back here after a cool down
                tracing::error!("Failed to start SSH tunnel: {}", e);
                None
            }
        }
    }
}
