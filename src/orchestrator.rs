//! Container startup sequence.
//!
//! Tunnel, readiness gate, application, health gate, proxy, liveness check,
//! then a foreground wait on the application. Each step only starts once the
//! previous gate has been passed.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_channel::{Receiver, Sender};

use crate::error::{StartupError, exit_code_of};
use crate::services::health_checker::{HealthChecker, HealthTarget};
use crate::services::process::{ManagedProcess, ProcessRole, ProcessSpec, process_running};
use crate::services::readiness::{
    PollSchedule, port_accepting, remove_sentinel, sentinel_present, wait_until,
};
use crate::services::ssh::{BackoffConfig, SshTunnel, TunnelConfig};

/// Startup state machine. Every transition is logged and broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupPhase {
    Init,
    TunnelWait,
    AppStarting,
    AppReady,
    ProxyStarting,
    ProxyChecked,
    Running,
    /// The application exited after startup completed.
    Exited { code: i32 },
    Failed { error: String },
}

impl StartupPhase {
    pub fn name(&self) -> &'static str {
        match self {
            StartupPhase::Init => "INIT",
            StartupPhase::TunnelWait => "TUNNEL_WAIT",
            StartupPhase::AppStarting => "APP_STARTING",
            StartupPhase::AppReady => "APP_READY",
            StartupPhase::ProxyStarting => "PROXY_STARTING",
            StartupPhase::ProxyChecked => "PROXY_CHECKED",
            StartupPhase::Running => "RUNNING",
            StartupPhase::Exited { .. } => "EXITED",
            StartupPhase::Failed { .. } => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StartupPhase::Exited { .. } | StartupPhase::Failed { .. })
    }
}

impl fmt::Display for StartupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How the orchestrator decides the tunnel is usable.
#[derive(Debug, Clone, PartialEq)]
pub enum TunnelReadiness {
    /// A companion monitor owns ssh and creates `path` once the database answers.
    Sentinel {
        path: PathBuf,
        monitor: ProcessSpec,
        schedule: PollSchedule,
    },
    /// Start ssh here and wait for the forwarded port to accept connections.
    TcpProbe {
        schedule: PollSchedule,
        connect_timeout: Duration,
        retry: BackoffConfig,
    },
    /// Start ssh here and assume it is up after `delay`.
    FixedDelay { delay: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TunnelPlan {
    pub config: TunnelConfig,
    pub readiness: TunnelReadiness,
}

/// Everything the orchestrator needs, resolved up front.
#[derive(Debug, Clone, PartialEq)]
pub struct StartupPlan {
    /// `None` when no SSH host is configured.
    pub tunnel: Option<TunnelPlan>,
    pub app: ProcessSpec,
    pub health: HealthTarget,
    pub health_schedule: PollSchedule,
    pub proxy: ProcessSpec,
    /// Process name the liveness watchdog looks for.
    pub proxy_process_name: String,
    pub proxy_grace: Duration,
    /// SIGTERM to SIGKILL escalation when stopping children.
    pub shutdown_grace: Duration,
}

struct PhaseReporter {
    current: StartupPhase,
    tx: Sender<StartupPhase>,
}

impl PhaseReporter {
    fn transition(&mut self, next: StartupPhase) {
        tracing::debug!("{} -> {}", self.current, next);
        self.current = next.clone();
        let _ = self.tx.try_send(next);
    }
}

pub struct Orchestrator {
    plan: StartupPlan,
    reporter: PhaseReporter,
    phase_rx: Receiver<StartupPhase>,
    tunnel: Option<ManagedProcess>,
    app: Option<ManagedProcess>,
    proxy: Option<ManagedProcess>,
}

impl Orchestrator {
    pub fn new(plan: StartupPlan) -> Self {
        let (tx, phase_rx) = async_channel::unbounded();
        Self {
            plan,
            reporter: PhaseReporter {
                current: StartupPhase::Init,
                tx,
            },
            phase_rx,
            tunnel: None,
            app: None,
            proxy: None,
        }
    }

    /// Receive every phase transition, starting with the next one.
    pub fn subscribe(&self) -> Receiver<StartupPhase> {
        self.phase_rx.clone()
    }

    pub fn phase(&self) -> &StartupPhase {
        &self.reporter.current
    }

    /// Run the startup sequence and block until the application exits.
    ///
    /// Returns the application's exit code. On failure every process started
    /// so far is stopped before the error is returned.
    pub async fn run(mut self) -> Result<i32, StartupError> {
        match self.run_phases().await {
            Ok(code) => Ok(code),
            Err(error) => {
                tracing::error!("Startup failed: {}", error);
                self.reporter.transition(StartupPhase::Failed {
                    error: error.to_string(),
                });
                self.shutdown().await;
                Err(error)
            }
        }
    }

    async fn run_phases(&mut self) -> Result<i32, StartupError> {
        self.reporter.transition(StartupPhase::Init);

        match self.plan.tunnel.take() {
            Some(tunnel) => {
                self.reporter.transition(StartupPhase::TunnelWait);
                self.establish_tunnel(tunnel).await?;
            }
            None => tracing::info!("SSH_HOST is not set, skipping SSH tunnel setup"),
        }

        self.reporter.transition(StartupPhase::AppStarting);
        self.start_app().await?;
        self.reporter.transition(StartupPhase::AppReady);

        self.reporter.transition(StartupPhase::ProxyStarting);
        self.start_proxy().await?;
        self.reporter.transition(StartupPhase::ProxyChecked);

        self.reporter.transition(StartupPhase::Running);
        self.wait_for_app().await
    }

    async fn establish_tunnel(&mut self, plan: TunnelPlan) -> Result<(), StartupError> {
        let TunnelPlan { config, readiness } = plan;
        let phase = StartupPhase::TunnelWait.name();

        match readiness {
            TunnelReadiness::Sentinel {
                path,
                monitor,
                schedule,
            } => {
                // A sentinel left over from a previous run says nothing about this one
                remove_sentinel(&path).await?;

                tracing::info!("Starting tunnel monitor for {}", config.ssh_url());
                let monitor = self.tunnel.insert(ManagedProcess::start(&monitor)?);

                tracing::info!("Waiting for SSH tunnel (signal file {})", path.display());
                let path = &path;
                gate_on_process(
                    wait_until(phase, &schedule, move || async move {
                        let ready = sentinel_present(path).await;
                        if !ready {
                            tracing::info!("Waiting for SSH tunnel to be ready...");
                        }
                        ready
                    }),
                    monitor,
                )
                .await?;
            }
            TunnelReadiness::TcpProbe {
                schedule,
                connect_timeout,
                retry,
            } => {
                let tunnel = SshTunnel::start_with_retry(config, retry).await?;
                let addr = tunnel.local_addr();
                let ssh = self.tunnel.insert(tunnel.into_process());

                tracing::info!("Waiting for SSH tunnel on {}", addr);
                let addr = addr.as_str();
                gate_on_process(
                    wait_until(phase, &schedule, move || {
                        port_accepting(addr, connect_timeout)
                    }),
                    ssh,
                )
                .await?;
            }
            TunnelReadiness::FixedDelay { delay } => {
                let tunnel = SshTunnel::start(config).await?;
                self.tunnel = Some(tunnel.into_process());
                smol::Timer::after(delay).await;
                tracing::warn!(
                    "Assuming SSH tunnel is ready after {:?}; readiness was not checked",
                    delay
                );
                return Ok(());
            }
        }

        tracing::info!("SSH tunnel is ready");
        Ok(())
    }

    async fn start_app(&mut self) -> Result<(), StartupError> {
        tracing::info!("Starting application on {}", self.plan.health.addr());
        let app = self.app.insert(ManagedProcess::start(&self.plan.app)?);

        let checker = HealthChecker::new(self.plan.health.clone());
        let checker = &checker;
        let probes = gate_on_process(
            wait_until(
                StartupPhase::AppStarting.name(),
                &self.plan.health_schedule,
                move || checker.probe(),
            ),
            app,
        )
        .await?;

        tracing::info!(
            "Application is healthy at {} after {} checks",
            checker.target().url(),
            probes
        );
        Ok(())
    }

    async fn start_proxy(&mut self) -> Result<(), StartupError> {
        tracing::info!("Starting proxy: {}", self.plan.proxy.command_line());
        let proxy = self.proxy.insert(ManagedProcess::start(&self.plan.proxy)?);

        smol::Timer::after(self.plan.proxy_grace).await;

        let name = self.plan.proxy_process_name.clone();
        let alive = proxy.is_alive() || smol::unblock(move || process_running(&name)).await;
        if !alive {
            tracing::error!("Proxy failed to start");
            return Err(StartupError::ProxyNotRunning {
                name: self.plan.proxy_process_name.clone(),
            });
        }

        tracing::info!("Proxy is running");
        Ok(())
    }

    async fn wait_for_app(&mut self) -> Result<i32, StartupError> {
        let Some(app) = self.app.as_mut() else {
            return Ok(0);
        };
        let status = app.wait().await?;
        let code = exit_code_of(status);
        tracing::info!("Application exited with {}, shutting down", status);

        self.shutdown().await;
        self.reporter.transition(StartupPhase::Exited { code });
        Ok(code)
    }

    /// Stop children in reverse start order.
    async fn shutdown(&mut self) {
        let grace = self.plan.shutdown_grace;
        for process in [self.proxy.as_mut(), self.app.as_mut(), self.tunnel.as_mut()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = process.terminate(grace).await {
                tracing::warn!("Failed to stop {} process: {}", process.role(), e);
            }
        }
    }
}

/// Await `gate`, failing early if `process` exits first.
async fn gate_on_process<T>(
    gate: impl std::future::Future<Output = Result<T, StartupError>>,
    process: &mut ManagedProcess,
) -> Result<T, StartupError> {
    let role: ProcessRole = process.role();
    let exited = async {
        match process.wait().await {
            Ok(status) => Err(StartupError::Exited { role, status }),
            Err(e) => Err(e),
        }
    };
    smol::future::or(gate, exited).await
}
