use std::path::PathBuf;
use std::str::FromStr;
use std::time;

use anyhow::{Result, bail};
use envconfig::Envconfig;

use crate::orchestrator::{StartupPlan, TunnelPlan, TunnelReadiness};
use crate::services::connection_monitor::{
    DbProbe, MonitorSettings, TunnelMonitor, normalize_database_uri,
};
use crate::services::health_checker::HealthTarget;
use crate::services::process::{ProcessRole, ProcessSpec};
use crate::services::readiness::PollSchedule;
use crate::services::ssh::{BackoffConfig, TunnelConfig};

/// Where ssh forwards the database locally. The app's database URI assumes it.
const LOCAL_BIND_HOST: &str = "127.0.0.1";

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(nested = true)]
    pub tunnel: TunnelEnv,

    #[envconfig(nested = true)]
    pub app: AppEnv,

    #[envconfig(nested = true)]
    pub proxy: ProxyEnv,

    #[envconfig(nested = true)]
    pub monitor: MonitorEnv,

    /// Upper bound for any single poll interval.
    #[envconfig(from = "POLL_MAX_INTERVAL", default = "5000")]
    pub poll_max_interval: EnvMsDuration,

    #[envconfig(from = "SHUTDOWN_GRACE", default = "10000")]
    pub shutdown_grace: EnvMsDuration,
}

#[derive(Envconfig, Clone)]
pub struct TunnelEnv {
    #[envconfig(from = "SSH_HOST", default = "")]
    pub host: String,

    #[envconfig(from = "SSH_PORT", default = "22")]
    pub port: u16,

    #[envconfig(from = "SSH_USER", default = "root")]
    pub user: String,

    /// Plaintext, not base64.
    #[envconfig(from = "SSH_PRIVATE_KEY", default = "")]
    pub private_key: String,

    /// Empty means `$HOME/.ssh/id_rsa`.
    #[envconfig(from = "SSH_KEY_PATH", default = "")]
    pub key_path: String,

    #[envconfig(from = "SSH_PROGRAM", default = "ssh")]
    pub program: String,

    #[envconfig(from = "DB_HOST", default = "mariadb")]
    pub db_host: String,

    #[envconfig(from = "DB_PORT", default = "3306")]
    pub db_port: u16,

    #[envconfig(from = "TUNNEL_READINESS", default = "sentinel")]
    pub readiness: ReadinessPolicy,

    #[envconfig(from = "TUNNEL_SENTINEL_PATH", default = "/tmp/tunnel_ready")]
    pub sentinel_path: PathBuf,

    #[envconfig(from = "TUNNEL_POLL_INTERVAL", default = "2000")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(from = "TUNNEL_FIXED_DELAY", default = "3000")]
    pub fixed_delay: EnvMsDuration,

    #[envconfig(from = "TUNNEL_READY_TIMEOUT", default = "120000")]
    pub ready_timeout: EnvMsDuration,
}

#[derive(Envconfig, Clone)]
pub struct AppEnv {
    #[envconfig(from = "APP_PROGRAM", default = "gunicorn")]
    pub program: String,

    #[envconfig(from = "APP_MODULE", default = "cambios.app:create_app()")]
    pub module: String,

    #[envconfig(from = "APP_HOST", default = "127.0.0.1")]
    pub host: String,

    #[envconfig(from = "APP_PORT", default = "8000")]
    pub port: u16,

    #[envconfig(from = "APP_WORKERS", default = "2")]
    pub workers: u32,

    #[envconfig(from = "APP_EXTRA_ARGS", default = "")]
    pub extra_args: ArgList,

    #[envconfig(from = "HEALTH_PATH", default = "/")]
    pub health_path: String,

    #[envconfig(from = "HEALTH_INTERVAL", default = "1000")]
    pub health_interval: EnvMsDuration,

    #[envconfig(from = "HEALTH_REQUEST_TIMEOUT", default = "2000")]
    pub health_request_timeout: EnvMsDuration,

    #[envconfig(from = "HEALTH_TIMEOUT", default = "120000")]
    pub health_timeout: EnvMsDuration,
}

#[derive(Envconfig, Clone)]
pub struct ProxyEnv {
    #[envconfig(from = "PROXY_COMMAND", default = "nginx")]
    pub command: CommandLine,

    #[envconfig(from = "PROXY_PROCESS_NAME", default = "nginx")]
    pub process_name: String,

    #[envconfig(from = "PROXY_GRACE_PERIOD", default = "2000")]
    pub grace_period: EnvMsDuration,
}

#[derive(Envconfig, Clone)]
pub struct MonitorEnv {
    /// The application's database URI. Without it the monitor only checks
    /// that the forwarded port answers.
    #[envconfig(from = "FLASK_SQLALCHEMY_DATABASE_URI")]
    pub database_uri: Option<String>,

    #[envconfig(from = "MONITOR_INTERVAL", default = "60000")]
    pub interval: EnvMsDuration,

    #[envconfig(from = "MONITOR_MAX_BACKOFF", default = "60000")]
    pub max_backoff: EnvMsDuration,

    #[envconfig(from = "TUNNEL_SETTLE", default = "5000")]
    pub settle: EnvMsDuration,
}

impl Config {
    pub fn tunnel_enabled(&self) -> bool {
        !self.tunnel.host.trim().is_empty()
    }

    pub fn tunnel_config(&self) -> TunnelConfig {
        let t = &self.tunnel;
        TunnelConfig {
            ssh_program: t.program.clone(),
            ssh_host: t.host.trim().to_string(),
            ssh_port: t.port,
            ssh_user: t.user.clone(),
            private_key: t.private_key.clone(),
            key_path: resolve_key_path(&t.key_path),
            remote_host: t.db_host.clone(),
            remote_port: t.db_port,
            local_bind_host: LOCAL_BIND_HOST.to_string(),
            local_bind_port: t.db_port,
        }
    }

    fn schedule(&self, interval: EnvMsDuration, deadline: EnvMsDuration) -> PollSchedule {
        PollSchedule::backoff(interval.0, self.poll_max_interval.0, deadline.0)
    }

    /// Resolve configuration into the plan the orchestrator executes.
    ///
    /// `monitor_program` is the binary launched for the sentinel readiness
    /// policy, normally this executable.
    pub fn startup_plan(&self, monitor_program: PathBuf) -> Result<StartupPlan> {
        let app = &self.app;
        if app.workers == 0 {
            bail!("APP_WORKERS must be at least 1");
        }
        if !app.health_path.starts_with('/') {
            bail!("HEALTH_PATH must start with '/', got {:?}", app.health_path);
        }

        let tunnel = self.tunnel_enabled().then(|| {
            let readiness = match self.tunnel.readiness {
                ReadinessPolicy::Sentinel => TunnelReadiness::Sentinel {
                    path: self.tunnel.sentinel_path.clone(),
                    monitor: ProcessSpec::new(
                        ProcessRole::Monitor,
                        monitor_program.display().to_string(),
                    )
                    .arg("monitor"),
                    schedule: self.schedule(self.tunnel.poll_interval, self.tunnel.ready_timeout),
                },
                ReadinessPolicy::TcpProbe => TunnelReadiness::TcpProbe {
                    schedule: self.schedule(self.tunnel.poll_interval, self.tunnel.ready_timeout),
                    connect_timeout: self.tunnel.poll_interval.0,
                    retry: BackoffConfig::default(),
                },
                ReadinessPolicy::FixedDelay => TunnelReadiness::FixedDelay {
                    delay: self.tunnel.fixed_delay.0,
                },
            };
            TunnelPlan {
                config: self.tunnel_config(),
                readiness,
            }
        });

        let bind = format!("{}:{}", app.host, app.port);
        let app_spec = ProcessSpec::new(ProcessRole::App, &app.program)
            .args(["--workers".to_string(), app.workers.to_string()])
            .args(["--bind".to_string(), bind])
            .arg("--capture-output")
            .args(app.extra_args.0.iter().cloned())
            .arg(&app.module);

        let proxy = &self.proxy;
        let proxy_spec = ProcessSpec::new(ProcessRole::Proxy, &proxy.command.program)
            .args(proxy.command.args.iter().cloned());

        Ok(StartupPlan {
            tunnel,
            app: app_spec,
            health: HealthTarget {
                host: app.host.clone(),
                port: app.port,
                path: app.health_path.clone(),
                request_timeout: app.health_request_timeout.0,
            },
            health_schedule: self.schedule(app.health_interval, app.health_timeout),
            proxy: proxy_spec,
            proxy_process_name: proxy.process_name.clone(),
            proxy_grace: proxy.grace_period.0,
            shutdown_grace: self.shutdown_grace.0,
        })
    }

    /// Build the companion monitor run by `turnos-entrypoint monitor`.
    pub fn tunnel_monitor(&self) -> Result<TunnelMonitor> {
        if !self.tunnel_enabled() {
            bail!("SSH_HOST is not set, there is no tunnel to monitor");
        }

        let config = self.tunnel_config();
        let probe = match &self.monitor.database_uri {
            Some(uri) if !uri.trim().is_empty() => DbProbe::Sql {
                uri: normalize_database_uri(uri.trim())?,
            },
            _ => DbProbe::Tcp {
                addr: config.local_addr(),
                timeout: self.tunnel.poll_interval.0,
            },
        };

        Ok(TunnelMonitor::new(
            config,
            probe,
            MonitorSettings {
                sentinel_path: self.tunnel.sentinel_path.clone(),
                check_interval: self.monitor.interval.0,
                max_cool_down: self.monitor.max_backoff.0,
                settle: self.monitor.settle.0,
            },
        ))
    }
}

fn resolve_key_path(configured: &str) -> PathBuf {
    if !configured.trim().is_empty() {
        return PathBuf::from(configured.trim());
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/root"))
        .join(".ssh")
        .join("id_rsa")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessPolicy {
    Sentinel,
    TcpProbe,
    FixedDelay,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseReadinessPolicyError(String);

impl std::fmt::Display for ParseReadinessPolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} is not a readiness policy (sentinel, tcp-probe, fixed-delay)",
            self.0
        )
    }
}

impl FromStr for ReadinessPolicy {
    type Err = ParseReadinessPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "sentinel" => Ok(ReadinessPolicy::Sentinel),
            "tcp-probe" | "tcp" => Ok(ReadinessPolicy::TcpProbe),
            "fixed-delay" | "delay" => Ok(ReadinessPolicy::FixedDelay),
            _ => Err(ParseReadinessPolicyError(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// Whitespace separated arguments. No shell quoting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgList(pub Vec<String>);

impl FromStr for ArgList {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ArgList(s.split_whitespace().map(str::to_owned).collect()))
    }
}

/// A program followed by its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct CommandIsEmptyError;

impl FromStr for CommandLine {
    type Err = CommandIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace().map(str::to_owned);
        let program = words.next().ok_or(CommandIsEmptyError)?;
        Ok(CommandLine {
            program,
            args: words.collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::init_from_hashmap(&env).unwrap()
    }

    fn plan(vars: &[(&str, &str)]) -> StartupPlan {
        config(vars)
            .startup_plan(PathBuf::from("/usr/local/bin/turnos-entrypoint"))
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]);
        assert!(!config.tunnel_enabled());
        assert_eq!(config.tunnel.port, 22);
        assert_eq!(config.tunnel.user, "root");
        assert_eq!(config.tunnel.db_host, "mariadb");
        assert_eq!(config.tunnel.db_port, 3306);
        assert_eq!(config.tunnel.readiness, ReadinessPolicy::Sentinel);
        assert_eq!(config.tunnel.sentinel_path, PathBuf::from("/tmp/tunnel_ready"));
        assert_eq!(config.app.port, 8000);
        assert!(config.monitor.database_uri.is_none());
    }

    #[test]
    fn test_empty_ssh_host_skips_tunnel() {
        assert!(plan(&[("SSH_HOST", "")]).tunnel.is_none());
        assert!(plan(&[("SSH_HOST", "   ")]).tunnel.is_none());
        assert!(plan(&[]).tunnel.is_none());
    }

    #[test]
    fn test_startup_without_ssh_host_skips_tunnel_and_writes_no_key() {
        use crate::orchestrator::Orchestrator;
        use crate::test_support::{FakeHealthEndpoint, LogCapture};

        let logs = LogCapture::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber());

        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let key_path = dir.path().join("id_rsa");
            let endpoint = FakeHealthEndpoint::start("HTTP/1.1 200 OK").await;
            let port = endpoint.port.to_string();
            let key = key_path.display().to_string();

            let mut plan = plan(&[
                ("SSH_HOST", ""),
                ("SSH_PRIVATE_KEY", "key material"),
                ("SSH_KEY_PATH", key.as_str()),
                ("APP_PORT", port.as_str()),
                ("PROXY_GRACE_PERIOD", "100"),
            ]);
            plan.app = ProcessSpec::new(ProcessRole::App, "sleep").arg("1");
            plan.proxy = ProcessSpec::new(ProcessRole::Proxy, "sleep").arg("30");
            plan.proxy_process_name = "sleep".to_string();

            assert_eq!(Orchestrator::new(plan).run().await.unwrap(), 0);
            assert!(!key_path.exists());
        });

        assert!(logs.contents().contains("skipping SSH tunnel setup"));
    }

    #[test]
    fn test_tunnel_plan_from_env() {
        let plan = plan(&[
            ("SSH_HOST", "bastion"),
            ("SSH_PORT", "2222"),
            ("SSH_USER", "deploy"),
            ("SSH_PRIVATE_KEY", "key material"),
            ("SSH_KEY_PATH", "/run/secrets/id_ed25519"),
            ("DB_HOST", "db.internal"),
            ("DB_PORT", "3307"),
        ]);

        let tunnel = plan.tunnel.unwrap();
        assert_eq!(tunnel.config.ssh_url(), "deploy@bastion");
        assert_eq!(tunnel.config.ssh_port, 2222);
        assert_eq!(tunnel.config.key_path, PathBuf::from("/run/secrets/id_ed25519"));
        assert_eq!(tunnel.config.forward_spec(), "127.0.0.1:3307:db.internal:3307");

        let TunnelReadiness::Sentinel {
            path,
            monitor,
            schedule,
        } = tunnel.readiness
        else {
            panic!("sentinel is the default readiness policy");
        };
        assert_eq!(path, PathBuf::from("/tmp/tunnel_ready"));
        assert_eq!(
            monitor.command_line(),
            "/usr/local/bin/turnos-entrypoint monitor"
        );
        assert_eq!(monitor.role, ProcessRole::Monitor);
        assert_eq!(schedule.interval, Duration::from_secs(2));
        assert_eq!(schedule.deadline, Duration::from_secs(120));
    }

    #[test]
    fn test_default_key_path_is_under_home() {
        let config = config(&[("SSH_HOST", "bastion")]);
        let key_path = config.tunnel_config().key_path;
        assert!(key_path.ends_with(".ssh/id_rsa"));
    }

    #[test]
    fn test_readiness_policies() {
        let tcp = plan(&[("SSH_HOST", "bastion"), ("TUNNEL_READINESS", "tcp-probe")]);
        assert!(matches!(
            tcp.tunnel.unwrap().readiness,
            TunnelReadiness::TcpProbe { .. }
        ));

        let delay = plan(&[
            ("SSH_HOST", "bastion"),
            ("TUNNEL_READINESS", "FIXED_DELAY"),
            ("TUNNEL_FIXED_DELAY", "2500"),
        ]);
        assert_eq!(
            delay.tunnel.unwrap().readiness,
            TunnelReadiness::FixedDelay {
                delay: Duration::from_millis(2500)
            }
        );

        let env: HashMap<String, String> =
            HashMap::from([("TUNNEL_READINESS".to_string(), "carrier-pigeon".to_string())]);
        assert!(Config::init_from_hashmap(&env).is_err());
    }

    #[test]
    fn test_app_command() {
        let plan = plan(&[("APP_WORKERS", "4"), ("APP_EXTRA_ARGS", "--timeout 120")]);
        assert_eq!(
            plan.app.command_line(),
            "gunicorn --workers 4 --bind 127.0.0.1:8000 --capture-output --timeout 120 cambios.app:create_app()"
        );
        assert_eq!(plan.health.url(), "http://127.0.0.1:8000/");
    }

    #[test]
    fn test_invalid_app_settings_are_rejected() {
        let zero_workers = config(&[("APP_WORKERS", "0")]);
        assert!(zero_workers.startup_plan(PathBuf::from("x")).is_err());

        let bad_path = config(&[("HEALTH_PATH", "health")]);
        assert!(bad_path.startup_plan(PathBuf::from("x")).is_err());
    }

    #[test]
    fn test_proxy_command() {
        let plan = plan(&[
            ("PROXY_COMMAND", "caddy run --config /etc/caddy/Caddyfile"),
            ("PROXY_PROCESS_NAME", "caddy"),
            ("PROXY_GRACE_PERIOD", "500"),
        ]);
        assert_eq!(plan.proxy.program, "caddy");
        assert_eq!(plan.proxy.args, vec!["run", "--config", "/etc/caddy/Caddyfile"]);
        assert_eq!(plan.proxy_process_name, "caddy");
        assert_eq!(plan.proxy_grace, Duration::from_millis(500));
    }

    #[test]
    fn test_monitor_requires_tunnel() {
        assert!(config(&[]).tunnel_monitor().is_err());
        assert!(config(&[("SSH_HOST", "bastion")]).tunnel_monitor().is_ok());
        assert!(
            config(&[
                ("SSH_HOST", "bastion"),
                ("FLASK_SQLALCHEMY_DATABASE_URI", "sqlite:///shifts.db")
            ])
            .tunnel_monitor()
            .is_err()
        );
    }

    #[test]
    fn test_parse_values() {
        assert!("".parse::<CommandLine>().is_err());
        assert_eq!("  ".parse::<ArgList>().unwrap(), ArgList::default());
        assert!("abc".parse::<EnvMsDuration>().is_err());
        assert_eq!(
            "1500".parse::<EnvMsDuration>().unwrap().0,
            Duration::from_millis(1500)
        );
    }
}
