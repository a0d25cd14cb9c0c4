//! Child process supervision.
//!
//! Every process the entrypoint launches (SSH tunnel, tunnel monitor, web
//! application, reverse proxy) goes through [`ManagedProcess`], so start,
//! liveness, terminate and wait behave the same regardless of role.

use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use smol::io::{AsyncBufReadExt, AsyncRead, BufReader};
use smol::process::{Child, Command, Stdio};

use crate::error::StartupError;
use crate::services::ssh::{Severity, ssh_stderr_severity};

/// How many trailing stderr lines are kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    Tunnel,
    Monitor,
    App,
    Proxy,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessRole::Tunnel => "tunnel",
            ProcessRole::Monitor => "monitor",
            ProcessRole::App => "app",
            ProcessRole::Proxy => "proxy",
        };
        f.write_str(name)
    }
}

/// What to launch, and in which role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub role: ProcessRole,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(role: ProcessRole, program: impl Into<String>) -> Self {
        Self {
            role,
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// The command line as it would be typed, for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcessHandle {
    pid: u32,
    role: ProcessRole,
}

/// A running child owned by the orchestrator.
///
/// The child is killed when this value is dropped, so an early return from the
/// startup sequence never leaves processes behind.
pub struct ManagedProcess {
    handle: ProcessHandle,
    child: Child,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl ManagedProcess {
    /// Spawn the process described by `spec` with stdin closed and its output
    /// forwarded to the log.
    pub fn start(spec: &ProcessSpec) -> Result<Self, StartupError> {
        let mut std_cmd = std::process::Command::new(&spec.program);
        std_cmd.args(&spec.args);
        for (key, value) in &spec.env {
            std_cmd.env(key, value);
        }
        #[cfg(target_os = "linux")]
        die_with_parent(&mut std_cmd);

        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::debug!(role = %spec.role, "spawning: {}", spec.command_line());

        let mut child = cmd.spawn().map_err(|source| StartupError::Spawn {
            role: spec.role,
            source,
        })?;

        let handle = ProcessHandle {
            pid: child.id(),
            role: spec.role,
        };
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        if let Some(stdout) = child.stdout.take() {
            forward_output(handle.role, stdout, None);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(handle.role, stderr, Some(stderr_tail.clone()));
        }

        tracing::info!(role = %handle.role, pid = handle.pid, "started {}", spec.program);

        Ok(Self {
            handle,
            child,
            stderr_tail,
        })
    }

    pub fn role(&self) -> ProcessRole {
        self.handle.role
    }

    /// Check if the process is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_status(), Ok(None))
    }

    /// Exit status if the process has already exited, without blocking.
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_status().ok().flatten()
    }

    /// The most recent stderr lines, oldest first.
    pub fn recent_stderr(&self) -> Vec<String> {
        self.stderr_tail
            .lock()
            .map(|tail| tail.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Block until the process exits.
    pub async fn wait(&mut self) -> Result<ExitStatus, StartupError> {
        self.child.status().await.map_err(|source| StartupError::Process {
            role: self.handle.role,
            source,
        })
    }

    /// Ask the process to stop with SIGTERM, escalating to SIGKILL once
    /// `grace` has elapsed.
    pub async fn terminate(&mut self, grace: Duration) -> Result<ExitStatus, StartupError> {
        if let Some(status) = self.exit_status() {
            return Ok(status);
        }

        let role = self.handle.role;
        tracing::debug!(role = %role, pid = self.handle.pid, "sending SIGTERM");

        #[cfg(unix)]
        unsafe {
            libc::kill(self.handle.pid as libc::pid_t, libc::SIGTERM);
        }

        let child = &mut self.child;
        let exited = smol::future::or(async { Some(child.status().await) }, async {
            smol::Timer::after(grace).await;
            None
        })
        .await;

        let status = match exited {
            Some(result) => result,
            None => {
                tracing::warn!(role = %role, "did not exit after {:?}, killing", grace);
                let _ = self.child.kill();
                self.child.status().await
            }
        };

        let status = status.map_err(|source| StartupError::Process { role, source })?;
        tracing::info!(role = %role, "stopped with {}", status);
        Ok(status)
    }
}

/// Have the kernel SIGTERM the child once the thread that spawned it is gone.
///
/// `kill_on_drop` needs destructors to run. A parent killed by a signal runs
/// none, and its ssh child would keep the forwarded port bound.
#[cfg(target_os = "linux")]
fn die_with_parent(cmd: &mut std::process::Command) {
    use std::os::unix::process::CommandExt;

    let parent = std::process::id() as libc::pid_t;
    // SAFETY: only async-signal-safe calls between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            // The parent may have exited before prctl ran
            if libc::getppid() != parent {
                libc::raise(libc::SIGTERM);
            }
            Ok(())
        });
    }
}

fn forward_output<R>(role: ProcessRole, stream: R, tail: Option<Arc<Mutex<VecDeque<String>>>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    smol::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Some(result) = lines.next().await {
            let line = match result {
                Ok(line) => line,
                Err(e) => {
                    tracing::debug!(role = %role, "output read error: {}", e);
                    break;
                }
            };

            if let Some(tail) = &tail {
                if let Ok(mut tail) = tail.lock() {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.clone());
                }
            }

            let severity = match role {
                ProcessRole::Tunnel if tail.is_some() => ssh_stderr_severity(&line),
                _ => Severity::Info,
            };
            match severity {
                Severity::Error => tracing::error!(role = %role, "{}", line),
                Severity::Debug => tracing::debug!(role = %role, "{}", line),
                Severity::Info => tracing::info!(role = %role, "{}", line),
            }
        }
    })
    .detach();
}

/// Whether a live (non-zombie) process named `name` exists.
///
/// Matches `/proc/<pid>/comm` or the basename of argv[0]. Returns false on
/// systems without procfs.
pub fn process_running(name: &str) -> bool {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return false;
    };

    entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        })
        .any(|entry| process_matches(&entry.path(), name))
}

fn process_matches(proc_dir: &Path, name: &str) -> bool {
    if is_zombie(proc_dir) {
        return false;
    }

    if let Ok(comm) = std::fs::read_to_string(proc_dir.join("comm")) {
        if comm.trim_end() == name {
            return true;
        }
    }

    // comm is truncated to 15 bytes, so long names only match via argv[0]
    std::fs::read(proc_dir.join("cmdline"))
        .ok()
        .and_then(|raw| {
            let argv0 = raw.split(|b| *b == 0).next()?;
            let argv0 = std::str::from_utf8(argv0).ok()?;
            let base = Path::new(argv0).file_name()?.to_str()?;
            // nginx rewrites its title to "nginx: master process ..."
            Some(base == name || base.split(':').next() == Some(name))
        })
        .unwrap_or(false)
}

fn is_zombie(proc_dir: &Path) -> bool {
    std::fs::read_to_string(proc_dir.join("stat"))
        .ok()
        .and_then(|stat| {
            let (_, after_name) = stat.rsplit_once(')')?;
            after_name.trim_start().chars().next()
        })
        .is_some_and(|state| state == 'Z' || state == 'X')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_joins_program_and_args() {
        let spec = ProcessSpec::new(ProcessRole::App, "gunicorn")
            .args(["--workers", "2"])
            .arg("cambios.app:create_app()");
        assert_eq!(
            spec.command_line(),
            "gunicorn --workers 2 cambios.app:create_app()"
        );
    }

    #[test]
    fn test_start_missing_binary_is_spawn_error() {
        let spec = ProcessSpec::new(ProcessRole::Proxy, "/nonexistent/turnos-proxy");
        match ManagedProcess::start(&spec) {
            Err(StartupError::Spawn { role, .. }) => assert_eq!(role, ProcessRole::Proxy),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("spawning a missing binary should fail"),
        }
    }

    #[test]
    fn test_wait_returns_exit_code() {
        smol::block_on(async {
            let spec = ProcessSpec::new(ProcessRole::App, "sh").args(["-c", "exit 7"]);
            let mut process = ManagedProcess::start(&spec).unwrap();
            let status = process.wait().await.unwrap();
            assert_eq!(status.code(), Some(7));
            assert!(!process.is_alive());
        });
    }

    #[test]
    fn test_env_is_passed_to_child() {
        smol::block_on(async {
            let spec = ProcessSpec::new(ProcessRole::App, "sh")
                .args(["-c", "test \"$TURNOS_MARKER\" = yes"])
                .env("TURNOS_MARKER", "yes");
            let mut process = ManagedProcess::start(&spec).unwrap();
            assert!(process.wait().await.unwrap().success());
        });
    }

    #[test]
    fn test_terminate_stops_running_process() {
        smol::block_on(async {
            let spec = ProcessSpec::new(ProcessRole::Proxy, "sleep").arg("30");
            let mut process = ManagedProcess::start(&spec).unwrap();
            assert!(process.is_alive());

            let status = process.terminate(Duration::from_secs(2)).await.unwrap();
            assert!(!status.success());
            assert!(!process.is_alive());
        });
    }

    #[test]
    fn test_terminate_escalates_when_sigterm_is_ignored() {
        smol::block_on(async {
            let spec = ProcessSpec::new(ProcessRole::Tunnel, "sh")
                .args(["-c", "trap '' TERM; while true; do sleep 1; done"]);
            let mut process = ManagedProcess::start(&spec).unwrap();
            smol::Timer::after(Duration::from_millis(200)).await;

            let status = process
                .terminate(Duration::from_millis(300))
                .await
                .unwrap();
            assert!(!status.success());
        });
    }

    #[test]
    fn test_recent_stderr_keeps_tail() {
        smol::block_on(async {
            let spec = ProcessSpec::new(ProcessRole::Tunnel, "sh")
                .args(["-c", "echo 'Connection refused' >&2; exit 255"]);
            let mut process = ManagedProcess::start(&spec).unwrap();
            process.wait().await.unwrap();
            smol::Timer::after(Duration::from_millis(200)).await;

            assert_eq!(process.recent_stderr(), vec!["Connection refused".to_string()]);
        });
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_child_is_stopped_when_its_parent_dies_without_cleanup() {
        // The spawning thread exits without running ManagedProcess's destructor
        let pid = std::thread::spawn(|| {
            let spec = ProcessSpec::new(ProcessRole::Tunnel, "sleep").arg("30");
            let process = ManagedProcess::start(&spec).unwrap();
            let pid = process.handle.pid;
            std::mem::forget(process);
            pid
        })
        .join()
        .unwrap();

        let proc_dir = std::path::PathBuf::from(format!("/proc/{pid}"));
        let mut stopped = false;
        for _ in 0..50 {
            if !proc_dir.exists() || is_zombie(&proc_dir) {
                stopped = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        assert!(stopped, "child {pid} outlived its parent");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_process_running_finds_child_by_name() {
        smol::block_on(async {
            let spec = ProcessSpec::new(ProcessRole::Proxy, "sleep").arg("30");
            let mut process = ManagedProcess::start(&spec).unwrap();

            assert!(process_running("sleep"));
            assert!(!process_running("turnos-no-such-process"));

            process.terminate(Duration::from_secs(2)).await.unwrap();
        });
    }
}
