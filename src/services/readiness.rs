//! Readiness gates.
//!
//! Every wait in the startup sequence goes through [`wait_until`], which polls
//! with exponential backoff and gives up at a hard deadline instead of
//! spinning forever.

use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};

use smol::io::AsyncWriteExt;
use smol::net::TcpStream;

use crate::error::StartupError;
use crate::services::ssh::{BackoffConfig, ExponentialBackoff};

/// Contents of the sentinel file.
const SENTINEL_CONTENTS: &str = "Tunnel is ready";

/// Pacing and deadline for one readiness gate.
#[derive(Debug, Clone, PartialEq)]
pub struct PollSchedule {
    pub interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub deadline: Duration,
}

impl PollSchedule {
    pub fn fixed(interval: Duration, deadline: Duration) -> Self {
        Self {
            interval,
            max_interval: interval,
            multiplier: 1.0,
            deadline,
        }
    }

    /// Start at `interval`, grow by half each poll, never exceed `max_interval`.
    pub fn backoff(interval: Duration, max_interval: Duration, deadline: Duration) -> Self {
        Self {
            interval,
            max_interval: max_interval.max(interval),
            multiplier: 1.5,
            deadline,
        }
    }

    fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: self.interval,
            max_delay: self.max_interval,
            multiplier: self.multiplier,
            max_attempts: None,
        }
    }
}

/// Poll `probe` until it reports ready or the schedule's deadline passes.
///
/// Returns the number of probes it took. The probe always runs at least once,
/// and once more right at the deadline.
pub async fn wait_until<F, Fut>(
    phase: &'static str,
    schedule: &PollSchedule,
    mut probe: F,
) -> Result<u32, StartupError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = Instant::now();
    let mut backoff = ExponentialBackoff::new(schedule.backoff_config());
    let mut probes = 0;

    loop {
        probes += 1;
        if probe().await {
            tracing::debug!("{} ready after {} probes in {:?}", phase, probes, started.elapsed());
            return Ok(probes);
        }

        let waited = started.elapsed();
        if waited >= schedule.deadline {
            return Err(StartupError::TimedOut { phase, waited });
        }

        let delay = backoff
            .next_delay()
            .unwrap_or(schedule.max_interval)
            .min(schedule.deadline - waited);
        smol::Timer::after(delay).await;
    }
}

/// Whether something accepts TCP connections at `addr` within `timeout`.
pub async fn port_accepting(addr: &str, timeout: Duration) -> bool {
    let connect = async { TcpStream::connect(addr).await.is_ok() };
    let expire = async {
        smol::Timer::after(timeout).await;
        false
    };
    smol::future::or(connect, expire).await
}

/// Whether the tunnel is currently marked ready.
pub async fn sentinel_present(path: &Path) -> bool {
    async_fs::metadata(path).await.is_ok()
}

/// Mark the tunnel as ready. Does nothing if the sentinel already exists.
pub async fn create_sentinel(path: &Path) -> Result<(), StartupError> {
    if sentinel_present(path).await {
        return Ok(());
    }

    let sentinel_error = |source| StartupError::Sentinel {
        path: path.to_path_buf(),
        source,
    };

    let mut file = async_fs::File::create(path).await.map_err(sentinel_error)?;
    let contents = format!(
        "{} since {}\n",
        SENTINEL_CONTENTS,
        chrono::Utc::now().to_rfc3339()
    );
    file.write_all(contents.as_bytes())
        .await
        .map_err(sentinel_error)?;
    file.flush().await.map_err(sentinel_error)?;

    tracing::info!("Tunnel is ready. Signal file {} created", path.display());
    Ok(())
}

/// Withdraw the readiness signal. Missing sentinels are fine.
pub async fn remove_sentinel(path: &Path) -> Result<(), StartupError> {
    match async_fs::remove_file(path).await {
        Ok(()) => {
            tracing::debug!("removed signal file {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StartupError::Sentinel {
            path: path.to_path_buf(),
            source,
        }),
    }
}
