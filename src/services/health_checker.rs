//! HTTP health probing for the web application.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use smol::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use smol::net::TcpStream;

/// Where the application answers health checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTarget {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub request_timeout: Duration,
}

impl HealthTarget {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn url(&self) -> String {
        format!("http://{}{}", self.addr(), self.path)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HealthMetrics {
    pub is_healthy: bool,
    pub response_time_ms: u128,
    pub status: Option<u16>,
    pub error_message: Option<String>,
    pub consecutive_failures: u32,
    pub total_checks: u64,
}

/// Probes a [`HealthTarget`] and keeps running totals for progress logs.
pub struct HealthChecker {
    target: HealthTarget,
    metrics: Mutex<HealthMetrics>,
}

impl HealthChecker {
    pub fn new(target: HealthTarget) -> Self {
        Self {
            target,
            metrics: Mutex::new(HealthMetrics::default()),
        }
    }

    pub fn target(&self) -> &HealthTarget {
        &self.target
    }

    pub fn current_metrics(&self) -> HealthMetrics {
        self.metrics
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Run one health check, record it, and report whether the app is healthy.
    pub async fn probe(&self) -> bool {
        let started = Instant::now();
        let result = check_once(&self.target).await;
        let elapsed = started.elapsed().as_millis();

        let Ok(mut metrics) = self.metrics.lock() else {
            return result.is_ok();
        };
        metrics.total_checks += 1;
        metrics.response_time_ms = elapsed;

        match result {
            Ok(status) => {
                metrics.is_healthy = true;
                metrics.status = Some(status);
                metrics.error_message = None;
                metrics.consecutive_failures = 0;
                true
            }
            Err(e) => {
                metrics.is_healthy = false;
                metrics.error_message = Some(e.to_string());
                metrics.consecutive_failures += 1;
                tracing::info!(
                    "Waiting for application at {} (check {}): {}",
                    self.target.url(),
                    metrics.total_checks,
                    e
                );
                false
            }
        }
    }
}

/// Issue a single `GET` and return the status code if it is 2xx or 3xx.
pub async fn check_once(target: &HealthTarget) -> Result<u16> {
    let exchange = async {
        let mut stream = TcpStream::connect(target.addr())
            .await
            .with_context(|| format!("connection to {} failed", target.addr()))?;

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: turnos-entrypoint\r\nAccept: */*\r\nConnection: close\r\n\r\n",
            target.path,
            target.addr()
        );
        stream
            .write_all(request.as_bytes())
            .await
            .context("failed to send health request")?;

        let mut status_line = String::new();
        BufReader::new(stream)
            .read_line(&mut status_line)
            .await
            .context("failed to read health response")?;

        parse_status_line(&status_line)
    };

    let expire = async {
        smol::Timer::after(target.request_timeout).await;
        Err(anyhow!(
            "health check timed out after {:?}",
            target.request_timeout
        ))
    };

    let status = smol::future::or(exchange, expire).await?;
    if !(200..400).contains(&status) {
        bail!("health endpoint answered {}", status);
    }
    Ok(status)
}

fn parse_status_line(line: &str) -> Result<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        bail!("not an HTTP response: {:?}", line.trim_end());
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| anyhow!("malformed status line: {:?}", line.trim_end()))
}
