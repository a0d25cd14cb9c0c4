//! Helpers shared by the unit tests.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::net::TcpListener;

/// Write an executable stand-in for the ssh binary and return its path.
pub fn fake_ssh(dir: &Path, body: &str) -> String {
    let path = dir.join("fake-ssh");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.display().to_string()
}

/// A loopback HTTP endpoint answering every request with a fixed status line.
pub struct FakeHealthEndpoint {
    pub port: u16,
    _task: smol::Task<()>,
}

impl FakeHealthEndpoint {
    pub async fn start(status_line: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let task = smol::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                smol::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let response = format!(
                        "{}\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
                        status_line
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                })
                .detach();
            }
        });

        Self { port, _task: task }
    }
}

/// A loopback listener that accepts and drops connections, standing in for a
/// forwarded database port.
pub struct FakeForwardedPort {
    pub port: u16,
    _task: smol::Task<()>,
}

impl FakeForwardedPort {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = smol::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });
        Self { port, _task: task }
    }
}

/// A port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Collects formatted log lines written through [`LogCapture::subscriber`].
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync + 'static {
        let capture = self.clone();
        tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || capture.clone())
            .finish()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
