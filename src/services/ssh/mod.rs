//! SSH tunneling to the remote database.
//!
//! - `SshTunnel` - port forward using the system ssh binary
//! - `TunnelConfig` - connection and forwarding parameters
//! - `ExponentialBackoff` - retry pacing shared with the readiness gates

mod reconnect;
mod tunnel;
mod types;

pub use reconnect::{BackoffConfig, ExponentialBackoff, is_retriable_error};
pub use tunnel::{Severity, SshTunnel, ssh_command, ssh_stderr_severity, write_private_key};
pub use types::TunnelConfig;

#[cfg(test)]
pub(crate) use types::test_config;
