pub mod connection_monitor;
pub mod health_checker;
pub mod process;
pub mod readiness;
pub mod ssh;
