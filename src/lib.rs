pub mod config;
pub mod error;
pub mod orchestrator;
pub mod services;

pub use services::ssh;

#[cfg(test)]
mod test_support;
