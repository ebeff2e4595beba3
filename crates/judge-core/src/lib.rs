//! Dispatcher and Sandbox: the two core components of the judging
//! service. Everything else (ingress, completion callbacks, the CLI)
//! is a thin adapter built on top of what this crate exposes.

pub mod audit;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod sandbox;
pub mod security;
pub mod telemetry;

pub use config::DispatcherConfig;
pub use dispatcher::{CompletionHandler, Dispatcher, DispatcherStatus};
pub use error::{ConfigError, DispatchError};
pub use sandbox::{OjVerdict, Sandbox, SandboxFile, SandboxInvocation, SandboxResult, SandboxStatus};
