//! Sandbox: runs untrusted code fragments in a child interpreter under
//! wall-clock, memory and output limits, inside a scoped working directory.
//!
//! Isolation is process and resource-limit based. It is not a container:
//! there are no kernel namespaces, and the import denylist is a static
//! pre-check only.
//!
//! # Modules
//!
//! - [`config`]     — `SandboxConfig` (limits, interpreter, denylist)
//! - [`capability`] — static denylist inspection
//! - [`limiter`]    — `ResourceLimiter`, `RlimitLimiter`, `PortableLimiter`
//! - [`session`]    — `SandboxSession` (open / execute / stage / close)
//! - [`result`]     — `ExecutionResult`, `TerminationReason`
//! - [`error`]      — `SandboxError` / `SandboxResult`

pub mod capability;
mod capture;
pub mod config;
pub mod error;
pub mod limiter;
pub mod result;
pub mod session;

pub use capability::{find_denied, referenced_names, DeniedReference};
pub use config::SandboxConfig;
pub use error::{SandboxError, SandboxResult};
#[cfg(unix)]
pub use limiter::RlimitLimiter;
pub use limiter::{default_limiter, PortableLimiter, ResourceLimiter};
pub use result::{ExecutionResult, TerminationReason};
pub use session::SandboxSession;
