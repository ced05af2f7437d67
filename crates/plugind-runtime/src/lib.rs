//! Plugin runtime variants and the lifetime supervisor that
//! drives any of them from install through restart-on-exit.

mod lifetime;
mod local;
mod ops;
mod remote;
mod serverless;

pub use lifetime::{run_lifetime, RegisterFn};
pub use local::{Installer, LocalRuntime, NoopInstaller};
pub use ops::{PluginRuntimeOps, RuntimeKind, SessionMessage};
pub use remote::{RemoteRuntime, HEARTBEAT_TIMEOUT};
pub use serverless::{ServerlessRuntime, WRITE_DEADLINE};
