//! Engine process supervision and monitor-console access.
//!
//! The supervisor owns the lifecycle of a single spawned engine process
//! per session: free-port allocation, readiness probing against the
//! monitor port, graceful termination, and a background watcher that
//! publishes the exit the moment it happens. The monitor client speaks
//! the engine's line-oriented console protocol over that port.

mod config;
mod error;
mod monitor;
mod supervisor;

pub use config::{env_flag, EngineConfig};
pub use error::EngineError;
pub use monitor::{MonitorClient, DEFAULT_COMMAND_TIMEOUT, EXEC_MONITOR_TIMEOUT};
pub use supervisor::{find_free_port, EngineEvent, EngineHandle, EngineSupervisor};
