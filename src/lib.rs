//! Live telemetry client for long-running remote runs.
//!
//! A [`RunMonitor`] resolves a run to its owning session, keeps one event
//! stream open against it, and folds every frame into a [`RunDetail`]
//! aggregate that consumers read while being told about changes through
//! [`MonitorEvent`]s.

pub mod aggregate;
pub mod api;
pub mod backoff;
pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod events;
pub mod frame;
pub mod monitor;
pub mod refresher;
pub mod router;
pub mod types;

#[cfg(test)]
mod testing;

pub use api::{HttpBackend, RunBackend, RunLocation};
pub use config::{ClientCfg, EndpointCfg, FrameFormat, ReconnectCfg};
pub use connection::ConnectionState;
pub use control::StopOutcome;
pub use error::SyncError;
pub use events::{Frame, MonitorEvent};
pub use frame::FrameParser;
pub use monitor::RunMonitor;
pub use types::{RunDetail, RunInfo, RunStatus};
