//! Browser session subsystem.
//!
//! Owns the persisted session registry, the lifecycle state machine, and the
//! launch/attach/teardown orchestration built on the `connect` helpers.

/// Browser discovery, spawn, probe, and kill helpers.
pub mod connect;
/// Remote-control driver traits and the CDP implementation.
pub mod driver;
/// Launch and teardown orchestration.
pub mod lifecycle;
/// Persisted session row.
pub mod record;
/// Registry facade over the session store.
pub mod registry;
/// Lifecycle states and transitions.
pub mod state;

pub use driver::{CdpConnector, CdpDriver, DriverConnector, RemoteDriver};
pub use lifecycle::{AutomationSession, LifecycleOptions, OwnerProfile, ReconcileReport, SessionLifecycleManager, ShutdownReport};
pub use record::SessionRecord;
pub use registry::SessionRegistry;
pub use state::SessionState;
