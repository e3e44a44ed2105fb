//! Process and port primitives shared by relay's session lifecycle.
//!
//! Everything here is synchronous and stateless: liveness checks, graceful
//! termination with escalation, descendant discovery, and local port
//! probing/allocation.

pub mod ports;
pub mod process;

pub use ports::{AllocationError, PortAllocator};
pub use process::{ProcessError, Termination, TreeTermination, pid_is_alive, port_available, process_cmdline, terminate, terminate_tree};
