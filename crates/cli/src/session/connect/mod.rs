//! Browser discovery, launch, probing, and termination helpers.
//!
//! These are the OS-facing pieces the lifecycle manager composes: find a
//! binary, spawn it on a port with an owner-scoped profile, wait for the
//! port, talk to the DevTools HTTP endpoint, and kill the process tree.

mod browser_finder;
mod browser_launcher;
mod cdp_probe;
mod process_killer;
mod user_data_dir;

pub use browser_launcher::{BrowserSpawner, LaunchCommand, ProcessSpawner, wait_until_reachable};
pub use cdp_probe::{CdpTarget, CdpVersionInfo, fetch_cdp_endpoint, list_targets};
pub use process_killer::kill_browser_tree;
pub use user_data_dir::{prune_profiles, resolve_profile_dir};
