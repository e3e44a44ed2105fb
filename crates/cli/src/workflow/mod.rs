//! Recurring browser workflows built on the lifecycle manager and retry controller.
//!
//! A [`SiteDriver`] supplies the site-specific steps; [`Workflow`] wraps them
//! in the advisory lock, session launch, per-target retry, and re-arming.

mod runner;
mod scripted;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use runner::{RunReport, RunStatus, Workflow, WorkflowContext};
pub use scripted::ScriptedSiteDriver;

use crate::queue::WorkItem;
use crate::retry::UnitError;
use crate::session::RemoteDriver;

/// One page a workflow visits during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
	pub id: String,
	pub url: String,
}

impl Target {
	pub fn from_url(url: impl Into<String>) -> Self {
		let url = url.into();
		Self { id: url.clone(), url }
	}
}

/// Site-specific scripted actions.
#[async_trait]
pub trait SiteDriver: Send + Sync {
	/// Neutral page the session returns to when its state is reset.
	fn home_url(&self) -> &str;

	/// Decides which targets this run visits.
	async fn plan(&self, driver: &mut dyn RemoteDriver) -> Result<Vec<Target>, UnitError>;

	/// Performs the scripted interaction on one target.
	async fn process(&self, driver: &mut dyn RemoteDriver, target: &Target) -> Result<Vec<WorkItem>, UnitError>;
}
