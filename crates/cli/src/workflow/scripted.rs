//! Config-driven [`SiteDriver`]: visit listed URLs and run one extraction expression on each.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{SiteDriver, Target};
use crate::config::WorkflowConfig;
use crate::queue::WorkItem;
use crate::retry::UnitError;
use crate::session::RemoteDriver;

#[derive(Debug, Clone)]
pub struct ScriptedSiteDriver {
	home_url: String,
	targets: Vec<String>,
	extract_script: String,
}

#[derive(Debug, Deserialize)]
struct ExtractedItem {
	title: String,
	#[serde(default)]
	category: String,
	#[serde(default)]
	target: Option<String>,
}

impl ScriptedSiteDriver {
	pub fn new(home_url: impl Into<String>, targets: Vec<String>, extract_script: impl Into<String>) -> Self {
		Self {
			home_url: home_url.into(),
			targets,
			extract_script: extract_script.into(),
		}
	}

	pub fn from_config(config: &WorkflowConfig) -> Self {
		Self::new(config.home_url.clone(), config.targets.clone(), config.extract_script.clone())
	}
}

fn parse_items(target: &Target, value: Value) -> Result<Vec<WorkItem>, UnitError> {
	if value.is_null() {
		return Ok(Vec::new());
	}
	let extracted: Vec<ExtractedItem> =
		serde_json::from_value(value).map_err(|e| UnitError::permanent(format!("extraction on {} returned an unexpected shape: {e}", target.url)))?;

	Ok(extracted
		.into_iter()
		.filter(|item| !item.title.trim().is_empty())
		.map(|item| WorkItem {
			target: item.target.unwrap_or_else(|| format!("{}#{}", target.id, item.title.trim())),
			title: item.title.trim().to_string(),
			category: item.category,
		})
		.collect())
}

#[async_trait]
impl SiteDriver for ScriptedSiteDriver {
	fn home_url(&self) -> &str {
		&self.home_url
	}

	async fn plan(&self, driver: &mut dyn RemoteDriver) -> Result<Vec<Target>, UnitError> {
		driver.navigate(&self.home_url).await?;
		Ok(self.targets.iter().map(Target::from_url).collect())
	}

	async fn process(&self, driver: &mut dyn RemoteDriver, target: &Target) -> Result<Vec<WorkItem>, UnitError> {
		driver.navigate(&target.url).await?;
		let value = driver.evaluate(&self.extract_script).await?;
		let items = parse_items(target, value)?;
		debug!(target = "relay.workflow", url = %target.url, items = items.len(), "target processed");
		Ok(items)
	}
}
