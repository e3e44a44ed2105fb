//! DevTools HTTP endpoint probing.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{RelayError, Result};

/// `/json/version` response subset.
#[derive(Debug, Clone, Deserialize)]
pub struct CdpVersionInfo {
	#[serde(rename = "webSocketDebuggerUrl")]
	pub web_socket_debugger_url: String,
	#[serde(rename = "Browser")]
	pub browser: Option<String>,
}

/// One entry from `/json/list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdpTarget {
	pub id: String,
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default)]
	pub url: String,
	#[serde(default)]
	pub web_socket_debugger_url: Option<String>,
}

impl CdpTarget {
	pub fn is_page(&self) -> bool {
		self.kind == "page" && self.web_socket_debugger_url.is_some()
	}
}

fn client() -> Result<reqwest::Client> {
	reqwest::Client::builder()
		.timeout(Duration::from_millis(1500))
		.build()
		.map_err(|e| RelayError::Driver(format!("Failed to create HTTP client: {e}")))
}

async fn get_json<T: serde::de::DeserializeOwned>(port: u16, path: &str) -> Result<T> {
	let client = client()?;
	let mut last_error = "no response".to_string();

	for host in ["127.0.0.1", "localhost"] {
		let url = format!("http://{host}:{port}{path}");
		let response = match client.get(&url).send().await {
			Ok(r) => r,
			Err(e) => {
				last_error = e.to_string();
				continue;
			}
		};

		if !response.status().is_success() {
			last_error = format!("unexpected status {}", response.status());
			continue;
		}

		return response
			.json()
			.await
			.map_err(|e| RelayError::Driver(format!("Failed to parse {path} response: {e}")));
	}

	Err(RelayError::Driver(format!("Failed to reach DevTools on port {port}: {last_error}")))
}

/// Resolves browser-level metadata from `/json/version` on `port`.
pub async fn fetch_cdp_endpoint(port: u16) -> Result<CdpVersionInfo> {
	get_json(port, "/json/version").await
}

/// Lists debuggable targets on `port`.
pub async fn list_targets(port: u16) -> Result<Vec<CdpTarget>> {
	get_json(port, "/json/list").await
}
