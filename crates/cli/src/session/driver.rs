//! Remote-control handle attached to a launched browser.
//!
//! [`RemoteDriver`] is the narrow surface workflows use; [`CdpDriver`] speaks
//! the DevTools protocol over a page target's websocket. Requests carry a
//! sequential id and the reader skips events until the matching response
//! arrives.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use super::connect::{fetch_cdp_endpoint, list_targets};
use crate::error::{RelayError, Result};

const READY_POLL: Duration = Duration::from_millis(250);

#[async_trait]
pub trait RemoteDriver: Send {
	/// Navigates and waits for the document to finish loading.
	async fn navigate(&mut self, url: &str) -> Result<()>;

	async fn current_url(&mut self) -> Result<String>;

	/// Evaluates `expression` in the page and returns its JSON value.
	async fn evaluate(&mut self, expression: &str) -> Result<Value>;

	async fn stop_loading(&mut self) -> Result<()>;

	/// Asks the browser to exit. The process may still need to be killed.
	async fn close(&mut self) -> Result<()>;
}

/// Attaches a [`RemoteDriver`] to a browser listening on a debugging port.
#[async_trait]
pub trait DriverConnector: Send + Sync {
	async fn attach(&self, port: u16) -> Result<Box<dyn RemoteDriver>>;
}

#[derive(Debug, Clone)]
pub struct CdpConnector {
	pub command_timeout: Duration,
}

impl Default for CdpConnector {
	fn default() -> Self {
		Self {
			command_timeout: Duration::from_secs(30),
		}
	}
}

#[async_trait]
impl DriverConnector for CdpConnector {
	async fn attach(&self, port: u16) -> Result<Box<dyn RemoteDriver>> {
		let targets = list_targets(port).await?;
		let page = targets
			.iter()
			.find(|target| target.is_page())
			.and_then(|target| target.web_socket_debugger_url.clone())
			.ok_or_else(|| RelayError::Driver(format!("no page target on port {port}")))?;

		let driver = CdpDriver::connect(&page, port, self.command_timeout).await?;
		Ok(Box::new(driver))
	}
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Deserialize)]
struct CdpErrorPayload {
	code: i64,
	message: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CdpMessage {
	Response {
		id: u64,
		#[serde(default)]
		result: Option<Value>,
		#[serde(default)]
		error: Option<CdpErrorPayload>,
	},
	Event {
		method: String,
	},
}

pub struct CdpDriver {
	ws: WsStream,
	port: u16,
	next_id: u64,
	command_timeout: Duration,
	closed: bool,
}

impl std::fmt::Debug for CdpDriver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CdpDriver").field("port", &self.port).field("closed", &self.closed).finish_non_exhaustive()
	}
}

impl CdpDriver {
	pub async fn connect(url: &str, port: u16, command_timeout: Duration) -> Result<Self> {
		let (ws, _) = tokio_tungstenite::connect_async(url)
			.await
			.map_err(|e| RelayError::Driver(format!("websocket connect to {url} failed: {e}")))?;
		debug!(target = "relay.driver", port, url, "attached to page target");
		Ok(Self {
			ws,
			port,
			next_id: 0,
			command_timeout,
			closed: false,
		})
	}

	/// Sends one command and waits for its response.
	pub async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
		if self.closed {
			return Err(RelayError::Driver("driver is closed".into()));
		}
		self.next_id += 1;
		let id = self.next_id;
		let payload = json!({ "id": id, "method": method, "params": params });
		self.ws
			.send(Message::Text(payload.to_string().into()))
			.await
			.map_err(|e| RelayError::Driver(format!("{method} send failed: {e}")))?;

		match tokio::time::timeout(self.command_timeout, read_response(&mut self.ws, id)).await {
			Ok(result) => result.map_err(|e| match e {
				RelayError::Driver(message) => RelayError::Driver(format!("{method}: {message}")),
				other => other,
			}),
			Err(_) => Err(RelayError::Driver(format!(
				"{method} timed out after {}ms",
				self.command_timeout.as_millis()
			))),
		}
	}

	async fn wait_for_load(&mut self) -> Result<()> {
		let started = Instant::now();
		loop {
			let state = self.evaluate("document.readyState").await?;
			if state.as_str() == Some("complete") {
				return Ok(());
			}
			if started.elapsed() >= self.command_timeout {
				return Err(RelayError::Driver(format!("page still '{state}' after {}ms", self.command_timeout.as_millis())));
			}
			tokio::time::sleep(READY_POLL).await;
		}
	}
}

async fn read_response(ws: &mut WsStream, id: u64) -> Result<Value> {
	while let Some(frame) = ws.next().await {
		let frame = frame.map_err(|e| RelayError::Driver(format!("websocket read failed: {e}")))?;
		let text = match frame {
			Message::Text(text) => text,
			Message::Close(_) => break,
			_ => continue,
		};

		match serde_json::from_str::<CdpMessage>(&text)? {
			CdpMessage::Response { id: got, result, error } if got == id => {
				if let Some(error) = error {
					return Err(RelayError::Driver(format!("protocol error {}: {}", error.code, error.message)));
				}
				return Ok(result.unwrap_or(Value::Null));
			}
			CdpMessage::Response { id: got, .. } => trace!(target = "relay.driver", id = got, "dropping stale response"),
			CdpMessage::Event { method } => trace!(target = "relay.driver", method = %method, "skipping event"),
		}
	}
	Err(RelayError::Driver("connection closed".into()))
}

#[async_trait]
impl RemoteDriver for CdpDriver {
	async fn navigate(&mut self, url: &str) -> Result<()> {
		let result = self.call("Page.navigate", json!({ "url": url })).await?;
		if let Some(error) = result.get("errorText").and_then(Value::as_str).filter(|text| !text.is_empty()) {
			return Err(RelayError::Driver(format!("navigation to {url} failed: {error}")));
		}
		self.wait_for_load().await?;
		debug!(target = "relay.driver", port = self.port, url, "navigated");
		Ok(())
	}

	async fn current_url(&mut self) -> Result<String> {
		let value = self.evaluate("location.href").await?;
		value
			.as_str()
			.map(str::to_string)
			.ok_or_else(|| RelayError::Driver(format!("location.href was not a string: {value}")))
	}

	async fn evaluate(&mut self, expression: &str) -> Result<Value> {
		let result = self
			.call(
				"Runtime.evaluate",
				json!({ "expression": expression, "returnByValue": true, "awaitPromise": true }),
			)
			.await?;

		if let Some(details) = result.get("exceptionDetails") {
			let message = details
				.pointer("/exception/description")
				.or_else(|| details.get("text"))
				.and_then(Value::as_str)
				.unwrap_or("script threw");
			return Err(RelayError::Driver(format!("evaluation failed: {message}")));
		}
		Ok(result.pointer("/result/value").cloned().unwrap_or(Value::Null))
	}

	async fn stop_loading(&mut self) -> Result<()> {
		self.call("Page.stopLoading", json!({})).await.map(|_| ())
	}

	async fn close(&mut self) -> Result<()> {
		if self.closed {
			return Ok(());
		}

		let (port, command_timeout) = (self.port, self.command_timeout);
		let browser_close = async move {
			let info = fetch_cdp_endpoint(port).await?;
			let mut browser = CdpDriver::connect(&info.web_socket_debugger_url, port, command_timeout).await?;
			// The browser drops the socket while exiting, so a missing reply is expected.
			let _ = browser.call("Browser.close", json!({})).await;
			Ok::<(), RelayError>(())
		};
		let outcome = browser_close.await;
		if let Err(err) = &outcome {
			warn!(target = "relay.driver", port, error = %err, "Browser.close failed");
		}

		self.closed = true;
		let _ = self.ws.close(None).await;
		outcome
	}
}

#[cfg(test)]
mod tests {
	use tokio::net::TcpListener;

	use super::*;

	fn reply(request: &Value) -> Value {
		let id = request["id"].clone();
		let params = &request["params"];
		match request["method"].as_str().unwrap_or_default() {
			"Page.navigate" if params["url"] == "https://unreachable.invalid/" => {
				json!({ "id": id, "result": { "frameId": "F", "errorText": "net::ERR_NAME_NOT_RESOLVED" } })
			}
			"Page.navigate" => json!({ "id": id, "result": { "frameId": "F" } }),
			"Page.stopLoading" => json!({ "id": id, "result": {} }),
			"Runtime.evaluate" => match params["expression"].as_str().unwrap_or_default() {
				"document.readyState" => json!({ "id": id, "result": { "result": { "type": "string", "value": "complete" } } }),
				"location.href" => json!({ "id": id, "result": { "result": { "type": "string", "value": "https://example.com/" } } }),
				"boom()" => json!({
					"id": id,
					"result": {
						"result": { "type": "object" },
						"exceptionDetails": { "text": "Uncaught", "exception": { "description": "ReferenceError: boom is not defined" } }
					}
				}),
				_ => json!({ "id": id, "result": { "result": { "type": "object", "value": [{ "title": "a" }] } } }),
			},
			_ => json!({ "id": id, "error": { "code": -32601, "message": "method not found" } }),
		}
	}

	async fn fake_page() -> String {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();

		tokio::spawn(async move {
			let (stream, _) = listener.accept().await.unwrap();
			let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
			let (mut tx, mut rx) = ws.split();
			while let Some(Ok(Message::Text(text))) = rx.next().await {
				let request: Value = serde_json::from_str(&text).unwrap();
				let event = json!({ "method": "Page.frameStartedLoading", "params": { "frameId": "F" } });
				tx.send(Message::Text(event.to_string().into())).await.unwrap();
				tx.send(Message::Text(reply(&request).to_string().into())).await.unwrap();
			}
		});

		format!("ws://{addr}")
	}

	async fn driver() -> CdpDriver {
		CdpDriver::connect(&fake_page().await, 0, Duration::from_secs(2)).await.unwrap()
	}

	#[tokio::test]
	async fn navigate_skips_events_and_waits_for_load() {
		let mut driver = driver().await;
		driver.navigate("https://example.com/").await.unwrap();
		assert_eq!(driver.current_url().await.unwrap(), "https://example.com/");
		driver.stop_loading().await.unwrap();
	}

	#[tokio::test]
	async fn navigation_error_text_is_surfaced() {
		let mut driver = driver().await;
		let err = driver.navigate("https://unreachable.invalid/").await.unwrap_err();
		assert!(err.to_string().contains("ERR_NAME_NOT_RESOLVED"), "{err}");
	}

	#[tokio::test]
	async fn evaluate_returns_value_or_exception() {
		let mut driver = driver().await;
		assert_eq!(driver.evaluate("[...]").await.unwrap(), json!([{ "title": "a" }]));

		let err = driver.evaluate("boom()").await.unwrap_err();
		assert!(err.to_string().contains("boom is not defined"), "{err}");
	}

	#[tokio::test]
	async fn protocol_errors_name_the_method() {
		let mut driver = driver().await;
		let err = driver.call("Target.bogus", json!({})).await.unwrap_err();
		assert!(err.to_string().contains("Target.bogus"), "{err}");
		assert!(err.to_string().contains("method not found"), "{err}");
	}

	#[test]
	fn messages_without_id_are_events() {
		let message: CdpMessage = serde_json::from_str(r#"{"method":"Page.loadEventFired","params":{}}"#).unwrap();
		assert!(matches!(message, CdpMessage::Event { .. }));
		let message: CdpMessage = serde_json::from_str(r#"{"id":7,"result":{}}"#).unwrap();
		assert!(matches!(message, CdpMessage::Response { id: 7, .. }));
	}
}
