//! Text generation collaborator used by the work queue.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::GeneratorConfig;
use crate::error::GenerationError;

#[async_trait]
pub trait Generator: Send + Sync {
	async fn generate(&self, title: &str, category: &str) -> Result<String, GenerationError>;
}

/// Posts to an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct ChatCompletionsGenerator {
	client: reqwest::Client,
	endpoint: String,
	model: String,
	api_key: String,
	system_prompt: String,
	max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
	#[serde(default)]
	choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
	message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
	#[serde(default)]
	content: Option<String>,
}

impl ChatCompletionsGenerator {
	/// Builds a generator, reading the API key from the configured env var.
	pub fn from_config(config: &GeneratorConfig) -> Result<Self, GenerationError> {
		let api_key = std::env::var(&config.api_key_env)
			.ok()
			.filter(|key| !key.trim().is_empty())
			.ok_or_else(|| GenerationError::MissingApiKey(config.api_key_env.clone()))?;
		Self::with_api_key(config, api_key)
	}

	pub fn with_api_key(config: &GeneratorConfig, api_key: impl Into<String>) -> Result<Self, GenerationError> {
		let client = reqwest::Client::builder().timeout(Duration::from_millis(config.timeout_ms)).build()?;
		Ok(Self {
			client,
			endpoint: config.endpoint.clone(),
			model: config.model.clone(),
			api_key: api_key.into(),
			system_prompt: config.system_prompt.clone(),
			max_tokens: config.max_tokens,
		})
	}

	fn request_body(&self, title: &str, category: &str) -> Value {
		let prompt = format!(
			"Title: {title}\nCategory: {category}\n\nWrite the summary using current information, in a tone that suits the category. \
			 Do not include links, citation markers, or hashtags."
		);
		json!({
			"model": self.model,
			"messages": [
				{ "role": "system", "content": self.system_prompt },
				{ "role": "user", "content": prompt },
			],
			"max_tokens": self.max_tokens,
			"temperature": 0.7,
		})
	}
}

fn first_choice(response: ChatResponse) -> Result<String, GenerationError> {
	response
		.choices
		.into_iter()
		.next()
		.and_then(|choice| choice.message.content)
		.map(|content| content.trim().to_string())
		.filter(|content| !content.is_empty())
		.ok_or(GenerationError::Empty)
}

#[async_trait]
impl Generator for ChatCompletionsGenerator {
	async fn generate(&self, title: &str, category: &str) -> Result<String, GenerationError> {
		let response = self
			.client
			.post(&self.endpoint)
			.bearer_auth(&self.api_key)
			.json(&self.request_body(title, category))
			.send()
			.await?;

		let status = response.status();
		if !status.is_success() {
			let message: String = response.text().await.unwrap_or_default().chars().take(500).collect();
			return Err(GenerationError::Status {
				status: status.as_u16(),
				message,
			});
		}

		let text = first_choice(response.json().await?)?;
		debug!(target = "relay.generator", title, chars = text.chars().count(), "generated");
		Ok(text)
	}
}
