//! Decision oracle backends.
//!
//! The [`DecisionOracle`] trait is the loop's only view of the text model.
//! [`OpenAiOracle`] talks to any OpenAI-compatible `/chat/completions`
//! endpoint; tests use scripted oracles instead.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::io::config::OracleConfig;

const MIN_KEY_LEN: usize = 10;
const KEY_PLACEHOLDERS: &[&str] = &["xxx", "paste-your-key-here", "changeme"];

/// Proposes the next intent given the rendered prompts.
pub trait DecisionOracle {
    /// Return the raw reply text. Transport failures and timeouts are errors.
    fn propose(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
}

/// Blocking client for OpenAI-compatible chat completion APIs.
#[derive(Debug, Clone)]
pub struct OpenAiOracle {
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    http_client: reqwest::blocking::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiOracle {
    /// Build a client from config, resolving the API key up front.
    pub fn from_config(config: &OracleConfig) -> Result<Self> {
        let api_key = resolve_api_key(config)?;
        let http_client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("build http client")?;
        Ok(Self {
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            http_client,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

impl DecisionOracle for OpenAiOracle {
    #[instrument(skip_all, fields(model = %self.model))]
    fn propose(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            temperature: self.temperature,
        };

        let response = self
            .http_client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .context("send chat completion request")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().unwrap_or_default();
            bail!("chat completion API error ({status}): {error_text}");
        }

        let completion: ChatCompletionResponse = response
            .json()
            .context("parse chat completion response")?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default()
            .trim()
            .to_string();
        debug!(reply_len = content.len(), "oracle replied");
        Ok(content)
    }
}

/// API key from the configured environment variable, else the key file.
pub fn resolve_api_key(config: &OracleConfig) -> Result<String> {
    if let Ok(value) = std::env::var(&config.api_key_env)
        && !value.trim().is_empty()
    {
        return check_key(value.trim()).with_context(|| format!("${}", config.api_key_env));
    }
    match &config.api_key_file {
        Some(path) => read_key_file(path),
        None => Err(anyhow!(
            "no API key: set ${} or oracle.api_key_file",
            config.api_key_env
        )),
    }
}

/// Read the first non-empty line of a key file. `NAME=value` lines are accepted.
pub fn read_key_file(path: &Path) -> Result<String> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read key file {}", path.display()))?;
    let line = contents
        .lines()
        .map(|line| line.trim_start_matches('\u{feff}').trim())
        .find(|line| !line.is_empty())
        .ok_or_else(|| anyhow!("key file {} is empty", path.display()))?;
    let key = match line.split_once('=') {
        Some((_, value)) => value.trim(),
        None => line,
    };
    check_key(key).with_context(|| format!("key file {}", path.display()))
}

fn check_key(key: &str) -> Result<String> {
    let lowered = key.to_ascii_lowercase();
    if lowered.contains("your-key") || KEY_PLACEHOLDERS.contains(&lowered.as_str()) {
        bail!("API key looks like a placeholder");
    }
    if key.len() < MIN_KEY_LEN {
        bail!("API key looks empty or too short");
    }
    Ok(key.to_string())
}
