//! Message composition
//!
//! OpenAI and Anthropic composers plus the fixed template the dispatcher
//! falls back to whenever a provider fails, times out or answers with
//! nothing usable.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::collaborators::{ComposeError, ComposeRequest, MessageComposer};
use crate::config::ComposerConfig;

const MAX_TOKENS: u32 = 100;
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Currencies whose amounts are not stored in hundredths
const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "bif", "clp", "djf", "gnf", "jpy", "kmf", "krw", "mga", "pyg", "rwf", "ugx", "vnd", "vuv",
    "xaf", "xof", "xpf",
];

/// Currencies stored in thousandths
const THREE_DECIMAL_CURRENCIES: &[&str] = &["bhd", "iqd", "jod", "kwd", "lyd", "omr", "tnd"];

/// Format a minor-unit amount for display, e.g. `4999 usd -> "49.99"`
pub fn format_amount(amount_cents: i64, currency: &str) -> String {
    let currency = currency.to_ascii_lowercase();
    if ZERO_DECIMAL_CURRENCIES.contains(&currency.as_str()) {
        return amount_cents.to_string();
    }
    if THREE_DECIMAL_CURRENCIES.contains(&currency.as_str()) {
        return format!("{}.{:03}", amount_cents / 1000, amount_cents % 1000);
    }
    format!("{}.{:02}", amount_cents / 100, amount_cents % 100)
}

impl ComposeRequest {
    pub fn new(customer_name: &str, amount_cents: i64, currency: &str) -> Self {
        Self {
            customer_name: customer_name.to_string(),
            amount: format_amount(amount_cents, currency),
            currency: currency.to_ascii_uppercase(),
        }
    }
}

/// The message sent when no composer output is available
pub fn fallback_message(request: &ComposeRequest, payment_update_url: &str) -> String {
    format!(
        "Hi {}! Your {} {} payment didn't go through. No worries - just update your card here: {}. Thanks!",
        request.customer_name, request.currency, request.amount, payment_update_url
    )
}

fn build_prompt(request: &ComposeRequest) -> String {
    format!(
        "You are helping a SaaS company recover a failed payment in a friendly, human way.\n\n\
         Customer: {}\n\
         Amount: {} {}\n\
         Situation: their payment failed because of insufficient funds or a temporary issue.\n\n\
         Write a short WhatsApp/SMS message (max 160 characters) that sounds human, mentions \
         the amount, makes it easy to update the payment method and is not pushy. \
         Output only the message text.",
        request.customer_name, request.currency, request.amount
    )
}

fn non_empty(text: &str) -> Result<String, ComposeError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        Err(ComposeError::Empty)
    } else {
        Ok(trimmed.to_string())
    }
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, ComposeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ComposeError::Provider {
        status: status.as_u16(),
        body,
    })
}

/// Always returns the fixed template
#[derive(Debug, Clone)]
pub struct TemplateComposer {
    payment_update_url: String,
}

impl TemplateComposer {
    pub fn new(payment_update_url: impl Into<String>) -> Self {
        Self {
            payment_update_url: payment_update_url.into(),
        }
    }
}

#[async_trait]
impl MessageComposer for TemplateComposer {
    fn name(&self) -> &'static str {
        "template"
    }

    async fn compose(&self, request: &ComposeRequest) -> Result<String, ComposeError> {
        Ok(fallback_message(request, &self.payment_update_url))
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

/// OpenAI chat completions
#[derive(Debug, Clone)]
pub struct OpenAiComposer {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiComposer {
    pub fn new(client: Client, api_key: String, model: String, base_url: String) -> Self {
        Self {
            client,
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl MessageComposer for OpenAiComposer {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn compose(&self, request: &ComposeRequest) -> Result<String, ComposeError> {
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [{ "role": "user", "content": build_prompt(request) }],
                "max_tokens": MAX_TOKENS,
                "temperature": 0.7,
            }))
            .send()
            .await
            .map_err(|e| ComposeError::Http(e.to_string()))?;

        let body: OpenAiResponse = error_for_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ComposeError::Malformed(e.to_string()))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(ComposeError::Empty)?;

        non_empty(&content)
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    #[serde(default)]
    text: Option<String>,
}

/// Anthropic messages API
#[derive(Debug, Clone)]
pub struct AnthropicComposer {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicComposer {
    pub fn new(client: Client, api_key: String, model: String, base_url: String) -> Self {
        Self {
            client,
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl MessageComposer for AnthropicComposer {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn compose(&self, request: &ComposeRequest) -> Result<String, ComposeError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&json!({
                "model": self.model,
                "max_tokens": MAX_TOKENS,
                "messages": [{ "role": "user", "content": build_prompt(request) }],
            }))
            .send()
            .await
            .map_err(|e| ComposeError::Http(e.to_string()))?;

        let body: AnthropicResponse = error_for_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ComposeError::Malformed(e.to_string()))?;

        let text = body
            .content
            .into_iter()
            .find_map(|block| block.text)
            .ok_or(ComposeError::Empty)?;

        non_empty(&text)
    }
}

/// Pick the composer for a configuration
pub fn build_composer(
    config: &ComposerConfig,
    client: Client,
    payment_update_url: &str,
) -> Arc<dyn MessageComposer> {
    match config {
        ComposerConfig::OpenAi {
            api_key,
            model,
            base_url,
        } => Arc::new(OpenAiComposer::new(
            client,
            api_key.clone(),
            model.clone(),
            base_url.clone(),
        )),
        ComposerConfig::Anthropic {
            api_key,
            model,
            base_url,
        } => Arc::new(AnthropicComposer::new(
            client,
            api_key.clone(),
            model.clone(),
            base_url.clone(),
        )),
        ComposerConfig::Template => Arc::new(TemplateComposer::new(payment_update_url)),
    }
}
