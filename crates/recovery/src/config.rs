//! Recovery configuration
//!
//! Built once at startup and handed to the collaborators; nothing below
//! reads the environment on its own.

use std::time::Duration;

use crate::error::{RecoveryError, RecoveryResult};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-haiku-20240307";
pub const DEFAULT_TWILIO_BASE_URL: &str = "https://api.twilio.com";
pub const DEFAULT_TWILIO_WHATSAPP_FROM: &str = "whatsapp:+14155238886";
pub const DEFAULT_TWILIO_SMS_FROM: &str = "+14155238886";
pub const DEFAULT_PAYMENT_UPDATE_URL: &str = "[payment link]";
pub const DEFAULT_COMPOSER_TIMEOUT_MS: u64 = 8_000;

/// Which language model writes the recovery message
#[derive(Debug, Clone)]
pub enum ComposerConfig {
    OpenAi {
        api_key: String,
        model: String,
        base_url: String,
    },
    Anthropic {
        api_key: String,
        model: String,
        base_url: String,
    },
    /// No provider configured; the fixed template is always used
    Template,
}

impl ComposerConfig {
    pub fn name(&self) -> &'static str {
        match self {
            ComposerConfig::OpenAi { .. } => "openai",
            ComposerConfig::Anthropic { .. } => "anthropic",
            ComposerConfig::Template => "template",
        }
    }
}

/// Twilio credentials and sender numbers
#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub whatsapp_from: String,
    pub sms_from: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub composer: ComposerConfig,
    pub composer_timeout: Duration,
    pub twilio: TwilioConfig,
    /// Enables the Stripe-backed customer directory
    pub stripe_secret_key: Option<String>,
    /// Link placed in the fallback template
    pub payment_update_url: String,
}

impl RecoveryConfig {
    /// Load from environment variables
    pub fn from_env() -> RecoveryResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary lookup; empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> RecoveryResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let composer = if let Some(api_key) = get("OPENAI_API_KEY") {
            ComposerConfig::OpenAi {
                api_key,
                model: get("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
                base_url: get("OPENAI_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            }
        } else if let Some(api_key) = get("ANTHROPIC_API_KEY") {
            ComposerConfig::Anthropic {
                api_key,
                model: get("ANTHROPIC_MODEL")
                    .unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.to_string()),
                base_url: get("ANTHROPIC_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_ANTHROPIC_BASE_URL.to_string()),
            }
        } else {
            ComposerConfig::Template
        };

        let composer_timeout_ms = match get("COMPOSER_TIMEOUT_MS") {
            Some(raw) => raw.parse::<u64>().map_err(|e| {
                RecoveryError::Config(format!("COMPOSER_TIMEOUT_MS is not a number: {}", e))
            })?,
            None => DEFAULT_COMPOSER_TIMEOUT_MS,
        };

        let account_sid = get("TWILIO_ACCOUNT_SID")
            .ok_or_else(|| RecoveryError::Config("TWILIO_ACCOUNT_SID must be set".to_string()))?;
        let auth_token = get("TWILIO_AUTH_TOKEN")
            .ok_or_else(|| RecoveryError::Config("TWILIO_AUTH_TOKEN must be set".to_string()))?;

        Ok(Self {
            composer,
            composer_timeout: Duration::from_millis(composer_timeout_ms),
            twilio: TwilioConfig {
                account_sid,
                auth_token,
                whatsapp_from: get("TWILIO_WHATSAPP_NUMBER")
                    .unwrap_or_else(|| DEFAULT_TWILIO_WHATSAPP_FROM.to_string()),
                sms_from: get("TWILIO_SMS_NUMBER")
                    .unwrap_or_else(|| DEFAULT_TWILIO_SMS_FROM.to_string()),
                base_url: get("TWILIO_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_TWILIO_BASE_URL.to_string()),
            },
            stripe_secret_key: get("STRIPE_SECRET_KEY"),
            payment_update_url: get("PAYMENT_UPDATE_URL")
                .unwrap_or_else(|| DEFAULT_PAYMENT_UPDATE_URL.to_string()),
        })
    }
}
