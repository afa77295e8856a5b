//! External collaborators
//!
//! Narrow interfaces the pipeline calls out to. Real implementations live in
//! `composer`, `delivery` and `directory`; the pass-through defaults here
//! match what a deployment without those integrations gets.

use async_trait::async_trait;
use thiserror::Error;

use crate::error::RecoveryResult;
use crate::records::Channel;

/// Input for message composition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeRequest {
    pub customer_name: String,
    /// Major units, e.g. `"49.99"`
    pub amount: String,
    /// Uppercase code, e.g. `"USD"`
    pub currency: String,
}

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("composer request failed: {0}")]
    Http(String),

    #[error("composer returned HTTP {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("composer response malformed: {0}")]
    Malformed(String),

    #[error("composer returned an empty message")]
    Empty,
}

/// Writes the recovery message text
#[async_trait]
pub trait MessageComposer: Send + Sync {
    /// Short provider name for logs
    fn name(&self) -> &'static str;

    async fn compose(&self, request: &ComposeRequest) -> Result<String, ComposeError>;
}

/// What the messaging provider accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub channel: Channel,
    pub provider_message_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The provider answered and refused the message
    #[error("provider rejected {channel} message (HTTP {status}): {message}")]
    Rejected {
        channel: Channel,
        status: u16,
        message: String,
    },

    /// The provider could not be reached
    #[error("transport error: {0}")]
    Transport(String),
}

/// Sends a message on one channel
#[async_trait]
pub trait MessageDelivery: Send + Sync {
    async fn send(
        &self,
        phone: &str,
        text: &str,
        channel: Channel,
    ) -> Result<DeliveryReceipt, DeliveryError>;
}

/// Finds a phone number for a provider customer
#[async_trait]
pub trait CustomerDirectory: Send + Sync {
    async fn lookup_phone(&self, customer_id: &str) -> RecoveryResult<Option<String>>;
}

/// Decides whether a customer is still using the product
#[async_trait]
pub trait AccountActivity: Send + Sync {
    async fn is_active(&self, customer_id: &str) -> RecoveryResult<bool>;
}

/// Treats every account as active
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeActive;

#[async_trait]
impl AccountActivity for AssumeActive {
    async fn is_active(&self, _customer_id: &str) -> RecoveryResult<bool> {
        Ok(true)
    }
}

/// Directory with no entries
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDirectory;

#[async_trait]
impl CustomerDirectory for NoDirectory {
    async fn lookup_phone(&self, _customer_id: &str) -> RecoveryResult<Option<String>> {
        Ok(None)
    }
}
