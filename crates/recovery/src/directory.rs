//! Stripe-backed customer directory

use async_trait::async_trait;
use stripe::{Customer, CustomerId};

use crate::collaborators::CustomerDirectory;
use crate::error::{RecoveryError, RecoveryResult};

/// Reads the phone number stored on the Stripe customer object
#[derive(Clone)]
pub struct StripeCustomerDirectory {
    client: stripe::Client,
}

impl StripeCustomerDirectory {
    pub fn new(secret_key: &str) -> Self {
        Self {
            client: stripe::Client::new(secret_key),
        }
    }
}

#[async_trait]
impl CustomerDirectory for StripeCustomerDirectory {
    async fn lookup_phone(&self, customer_id: &str) -> RecoveryResult<Option<String>> {
        let id = customer_id.parse::<CustomerId>().map_err(|e| {
            RecoveryError::Validation(format!("Invalid customer ID '{}': {}", customer_id, e))
        })?;

        let customer = Customer::retrieve(&self.client, &id, &[])
            .await
            .map_err(|e| {
                RecoveryError::Collaborator(format!("Stripe customer lookup failed: {}", e))
            })?;

        Ok(customer.phone.filter(|p| !p.trim().is_empty()))
    }
}
