//! Twilio message delivery

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::collaborators::{DeliveryError, DeliveryReceipt, MessageDelivery};
use crate::config::TwilioConfig;
use crate::records::Channel;

/// Prefix a bare number with `+`
pub fn normalize_phone(phone: &str) -> String {
    let trimmed = phone.trim();
    if trimmed.starts_with('+') {
        trimmed.to_string()
    } else {
        format!("+{}", trimmed)
    }
}

#[derive(Debug, Deserialize)]
struct TwilioMessage {
    sid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TwilioErrorBody {
    message: Option<String>,
}

/// Sends WhatsApp and SMS messages through the Twilio Messages API
#[derive(Debug, Clone)]
pub struct TwilioDelivery {
    client: Client,
    config: TwilioConfig,
}

impl TwilioDelivery {
    pub fn new(client: Client, config: TwilioConfig) -> Self {
        Self { client, config }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.base_url.trim_end_matches('/'),
            self.config.account_sid
        )
    }

    fn addresses(&self, phone: &str, channel: Channel) -> (String, String) {
        let to = normalize_phone(phone);
        match channel {
            Channel::Whatsapp => (format!("whatsapp:{}", to), self.config.whatsapp_from.clone()),
            Channel::Sms => (to, self.config.sms_from.clone()),
        }
    }
}

#[async_trait]
impl MessageDelivery for TwilioDelivery {
    async fn send(
        &self,
        phone: &str,
        text: &str,
        channel: Channel,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let (to, from) = self.addresses(phone, channel);

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&[("To", to.as_str()), ("From", from.as_str()), ("Body", text)])
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<TwilioErrorBody>(&body)
                .ok()
                .and_then(|b| b.message)
                .unwrap_or(body);

            tracing::warn!(
                channel = %channel,
                status = status.as_u16(),
                error = %message,
                "Twilio rejected message"
            );
            return Err(DeliveryError::Rejected {
                channel,
                status: status.as_u16(),
                message,
            });
        }

        let sid = response
            .json::<TwilioMessage>()
            .await
            .ok()
            .and_then(|m| m.sid);

        tracing::info!(channel = %channel, to = %to, sid = ?sid, "Twilio accepted message");

        Ok(DeliveryReceipt {
            channel,
            provider_message_id: sid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn config(base_url: String) -> TwilioConfig {
        TwilioConfig {
            account_sid: "AC123".into(),
            auth_token: "token".into(),
            whatsapp_from: "whatsapp:+14155238886".into(),
            sms_from: "+14155238886".into(),
            base_url,
        }
    }

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("15551234567"), "+15551234567");
        assert_eq!(normalize_phone(" +15551234567 "), "+15551234567");
    }

    #[tokio::test]
    async fn test_whatsapp_uses_prefixed_numbers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/2010-04-01/Accounts/AC123/Messages.json")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("To".into(), "whatsapp:+15551234567".into()),
                Matcher::UrlEncoded("From".into(), "whatsapp:+14155238886".into()),
                Matcher::UrlEncoded("Body".into(), "hello".into()),
            ]))
            .with_status(201)
            .with_body(r#"{"sid":"SM1","status":"queued"}"#)
            .create_async()
            .await;

        let delivery = TwilioDelivery::new(Client::new(), config(server.url()));
        let receipt = delivery
            .send("15551234567", "hello", Channel::Whatsapp)
            .await
            .unwrap();

        assert_eq!(receipt.channel, Channel::Whatsapp);
        assert_eq!(receipt.provider_message_id.as_deref(), Some("SM1"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_sms_uses_plain_numbers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/2010-04-01/Accounts/AC123/Messages.json")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("To".into(), "+15551234567".into()),
                Matcher::UrlEncoded("From".into(), "+14155238886".into()),
            ]))
            .with_status(201)
            .with_body(r#"{"sid":"SM2"}"#)
            .create_async()
            .await;

        let delivery = TwilioDelivery::new(Client::new(), config(server.url()));
        let receipt = delivery
            .send("+15551234567", "hello", Channel::Sms)
            .await
            .unwrap();
        assert_eq!(receipt.channel, Channel::Sms);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_provider_rejection_is_rejected_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/2010-04-01/Accounts/AC123/Messages.json")
            .with_status(400)
            .with_body(r#"{"code":63016,"message":"Channel not available"}"#)
            .create_async()
            .await;

        let delivery = TwilioDelivery::new(Client::new(), config(server.url()));
        let err = delivery
            .send("+15551234567", "hello", Channel::Whatsapp)
            .await
            .unwrap_err();

        match err {
            DeliveryError::Rejected {
                channel,
                status,
                message,
            } => {
                assert_eq!(channel, Channel::Whatsapp);
                assert_eq!(status, 400);
                assert_eq!(message, "Channel not available");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_transport_error() {
        // Port 9 (discard) on localhost is not listening in test environments
        let delivery = TwilioDelivery::new(Client::new(), config("http://127.0.0.1:9".into()));
        let err = delivery
            .send("+15551234567", "hello", Channel::Sms)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Transport(_)));
    }
}
