//! Mail transports available to the agent binary.

use async_trait::async_trait;
use buildfarm_core::{Error, Result};
use buildfarm_scheduler::{Mail, MailTransport};
use tracing::info;
use url::Url;

/// Posts each mail as JSON to a relay endpoint.
pub struct WebhookTransport {
    client: reqwest::Client,
    endpoint: Url,
}

impl WebhookTransport {
    pub fn new(endpoint: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl MailTransport for WebhookTransport {
    async fn send(&self, mail: &Mail) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(mail)
            .send()
            .await
            .map_err(|e| Error::Notification(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Notification(format!(
                "Mail relay returned {} for '{}'",
                response.status(),
                mail.subject
            )));
        }
        Ok(())
    }
}

/// Writes mail to the log instead of sending it.
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn send(&self, mail: &Mail) -> Result<()> {
        info!(
            to = %mail.to.join(";"),
            cc = %mail.cc.join(";"),
            subject = %mail.subject,
            "No mail relay configured; mail not sent"
        );
        Ok(())
    }
}
