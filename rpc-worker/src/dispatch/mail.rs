//! Mail-sending collaborator.

use std::future::Future;

use reqwest::Client;
use tracing::info;

use crate::config::Config;
use crate::error::MailError;

/// Something that can deliver a plain-text email.
pub trait Mailer: Send + Sync + 'static {
    fn send(
        &self,
        from: &str,
        to: &[String],
        subject: &str,
        body: &str,
    ) -> impl Future<Output = Result<(), MailError>> + Send;
}

/// Mailgun messages API client.
#[derive(Clone)]
pub struct MailgunMailer {
    client: Client,
    base_url: String,
    domain: Option<String>,
    api_key: Option<String>,
}

impl MailgunMailer {
    pub fn new(client: Client, base_url: String, domain: Option<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            domain,
            api_key,
        }
    }

    pub fn from_config(client: Client, config: &Config) -> Self {
        Self::new(
            client,
            config.mailgun_base_url.clone(),
            config.mailgun_domain.clone(),
            config.mailgun_api_key.clone(),
        )
    }

    fn messages_url(&self, domain: &str) -> String {
        format!("{}/v3/{}/messages", self.base_url, domain)
    }
}

impl Mailer for MailgunMailer {
    async fn send(&self, from: &str, to: &[String], subject: &str, body: &str) -> Result<(), MailError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(MailError::NotConfigured("MAILGUN_API_KEY"))?;
        let domain = self
            .domain
            .as_deref()
            .ok_or(MailError::NotConfigured("MAILGUN_DOMAIN"))?;

        let mut form: Vec<(&str, &str)> = vec![("from", from), ("subject", subject), ("text", body)];
        form.extend(to.iter().map(|recipient| ("to", recipient.as_str())));

        let response = self
            .client
            .post(self.messages_url(domain))
            .basic_auth("api", Some(api_key))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        info!(
            recipients = to.len(),
            subject_length = subject.len(),
            status_code = status.as_u16(),
            "mail_sent"
        );

        Ok(())
    }
}
