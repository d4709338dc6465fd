use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, error, info};

use crate::models::Result;

/// Seam for the email-delivery collaborator. The pipeline only knows
/// send(subject, recipients, template, context); transport details live
/// behind the trait.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(
        &self,
        subject: &str,
        recipients: &[String],
        template: &str,
        context: &Value,
        configuration_set: Option<&str>,
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct MailgunConfig {
    pub api_key: String,
    pub domain: String,
    pub from_email: String,
    pub from_name: String,
    pub base_url: String,
}

impl MailgunConfig {
    pub fn from_env() -> Result<Self> {
        Ok(MailgunConfig {
            api_key: std::env::var("MAILGUN_API_KEY")
                .map_err(|_| "MAILGUN_API_KEY environment variable required")?,
            domain: std::env::var("MAILGUN_DOMAIN")
                .map_err(|_| "MAILGUN_DOMAIN environment variable required")?,
            from_email: std::env::var("FROM_EMAIL")
                .unwrap_or_else(|_| "reports@benchmarks.example".to_string()),
            from_name: std::env::var("FROM_NAME")
                .unwrap_or_else(|_| "Email Benchmarks".to_string()),
            base_url: "https://api.mailgun.net/v3".to_string(),
        })
    }
}

pub struct MailgunMailer {
    config: MailgunConfig,
    client: Client,
}

impl MailgunMailer {
    pub fn new(config: MailgunConfig) -> Self {
        let client = Client::new();
        debug!("Created MailgunMailer for domain: {}", config.domain);
        Self { config, client }
    }
}

#[async_trait]
impl Mailer for MailgunMailer {
    async fn send(
        &self,
        subject: &str,
        recipients: &[String],
        template: &str,
        context: &Value,
        configuration_set: Option<&str>,
    ) -> Result<()> {
        let url = format!("{}/{}/messages", self.config.base_url, self.config.domain);
        debug!("Preparing '{}' email to {} recipient(s)", template, recipients.len());

        let mut form_data = HashMap::new();
        form_data.insert(
            "from",
            format!("{} <{}>", self.config.from_name, self.config.from_email),
        );
        form_data.insert("to", recipients.join(", "));
        form_data.insert("subject", subject.to_string());
        form_data.insert("template", template.to_string());
        form_data.insert("h:X-Mailgun-Variables", context.to_string());
        if let Some(set) = configuration_set {
            form_data.insert("o:tag", set.to_string());
        }

        let response = self
            .client
            .post(&url)
            .basic_auth("api", Some(&self.config.api_key))
            .form(&form_data)
            .send()
            .await?;

        debug!("Mailgun response status: {}", response.status());

        if response.status().is_success() {
            info!("Sent '{}' email to {}", template, recipients.join(", "));
            Ok(())
        } else {
            let error_text = response.text().await?;
            error!("Mailgun API error: {}", error_text);
            Err(format!("Mailgun error: {}", error_text).into())
        }
    }
}

/// Dev fallback used when Mailgun credentials are absent: logs the message
/// instead of delivering it.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(
        &self,
        subject: &str,
        recipients: &[String],
        template: &str,
        context: &Value,
        _configuration_set: Option<&str>,
    ) -> Result<()> {
        info!(
            "[dry-run] '{}' ({}) to {}: {}",
            subject,
            template,
            recipients.join(", "),
            context
        );
        Ok(())
    }
}
