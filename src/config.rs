use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub mailchimp: MailChimpConfig,
    pub analysis: AnalysisConfig,
    pub logging: LoggingConfig,
    pub output: OutputConfig,
    pub email: EmailConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MailChimpConfig {
    pub api_timeout_seconds: u64,
    pub members_page_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalysisConfig {
    /// Stored stats younger than this are reused instead of recomputed.
    pub staleness_days: i64,
    pub high_open_rate_threshold: f64,
    pub inactive_window_days: i64,
    pub histogram_bins: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    pub directory: String,
    pub pretty_json: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmailConfig {
    /// Administrative contact copied on import-failure notifications.
    pub admin_email: Option<String>,
    pub configuration_set: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mailchimp: MailChimpConfig {
                api_timeout_seconds: 10,
                members_page_size: 1000,
            },
            analysis: AnalysisConfig {
                staleness_days: 30,
                high_open_rate_threshold: 0.8,
                inactive_window_days: 365,
                histogram_bins: 10,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
            output: OutputConfig {
                directory: "out".to_string(),
                pretty_json: true,
            },
            email: EmailConfig {
                admin_email: None,
                configuration_set: None,
            },
        }
    }
}

pub async fn load_config(
    path: &str,
) -> std::result::Result<Config, Box<dyn std::error::Error + Send + Sync>> {
    let content = tokio::fs::read_to_string(path).await?;
    let config: Config = serde_yaml::from_str(&content)?;
    Ok(config)
}
