use std::sync::Arc;
use tracing::warn;

use crate::analysis::ListAnalyzer;
use crate::config::Config;
use crate::database::DbPool;
use crate::mailchimp::MailChimpClient;
use crate::mailer::{LogMailer, Mailer, MailgunConfig, MailgunMailer};
use crate::models::{CliApp, Result};
use crate::report::ChartSpecWriter;

#[derive(Debug, Clone)]
pub enum MenuAction {
    AnalyzeList,
    RunSweep,
    SendMonthlyReports,
    ShowStats,
    Exit,
}

impl std::fmt::Display for MenuAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MenuAction::AnalyzeList => {
                write!(f, "📊 Analyze a mailing list and email the report")
            }
            MenuAction::RunSweep => {
                write!(f, "🔄 Sweep: recompute all stale lists")
            }
            MenuAction::SendMonthlyReports => {
                write!(f, "📧 Send monthly reports from stored stats")
            }
            MenuAction::ShowStats => write!(f, "🗄️  Show database statistics"),
            MenuAction::Exit => write!(f, "🚪 Exit"),
        }
    }
}

impl CliApp {
    pub async fn new(config: Config, db_pool: DbPool) -> Result<Self> {
        let importer = Arc::new(MailChimpClient::new(config.mailchimp.clone()));
        let renderer = Arc::new(ChartSpecWriter::new(
            config.output.directory.clone(),
            config.output.pretty_json,
        ));

        let mailer: Arc<dyn Mailer> = match MailgunConfig::from_env() {
            Ok(mailgun) => Arc::new(MailgunMailer::new(mailgun)),
            Err(e) => {
                warn!("Mailgun not configured ({}), logging emails instead", e);
                Arc::new(LogMailer)
            }
        };

        let analyzer = Arc::new(ListAnalyzer::new(
            config.clone(),
            db_pool.clone(),
            importer,
            renderer,
            mailer,
        ));

        Ok(Self {
            config,
            db_pool,
            analyzer,
        })
    }
}
