use dialoguer::{theme::ColorfulTheme, Select};

use crate::{
    cli::cli::MenuAction,
    models::{CliApp, Result},
};
use tracing::error;

impl CliApp {
    pub async fn run(&self) -> Result<()> {
        println!("\n📬 Welcome to Email List Benchmarks!");
        println!("═══════════════════════════════════════");

        self.show_database_stats().await?;

        loop {
            let actions = vec![
                MenuAction::AnalyzeList,
                MenuAction::RunSweep,
                MenuAction::SendMonthlyReports,
                MenuAction::ShowStats,
                MenuAction::Exit,
            ];

            let selection = Select::with_theme(&ColorfulTheme::default())
                .with_prompt("\nSelect an action")
                .default(0)
                .items(&actions)
                .interact()?;

            match &actions[selection] {
                MenuAction::AnalyzeList => {
                    if let Err(e) = self.run_analyze_list().await {
                        error!("List analysis failed: {}", e);
                    }
                }
                MenuAction::RunSweep => {
                    if let Err(e) = self.run_sweep().await {
                        error!("Sweep failed: {}", e);
                    }
                }
                MenuAction::SendMonthlyReports => {
                    if let Err(e) = self.run_monthly_reports().await {
                        error!("Monthly reports failed: {}", e);
                    }
                }
                MenuAction::ShowStats => {
                    if let Err(e) = self.show_database_stats().await {
                        error!("Failed to show stats: {}", e);
                    }
                }
                MenuAction::Exit => {
                    println!("\n👋 Bye!");
                    break;
                }
            }
        }

        Ok(())
    }
}
