use crate::models::{CliApp, Result};

impl CliApp {
    pub async fn run_monthly_reports(&self) -> Result<()> {
        self.analyzer.send_monthly_reports().await?;
        println!("✅ Monthly reports sent.");
        Ok(())
    }
}
