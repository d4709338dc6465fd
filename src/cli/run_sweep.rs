use tracing::info;

use crate::models::{CliApp, Result};

impl CliApp {
    /// Entry point for the scheduled sweep: recompute every list whose
    /// stored stats fell out of the staleness window.
    pub async fn run_sweep(&self) -> Result<()> {
        info!(
            "Running sweep (staleness window: {} days)",
            self.config.analysis.staleness_days
        );
        self.analyzer.update_stored_data().await?;
        println!("✅ Sweep complete.");
        Ok(())
    }
}
