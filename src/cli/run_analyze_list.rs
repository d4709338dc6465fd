use dialoguer::{theme::ColorfulTheme, Confirm, Input};
use tracing::info;

use crate::models::{AnalysisRequest, CliApp, ListInfo, Result};

impl CliApp {
    /// Prompt for one list's credentials and preferences, then run the full
    /// analysis pipeline for it.
    pub async fn run_analyze_list(&self) -> Result<()> {
        let theme = ColorfulTheme::default();

        let list_id: String = Input::with_theme(&theme)
            .with_prompt("List ID")
            .interact_text()?;
        let list_name: String = Input::with_theme(&theme)
            .with_prompt("List name")
            .interact_text()?;
        let api_key: String = Input::with_theme(&theme)
            .with_prompt("MailChimp API key")
            .interact_text()?;
        let data_center: String = Input::with_theme(&theme)
            .with_prompt("Data center (e.g. us1)")
            .interact_text()?;
        let user_email: String = Input::with_theme(&theme)
            .with_prompt("Where should the report go?")
            .interact_text()?;

        let store_aggregates = Confirm::with_theme(&theme)
            .with_prompt("May this list's stats feed the cross-list average?")
            .default(true)
            .interact()?;
        let monthly_updates = Confirm::with_theme(&theme)
            .with_prompt("Send a monthly report for this list?")
            .default(false)
            .interact()?;
        let force_recompute = Confirm::with_theme(&theme)
            .with_prompt("Force a recompute even if recent stats exist?")
            .default(false)
            .interact()?;

        let request = AnalysisRequest {
            list: ListInfo {
                list_id,
                list_name,
                api_key,
                data_center,
                store_aggregates,
                monthly_updates,
            },
            user_email,
            force_recompute,
        };

        info!("Starting analysis for list {}", request.list.list_id);
        self.analyzer.init_list_analysis(&request).await?;
        println!("✅ Analysis complete, report sent.");
        Ok(())
    }
}
