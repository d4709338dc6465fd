use crate::database::get_database_stats;
use crate::models::{CliApp, Result};

impl CliApp {
    pub async fn show_database_stats(&self) -> Result<()> {
        let stats = get_database_stats(&self.db_pool).await?;

        println!("\n📊 Database Statistics");
        println!("───────────────────────────────────────");
        println!("Registered lists:      {}", stats.registered_lists);
        println!("Stored analyses:       {}", stats.stored_analyses);
        println!("Sharing aggregates:    {}", stats.sharing_lists);
        println!("Monthly updates:       {}", stats.monthly_lists);
        match stats.latest_analysis {
            Some(ts) => println!("Latest analysis:       {}", ts.format("%Y-%m-%d %H:%M UTC")),
            None => println!("Latest analysis:       (none yet)"),
        }

        Ok(())
    }
}
