pub mod cli;
mod run;
mod run_analyze_list;
mod run_monthly_reports;
mod run_sweep;
mod show_database_stats;
