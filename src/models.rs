use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{analysis::ListAnalyzer, config::Config, database::DbPool};

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Everything a user submits (or we have stored) about one mailing list:
/// identity, credential, region, and the two sharing permissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListInfo {
    pub list_id: String,
    pub list_name: String,
    pub api_key: String,
    pub data_center: String,
    pub store_aggregates: bool,
    pub monthly_updates: bool,
}

/// A single interactive analysis request for one list.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub list: ListInfo,
    pub user_email: String,
    pub force_recompute: bool,
}

pub struct CliApp {
    pub config: Config,
    pub db_pool: DbPool,
    pub analyzer: Arc<ListAnalyzer>,
}
