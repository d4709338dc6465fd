use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::MailChimpConfig;
use crate::error::{ImportError, ImportStage};
use crate::models::ListInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Subscribed,
    Unsubscribed,
    Cleaned,
    Pending,
}

impl MemberStatus {
    fn from_api(s: &str) -> Option<Self> {
        match s {
            "subscribed" => Some(MemberStatus::Subscribed),
            "unsubscribed" => Some(MemberStatus::Unsubscribed),
            "cleaned" => Some(MemberStatus::Cleaned),
            "pending" => Some(MemberStatus::Pending),
            _ => None,
        }
    }
}

/// One roster member after merging the roster and activity fetches.
#[derive(Debug, Clone)]
pub struct MemberRecord {
    pub member_id: String,
    pub status: MemberStatus,
    pub open_rate: f64,
    pub last_open: Option<DateTime<Utc>>,
}

/// Raw import result for one list at one point in time. Consumed by the
/// statistics engine and discarded; nothing in here is persisted directly.
#[derive(Debug, Clone)]
pub struct ListSnapshot {
    pub list_id: String,
    pub list_name: String,
    pub member_count: i64,
    pub unsubscribe_count: i64,
    pub cleaned_count: i64,
    pub open_rate: f64,
    pub campaign_count: i64,
    pub creation_timestamp: DateTime<Utc>,
    pub members: Vec<MemberRecord>,
}

/// Seam for the external mailing-list API. The orchestrator only ever talks
/// to this trait so tests can substitute a scripted importer.
#[async_trait]
pub trait ListImporter: Send + Sync {
    async fn fetch_snapshot(
        &self,
        list: &ListInfo,
    ) -> std::result::Result<ListSnapshot, ImportError>;
}

#[derive(Debug, Deserialize)]
struct ApiListStats {
    member_count: Option<i64>,
    unsubscribe_count: Option<i64>,
    cleaned_count: Option<i64>,
    open_rate: Option<f64>,
    campaign_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ApiListMetadata {
    name: Option<String>,
    date_created: Option<String>,
    stats: Option<ApiListStats>,
}

#[derive(Debug, Deserialize)]
struct ApiMemberStats {
    avg_open_rate: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ApiMember {
    id: Option<String>,
    status: Option<String>,
    stats: Option<ApiMemberStats>,
}

#[derive(Debug, Deserialize)]
struct ApiMemberPage {
    members: Option<Vec<ApiMember>>,
    total_items: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ApiActivityEvent {
    action: Option<String>,
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiActivityFeed {
    activity: Option<Vec<ApiActivityEvent>>,
}

pub struct MailChimpClient {
    client: Client,
    config: MailChimpConfig,
}

impl MailChimpClient {
    pub fn new(config: MailChimpConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.api_timeout_seconds))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, config }
    }

    fn api_base(&self, data_center: &str) -> Result<Url, ImportError> {
        Url::parse(&format!("https://{}.api.mailchimp.com/3.0/", data_center)).map_err(|e| {
            ImportError::new(
                ImportStage::Metadata,
                format!("invalid data center '{}': {}", data_center, e),
            )
        })
    }

    /// GET a MailChimp resource. `Ok(None)` means the resource itself is
    /// missing (404); callers decide whether that is fatal for their stage.
    async fn get_json(
        &self,
        url: Url,
        api_key: &str,
        stage: ImportStage,
    ) -> Result<Option<serde_json::Value>, ImportError> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url.clone())
            .basic_auth("anystring", Some(api_key))
            .send()
            .await
            .map_err(|e| ImportError::new(stage, format!("request to {} failed: {}", url, e)))?;

        match response.status() {
            status if status.is_success() => {
                let body = response.json().await.map_err(|e| {
                    ImportError::new(stage, format!("malformed response from {}: {}", url, e))
                })?;
                Ok(Some(body))
            }
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(ImportError::new(stage, "API key was rejected by MailChimp."))
            }
            status => Err(ImportError::new(
                stage,
                format!("unexpected status {} from {}", status, url),
            )),
        }
    }

    /// Fetch list name, creation date and the API-reported totals. The
    /// subscriber total and overall open rate are authoritative here; only
    /// the API sees campaign-level send/open denominators.
    async fn fetch_metadata(&self, list: &ListInfo) -> Result<ListSnapshot, ImportError> {
        let mut url = self
            .api_base(&list.data_center)?
            .join(&format!("lists/{}", list.list_id))
            .map_err(|e| ImportError::new(ImportStage::Metadata, e.to_string()))?;
        url.query_pairs_mut().append_pair(
            "fields",
            "name,date_created,stats.member_count,stats.unsubscribe_count,\
             stats.cleaned_count,stats.open_rate,stats.campaign_count",
        );

        let body = self
            .get_json(url, &list.api_key, ImportStage::Metadata)
            .await?
            .ok_or_else(|| {
                ImportError::new(
                    ImportStage::Metadata,
                    "API key is no longer valid or list no longer exists.",
                )
            })?;
        let metadata: ApiListMetadata = serde_json::from_value(body)
            .map_err(|e| ImportError::new(ImportStage::Metadata, e.to_string()))?;

        let missing =
            |field: &str| ImportError::new(ImportStage::Metadata, format!("missing {}", field));

        let stats = metadata.stats.ok_or_else(|| missing("stats"))?;
        let date_created = metadata
            .date_created
            .ok_or_else(|| missing("date_created"))?;
        let creation_timestamp = DateTime::parse_from_rfc3339(&date_created)
            .map_err(|e| {
                ImportError::new(
                    ImportStage::Metadata,
                    format!("bad date_created '{}': {}", date_created, e),
                )
            })?
            .with_timezone(&Utc);

        Ok(ListSnapshot {
            list_id: list.list_id.clone(),
            list_name: metadata.name.unwrap_or_else(|| list.list_name.clone()),
            member_count: stats.member_count.ok_or_else(|| missing("member_count"))?,
            unsubscribe_count: stats
                .unsubscribe_count
                .ok_or_else(|| missing("unsubscribe_count"))?,
            cleaned_count: stats.cleaned_count.ok_or_else(|| missing("cleaned_count"))?,
            open_rate: stats.open_rate.ok_or_else(|| missing("open_rate"))?,
            campaign_count: stats
                .campaign_count
                .ok_or_else(|| missing("campaign_count"))?,
            creation_timestamp,
            members: Vec::new(),
        })
    }

    /// Pull the full member roster, one page at a time.
    async fn fetch_roster(&self, list: &ListInfo) -> Result<Vec<MemberRecord>, ImportError> {
        let page_size = self.config.members_page_size.max(1);
        let mut members = Vec::new();
        let mut offset = 0usize;

        loop {
            let mut url = self
                .api_base(&list.data_center)?
                .join(&format!("lists/{}/members", list.list_id))
                .map_err(|e| ImportError::new(ImportStage::Roster, e.to_string()))?;
            url.query_pairs_mut()
                .append_pair("count", &page_size.to_string())
                .append_pair("offset", &offset.to_string())
                .append_pair(
                    "fields",
                    "members.id,members.status,members.stats.avg_open_rate,total_items",
                );

            let body = self
                .get_json(url, &list.api_key, ImportStage::Roster)
                .await?
                .ok_or_else(|| {
                    ImportError::new(ImportStage::Roster, "list no longer exists.")
                })?;
            let page: ApiMemberPage = serde_json::from_value(body)
                .map_err(|e| ImportError::new(ImportStage::Roster, e.to_string()))?;

            let total = page
                .total_items
                .ok_or_else(|| ImportError::new(ImportStage::Roster, "missing total_items"))?;
            let page_members = page
                .members
                .ok_or_else(|| ImportError::new(ImportStage::Roster, "missing members"))?;
            let fetched = page_members.len();

            for member in page_members {
                let member_id = member
                    .id
                    .ok_or_else(|| ImportError::new(ImportStage::Roster, "member without id"))?;
                let status_str = member.status.ok_or_else(|| {
                    ImportError::new(
                        ImportStage::Roster,
                        format!("member {} without status", member_id),
                    )
                })?;
                let Some(status) = MemberStatus::from_api(&status_str) else {
                    // Archived/transactional members don't take part in the
                    // four-way breakdown.
                    warn!(
                        "Skipping member {} with unhandled status '{}'",
                        member_id, status_str
                    );
                    continue;
                };
                let open_rate = member
                    .stats
                    .and_then(|s| s.avg_open_rate)
                    .unwrap_or(0.0)
                    .clamp(0.0, 1.0);
                members.push(MemberRecord {
                    member_id,
                    status,
                    open_rate,
                    last_open: None,
                });
            }

            offset += fetched;
            if offset as i64 >= total || fetched == 0 {
                if (offset as i64) < total {
                    return Err(ImportError::new(
                        ImportStage::Roster,
                        format!("roster incomplete: got {} of {} members", offset, total),
                    ));
                }
                break;
            }
        }

        Ok(members)
    }

    /// Merge per-member activity into the roster. A member with no activity
    /// feed keeps `last_open = None`.
    async fn fetch_activity(
        &self,
        list: &ListInfo,
        members: &mut [MemberRecord],
    ) -> Result<(), ImportError> {
        for member in members.iter_mut() {
            let mut url = self
                .api_base(&list.data_center)?
                .join(&format!(
                    "lists/{}/members/{}/activity",
                    list.list_id, member.member_id
                ))
                .map_err(|e| ImportError::new(ImportStage::Activity, e.to_string()))?;
            url.query_pairs_mut()
                .append_pair("fields", "activity.action,activity.timestamp");

            // A member present in the roster but unknown to the activity
            // endpoint counts as "no opens", not a failed import.
            let Some(body) = self
                .get_json(url, &list.api_key, ImportStage::Activity)
                .await?
            else {
                debug!("No activity feed for member {}", member.member_id);
                continue;
            };

            let feed: ApiActivityFeed = serde_json::from_value(body)
                .map_err(|e| ImportError::new(ImportStage::Activity, e.to_string()))?;

            member.last_open = feed
                .activity
                .unwrap_or_default()
                .iter()
                .filter(|event| event.action.as_deref() == Some("open"))
                .filter_map(|event| event.timestamp.as_deref())
                .filter_map(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|ts| ts.with_timezone(&Utc))
                .max();
        }
        Ok(())
    }
}

#[async_trait]
impl ListImporter for MailChimpClient {
    async fn fetch_snapshot(
        &self,
        list: &ListInfo,
    ) -> std::result::Result<ListSnapshot, ImportError> {
        info!("Importing list {} ({})", list.list_id, list.list_name);

        let mut snapshot = self.fetch_metadata(list).await?;
        let mut members = self.fetch_roster(list).await?;
        info!(
            "Fetched roster of {} members for list {}",
            members.len(),
            list.list_id
        );

        self.fetch_activity(list, &mut members).await?;
        snapshot.members = members;

        Ok(snapshot)
    }
}
