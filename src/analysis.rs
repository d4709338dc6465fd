use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::aggregates::generate_summary_stats;
use crate::config::Config;
use crate::database::{self, DbPool, StoredListStats};
use crate::error::ImportError;
use crate::mailchimp::ListImporter;
use crate::mailer::Mailer;
use crate::models::{AnalysisRequest, ListInfo, Result};
use crate::report::{ChartRenderer, ReportComposer};
use crate::stats;

/// Drives one list's analysis end to end: freshness check, import, compute,
/// persist, compare, report. All collaborators are injected; there is no
/// ambient global state.
pub struct ListAnalyzer {
    config: Config,
    db_pool: DbPool,
    importer: Arc<dyn ListImporter>,
    mailer: Arc<dyn Mailer>,
    composer: ReportComposer,
    // Two overlapping sweeps must not double-process a list.
    sweep_lock: Mutex<()>,
}

impl ListAnalyzer {
    pub fn new(
        config: Config,
        db_pool: DbPool,
        importer: Arc<dyn ListImporter>,
        renderer: Arc<dyn ChartRenderer>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let composer = ReportComposer::new(
            renderer,
            mailer.clone(),
            config.email.configuration_set.clone(),
        );
        Self {
            config,
            db_pool,
            importer,
            mailer,
            composer,
            sweep_lock: Mutex::new(()),
        }
    }

    fn is_fresh(&self, analysis_timestamp: DateTime<Utc>) -> bool {
        Utc::now() - analysis_timestamp < Duration::days(self.config.analysis.staleness_days)
    }

    /// Interactive entry point: analyze one list for one requesting user and
    /// email them the report.
    pub async fn init_list_analysis(&self, request: &AnalysisRequest) -> Result<()> {
        let list = &request.list;
        let recent = database::latest_analyses(&self.db_pool, &list.list_id, 2).await?;

        let reusable = recent
            .first()
            .map(|latest| self.is_fresh(latest.analysis_timestamp))
            .unwrap_or(false);

        let analyses = if reusable && !request.force_recompute {
            info!(
                "Reusing stored stats for list {} (analyzed {})",
                list.list_id,
                recent[0].analysis_timestamp
            );
            recent
        } else {
            self.import_analyze_store_list(list, Some(&request.user_email))
                .await?;
            database::latest_analyses(&self.db_pool, &list.list_id, 2).await?
        };

        self.reconcile_config(list, &request.user_email).await?;

        let analysis_ids: Vec<i64> = analyses.iter().map(|a| a.id).collect();
        let (list_stats, agg_stats) =
            generate_summary_stats(&self.db_pool, &analysis_ids).await?;

        let hist_bin_counts = analyses
            .first()
            .map(|a| a.calculations.hist_bin_counts.clone())
            .unwrap_or_default();

        self.composer
            .send_report(
                &list_stats,
                &agg_stats,
                &hist_bin_counts,
                &list.list_id,
                &list.list_name,
                &[request.user_email.clone()],
            )
            .await
    }

    /// Import one list, run the statistics engine, and persist the result as
    /// a new row. On import failure the requester (and admin contact, when
    /// configured) is notified and the error re-raised; nothing is persisted.
    pub async fn import_analyze_store_list(
        &self,
        list: &ListInfo,
        user_email: Option<&str>,
    ) -> Result<StoredListStats> {
        let snapshot = match self.importer.fetch_snapshot(list).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Error importing list {}: {}", list.list_id, e);
                self.notify_import_failure(list, user_email, &e).await;
                return Err(e.into());
            }
        };

        let now = Utc::now();
        let calculations = stats::calculate(&snapshot, now, &self.config.analysis);
        debug!(
            "Computed stats for list {}: {} subscribers, open rate {}",
            list.list_id, calculations.subscribers, calculations.open_rate
        );

        // The stats row references the list config, so the config row has to
        // exist first.
        database::upsert_email_list(&self.db_pool, list).await?;
        let id =
            database::insert_list_stats(&self.db_pool, &list.list_id, now, &calculations).await?;

        Ok(StoredListStats {
            id,
            list_id: list.list_id.clone(),
            analysis_timestamp: now,
            calculations,
        })
    }

    /// Overwrite stored permissions with the submitted ones and make sure
    /// the requesting user is associated with the list.
    async fn reconcile_config(&self, list: &ListInfo, user_email: &str) -> Result<()> {
        if let Some(stored) = database::get_email_list(&self.db_pool, &list.list_id).await? {
            if stored.store_aggregates != list.store_aggregates
                || stored.monthly_updates != list.monthly_updates
            {
                info!(
                    "Updating permissions for list {}: store_aggregates {} -> {}, monthly_updates {} -> {}",
                    list.list_id,
                    stored.store_aggregates,
                    list.store_aggregates,
                    stored.monthly_updates,
                    list.monthly_updates
                );
            }
        }
        database::upsert_email_list(&self.db_pool, list).await?;
        database::associate_user_with_list(&self.db_pool, user_email, &list.list_id).await?;
        Ok(())
    }

    async fn notify_import_failure(
        &self,
        list: &ListInfo,
        user_email: Option<&str>,
        error: &ImportError,
    ) {
        let Some(user_email) = user_email else {
            return;
        };
        let mut recipients = vec![user_email.to_string()];
        if let Some(admin) = &self.config.email.admin_email {
            recipients.push(admin.clone());
        }
        let context = json!({
            "title": format!("We couldn't analyze the {} list", list.list_name),
            "error_details": error.detail,
        });
        if let Err(e) = self
            .mailer
            .send(
                "We Couldn't Analyze Your List",
                &recipients,
                "error-email",
                &context,
                self.config.email.configuration_set.as_deref(),
            )
            .await
        {
            // The import failure is the primary error; a failed notification
            // only gets logged.
            error!(
                "Failed to send import-failure notification for list {}: {}",
                list.list_id, e
            );
        }
    }

    /// Scheduled sweep: recompute every registered list whose latest
    /// analysis fell out of the staleness window. Sequential; the first list
    /// that fails importing or storing aborts the remainder of the pass.
    /// Lists with monthly updates enabled get a report at the end.
    pub async fn update_stored_data(&self) -> Result<()> {
        let _guard = self.sweep_lock.lock().await;

        if database::count_registered_lists(&self.db_pool).await? == 0 {
            warn!("No lists in the database!");
            return Ok(());
        }

        let cutoff = Utc::now() - Duration::days(self.config.analysis.staleness_days);
        let stale = database::stale_lists(&self.db_pool, cutoff).await?;
        if stale.is_empty() {
            info!("No old lists to update");
            return Ok(());
        }

        info!("Updating {} stale list(s)", stale.len());
        let mut touched = Vec::new();
        for list in &stale {
            match self.import_analyze_store_list(list, None).await {
                Ok(_) => touched.push(list.clone()),
                Err(e) => {
                    error!("Error updating list {}. Aborting sweep: {}", list.list_id, e);
                    return Err(e);
                }
            }
        }

        for list in touched.iter().filter(|l| l.monthly_updates) {
            self.email_stored_report(list).await?;
        }

        Ok(())
    }

    /// Send an updated report to every list that asked for monthly updates,
    /// from stored history alone.
    pub async fn send_monthly_reports(&self) -> Result<()> {
        for list in database::monthly_update_lists(&self.db_pool).await? {
            self.email_stored_report(&list).await?;
        }
        Ok(())
    }

    async fn email_stored_report(&self, list: &ListInfo) -> Result<()> {
        let recipients = database::list_recipients(&self.db_pool, &list.list_id).await?;
        if recipients.is_empty() {
            warn!(
                "List {} has monthly updates enabled but no associated users",
                list.list_id
            );
            return Ok(());
        }

        let analyses = database::latest_analyses(&self.db_pool, &list.list_id, 2).await?;
        if analyses.is_empty() {
            warn!("List {} has no stored analyses to report on", list.list_id);
            return Ok(());
        }

        info!(
            "Emailing {} an updated report. List: {} ({}).",
            recipients.join(", "),
            list.list_name,
            list.list_id
        );

        let analysis_ids: Vec<i64> = analyses.iter().map(|a| a.id).collect();
        let (list_stats, agg_stats) =
            generate_summary_stats(&self.db_pool, &analysis_ids).await?;
        self.composer
            .send_report(
                &list_stats,
                &agg_stats,
                &analyses[0].calculations.hist_bin_counts,
                &list.list_id,
                &list.list_name,
                &recipients,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::*;
    use crate::error::ImportStage;
    use crate::mailchimp::ListSnapshot;
    use crate::report::test_support::{RecordingMailer, RecordingRenderer};
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    struct MockImporter {
        calls: StdMutex<Vec<String>>,
        fail_lists: HashSet<String>,
    }

    impl MockImporter {
        fn new(fail_lists: &[&str]) -> Self {
            Self {
                calls: StdMutex::new(Vec::new()),
                fail_lists: fail_lists.iter().map(|s| s.to_string()).collect(),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ListImporter for MockImporter {
        async fn fetch_snapshot(
            &self,
            list: &ListInfo,
        ) -> std::result::Result<ListSnapshot, ImportError> {
            self.calls.lock().unwrap().push(list.list_id.clone());
            if self.fail_lists.contains(&list.list_id) {
                return Err(ImportError::new(
                    ImportStage::Metadata,
                    "API key is no longer valid or list no longer exists.",
                ));
            }
            Ok(ListSnapshot {
                list_id: list.list_id.clone(),
                list_name: list.list_name.clone(),
                member_count: 90,
                unsubscribe_count: 8,
                cleaned_count: 2,
                open_rate: 21.5,
                campaign_count: 10,
                creation_timestamp: Utc::now() - Duration::weeks(20),
                members: Vec::new(),
            })
        }
    }

    struct Harness {
        pool: DbPool,
        importer: Arc<MockImporter>,
        mailer: Arc<RecordingMailer>,
        analyzer: ListAnalyzer,
        _dir: tempfile::TempDir,
    }

    async fn harness(fail_lists: &[&str]) -> Harness {
        let (pool, dir) = test_pool().await;
        let importer = Arc::new(MockImporter::new(fail_lists));
        let mailer = Arc::new(RecordingMailer::default());
        let renderer = Arc::new(RecordingRenderer::default());
        let mut config = Config::default();
        config.email.admin_email = Some("admin@benchmarks.example".to_string());
        let analyzer = ListAnalyzer::new(
            config,
            pool.clone(),
            importer.clone(),
            renderer,
            mailer.clone(),
        );
        Harness {
            pool,
            importer,
            mailer,
            analyzer,
            _dir: dir,
        }
    }

    fn request(list_id: &str, force: bool) -> AnalysisRequest {
        AnalysisRequest {
            list: sample_list(list_id, true, false),
            user_email: "foo@bar.com".to_string(),
            force_recompute: force,
        }
    }

    #[tokio::test]
    async fn fresh_stats_are_reused_without_importing() {
        let h = harness(&[]).await;
        database::upsert_email_list(&h.pool, &sample_list("l1", true, false))
            .await
            .unwrap();
        database::insert_list_stats(&h.pool, "l1", Utc::now(), &sample_calculations(80, 0.3))
            .await
            .unwrap();

        h.analyzer.init_list_analysis(&request("l1", false)).await.unwrap();

        assert_eq!(h.importer.call_count(), 0);
        let sent = h.mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].template, "report-email");
    }

    #[tokio::test]
    async fn stale_stats_trigger_a_recompute() {
        let h = harness(&[]).await;
        database::upsert_email_list(&h.pool, &sample_list("l1", true, false))
            .await
            .unwrap();
        database::insert_list_stats(
            &h.pool,
            "l1",
            Utc::now() - Duration::days(40),
            &sample_calculations(80, 0.3),
        )
        .await
        .unwrap();

        h.analyzer.init_list_analysis(&request("l1", false)).await.unwrap();

        assert_eq!(h.importer.call_count(), 1);
        let analyses = database::latest_analyses(&h.pool, "l1", 5).await.unwrap();
        assert_eq!(analyses.len(), 2, "recompute appends, never overwrites");
    }

    #[tokio::test]
    async fn force_recompute_overrides_freshness() {
        let h = harness(&[]).await;
        database::upsert_email_list(&h.pool, &sample_list("l1", true, false))
            .await
            .unwrap();
        database::insert_list_stats(&h.pool, "l1", Utc::now(), &sample_calculations(80, 0.3))
            .await
            .unwrap();

        h.analyzer.init_list_analysis(&request("l1", true)).await.unwrap();
        assert_eq!(h.importer.call_count(), 1);
    }

    #[tokio::test]
    async fn import_failure_notifies_and_persists_nothing() {
        let h = harness(&["l1"]).await;

        let result = h.analyzer.init_list_analysis(&request("l1", false)).await;
        assert!(result.is_err());

        let analyses = database::latest_analyses(&h.pool, "l1", 5).await.unwrap();
        assert!(analyses.is_empty(), "a failed import must not persist a row");

        let sent = h.mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].template, "error-email");
        assert_eq!(
            sent[0].recipients,
            vec![
                "foo@bar.com".to_string(),
                "admin@benchmarks.example".to_string()
            ]
        );
        assert_eq!(
            sent[0].context["error_details"],
            "API key is no longer valid or list no longer exists."
        );
    }

    #[tokio::test]
    async fn analysis_reconciles_permissions_and_associates_user() {
        let h = harness(&[]).await;
        // Originally registered with both permissions off.
        database::upsert_email_list(&h.pool, &sample_list("l1", false, false))
            .await
            .unwrap();
        database::insert_list_stats(&h.pool, "l1", Utc::now(), &sample_calculations(80, 0.3))
            .await
            .unwrap();

        let mut req = request("l1", false);
        req.list.store_aggregates = true;
        req.list.monthly_updates = true;
        h.analyzer.init_list_analysis(&req).await.unwrap();

        let stored = database::get_email_list(&h.pool, "l1").await.unwrap().unwrap();
        assert!(stored.store_aggregates);
        assert!(stored.monthly_updates);
        assert_eq!(
            database::list_recipients(&h.pool, "l1").await.unwrap(),
            vec!["foo@bar.com".to_string()]
        );
    }

    #[tokio::test]
    async fn sweep_aborts_on_first_failing_list() {
        let h = harness(&["list-a"]).await;
        database::upsert_email_list(&h.pool, &sample_list("list-a", true, false))
            .await
            .unwrap();
        database::upsert_email_list(&h.pool, &sample_list("list-b", true, false))
            .await
            .unwrap();

        let result = h.analyzer.update_stored_data().await;
        assert!(result.is_err());

        // list-a failed first (deterministic order), so list-b was never
        // attempted and neither list gained a row.
        assert_eq!(h.importer.calls(), vec!["list-a".to_string()]);
        assert!(database::latest_analyses(&h.pool, "list-a", 5)
            .await
            .unwrap()
            .is_empty());
        assert!(database::latest_analyses(&h.pool, "list-b", 5)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn sweep_skips_fresh_lists() {
        let h = harness(&[]).await;
        database::upsert_email_list(&h.pool, &sample_list("l1", true, false))
            .await
            .unwrap();
        database::insert_list_stats(&h.pool, "l1", Utc::now(), &sample_calculations(80, 0.3))
            .await
            .unwrap();

        h.analyzer.update_stored_data().await.unwrap();
        assert_eq!(h.importer.call_count(), 0);
    }

    #[tokio::test]
    async fn sweep_emails_monthly_update_lists_it_touched() {
        let h = harness(&[]).await;
        database::upsert_email_list(&h.pool, &sample_list("l1", true, true))
            .await
            .unwrap();
        database::associate_user_with_list(&h.pool, "owner@bar.com", "l1")
            .await
            .unwrap();
        database::insert_list_stats(
            &h.pool,
            "l1",
            Utc::now() - Duration::days(60),
            &sample_calculations(80, 0.3),
        )
        .await
        .unwrap();

        h.analyzer.update_stored_data().await.unwrap();

        assert_eq!(h.importer.call_count(), 1);
        let sent = h.mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].template, "report-email");
        assert_eq!(sent[0].recipients, vec!["owner@bar.com".to_string()]);
    }

    #[tokio::test]
    async fn monthly_reports_come_from_stored_history() {
        let h = harness(&[]).await;
        database::upsert_email_list(&h.pool, &sample_list("l1", true, true))
            .await
            .unwrap();
        database::associate_user_with_list(&h.pool, "owner@bar.com", "l1")
            .await
            .unwrap();
        database::insert_list_stats(&h.pool, "l1", Utc::now(), &sample_calculations(80, 0.3))
            .await
            .unwrap();

        h.analyzer.send_monthly_reports().await.unwrap();

        assert_eq!(h.importer.call_count(), 0, "reports come from storage alone");
        let sent = h.mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipients, vec!["owner@bar.com".to_string()]);
    }
}
