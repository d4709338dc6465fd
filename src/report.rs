use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::aggregates::{generate_diffs, MetricSeries};
use crate::mailer::Mailer;
use crate::models::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    Bar,
    StackedBar,
    Histogram,
    Donut,
}

/// One chart payload handed to the external rendering collaborator.
/// `series` is an ordered sequence of (label, values) pairs so the renderer
/// draws categories in a stable order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartSpec {
    pub kind: ChartKind,
    pub title: String,
    pub series: Vec<(String, Vec<f64>)>,
    /// Cross-list mean values the list is compared against, one (label,
    /// values) entry per plotted category so multi-category charts pair
    /// every segment with its database average.
    pub comparison: Vec<(String, Vec<f64>)>,
    /// Percent-change annotations, one per period; empty with one period.
    pub diff_labels: Vec<String>,
    pub percentage: bool,
    pub output_name: String,
}

/// Seam for the external drawing collaborator: takes a chart payload,
/// produces an image artifact, returns where it put it.
#[async_trait]
pub trait ChartRenderer: Send + Sync {
    async fn draw(&self, spec: &ChartSpec) -> Result<PathBuf>;
}

/// Default renderer: writes each chart payload as a JSON artifact under the
/// output directory for the image-rendering service to pick up.
pub struct ChartSpecWriter {
    directory: PathBuf,
    pretty: bool,
}

impl ChartSpecWriter {
    pub fn new(directory: impl Into<PathBuf>, pretty: bool) -> Self {
        Self {
            directory: directory.into(),
            pretty,
        }
    }
}

#[async_trait]
impl ChartRenderer for ChartSpecWriter {
    async fn draw(&self, spec: &ChartSpec) -> Result<PathBuf> {
        let path = self.directory.join(format!("{}.json", spec.output_name));
        let payload = if self.pretty {
            serde_json::to_vec_pretty(spec)?
        } else {
            serde_json::to_vec(spec)?
        };
        tokio::fs::create_dir_all(&self.directory).await?;
        tokio::fs::write(&path, payload).await?;
        debug!("Wrote chart payload: {}", path.display());
        Ok(path)
    }
}

pub struct ReportComposer {
    renderer: Arc<dyn ChartRenderer>,
    mailer: Arc<dyn Mailer>,
    configuration_set: Option<String>,
}

impl ReportComposer {
    pub fn new(
        renderer: Arc<dyn ChartRenderer>,
        mailer: Arc<dyn Mailer>,
        configuration_set: Option<String>,
    ) -> Self {
        Self {
            renderer,
            mailer,
            configuration_set,
        }
    }

    /// Build the six chart payloads, render them, and email the report.
    /// Renderer and mailer failures propagate unmodified; no local retry.
    pub async fn send_report(
        &self,
        list_stats: &MetricSeries,
        agg_stats: &MetricSeries,
        hist_bin_counts: &[i64],
        list_id: &str,
        list_name: &str,
        recipients: &[String],
    ) -> Result<()> {
        let periods = |stats: &MetricSeries| {
            stats
                .get("subscribers")
                .map(|values| values.len())
                .unwrap_or(0)
        };
        // Trend annotations need a genuine prior period on both sides.
        let diffs = if periods(list_stats) >= 2 && periods(agg_stats) >= 2 {
            generate_diffs(list_stats, agg_stats)
        } else {
            Default::default()
        };

        let values = |stats: &MetricSeries, metric: &str| -> Vec<f64> {
            stats.get(metric).cloned().unwrap_or_default()
        };
        let labels = |metric: &str| -> Vec<String> {
            diffs.get(metric).cloned().unwrap_or_default()
        };

        let share_segments = |values: &[f64]| -> Vec<f64> {
            let share = values.first().copied().unwrap_or(0.0);
            vec![share, 1.0 - share]
        };
        let average = |metric: &str| -> Vec<(String, Vec<f64>)> {
            vec![("Database Average".to_string(), values(agg_stats, metric))]
        };

        let charts = vec![
            ChartSpec {
                kind: ChartKind::Bar,
                title: "Chart A: List Size vs. Database Average (Mean)".to_string(),
                series: vec![("Your List".to_string(), values(list_stats, "subscribers"))],
                comparison: average("subscribers"),
                diff_labels: labels("subscribers"),
                percentage: false,
                output_name: format!("{}_size", list_id),
            },
            ChartSpec {
                kind: ChartKind::StackedBar,
                title: "Chart B: List Composition vs. Database Average (Mean)".to_string(),
                series: vec![
                    ("Subscribed %".to_string(), values(list_stats, "subscribed_pct")),
                    (
                        "Unsubscribed %".to_string(),
                        values(list_stats, "unsubscribed_pct"),
                    ),
                    ("Cleaned %".to_string(), values(list_stats, "cleaned_pct")),
                    ("Pending %".to_string(), values(list_stats, "pending_pct")),
                ],
                comparison: vec![
                    ("Subscribed %".to_string(), values(agg_stats, "subscribed_pct")),
                    (
                        "Unsubscribed %".to_string(),
                        values(agg_stats, "unsubscribed_pct"),
                    ),
                    ("Cleaned %".to_string(), values(agg_stats, "cleaned_pct")),
                    ("Pending %".to_string(), values(agg_stats, "pending_pct")),
                ],
                diff_labels: labels("subscribed_pct"),
                percentage: true,
                output_name: format!("{}_breakdown", list_id),
            },
            ChartSpec {
                kind: ChartKind::Bar,
                title: "Chart C: List Open Rate vs. Database Average (Mean)".to_string(),
                series: vec![("Your List".to_string(), values(list_stats, "open_rate"))],
                comparison: average("open_rate"),
                diff_labels: labels("open_rate"),
                percentage: true,
                output_name: format!("{}_open_rate", list_id),
            },
            ChartSpec {
                kind: ChartKind::Histogram,
                title: "Chart D: Distribution of Subscriber Unique Open Rates".to_string(),
                series: vec![(
                    "Subscribers".to_string(),
                    hist_bin_counts.iter().map(|c| *c as f64).collect(),
                )],
                comparison: Vec::new(),
                diff_labels: Vec::new(),
                percentage: false,
                output_name: format!("{}_open_rate_histogram", list_id),
            },
            ChartSpec {
                kind: ChartKind::Donut,
                title: "Chart E: Share of Subscribers with Unique Open Rate >80%".to_string(),
                series: vec![(
                    "Your List".to_string(),
                    share_segments(&values(list_stats, "high_open_rt_pct")),
                )],
                comparison: average("high_open_rt_pct"),
                diff_labels: labels("high_open_rt_pct"),
                percentage: true,
                output_name: format!("{}_high_open_rt", list_id),
            },
            ChartSpec {
                kind: ChartKind::Donut,
                title: "Chart F: Share of Subscribers Inactive in the Last 365 Days".to_string(),
                series: vec![(
                    "Your List".to_string(),
                    share_segments(&values(list_stats, "cur_yr_inactive_pct")),
                )],
                comparison: average("cur_yr_inactive_pct"),
                diff_labels: labels("cur_yr_inactive_pct"),
                percentage: true,
                output_name: format!("{}_cur_yr_inactive", list_id),
            },
        ];

        let mut artifacts = Vec::with_capacity(charts.len());
        for chart in &charts {
            let path = self.renderer.draw(chart).await?;
            artifacts.push(path.to_string_lossy().to_string());
        }

        let context = json!({
            "title": format!("We've analyzed the {} list!", list_name),
            "list_id": list_id,
            "charts": artifacts,
            "epoch_time": chrono::Utc::now().timestamp(),
        });

        self.mailer
            .send(
                "Your Email Benchmarking Report is Ready!",
                recipients,
                "report-email",
                &context,
                self.configuration_set.as_deref(),
            )
            .await?;

        info!(
            "Report for list {} sent to {} recipient(s)",
            list_id,
            recipients.len()
        );
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::database::METRICS;

    fn periods(values: &[f64]) -> MetricSeries {
        METRICS
            .iter()
            .map(|m| (m.to_string(), values.to_vec()))
            .collect()
    }

    fn composer() -> (Arc<RecordingRenderer>, Arc<RecordingMailer>, ReportComposer) {
        let renderer = Arc::new(RecordingRenderer::default());
        let mailer = Arc::new(RecordingMailer::default());
        let composer = ReportComposer::new(renderer.clone(), mailer.clone(), None);
        (renderer, mailer, composer)
    }

    #[tokio::test]
    async fn single_period_report_has_no_trend_annotations() {
        let (renderer, mailer, composer) = composer();
        composer
            .send_report(
                &periods(&[0.5]),
                &periods(&[0.4]),
                &[1, 2, 3],
                "l1",
                "Newsletter",
                &["foo@bar.com".to_string()],
            )
            .await
            .unwrap();

        let drawn = renderer.drawn.lock().unwrap();
        assert_eq!(drawn.len(), 6);
        for chart in drawn.iter() {
            assert!(
                chart.diff_labels.is_empty(),
                "chart {} carried a diff with only one period",
                chart.output_name
            );
        }
        assert_eq!(mailer.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn two_periods_annotate_charts_with_diffs() {
        let (renderer, _mailer, composer) = composer();
        composer
            .send_report(
                &periods(&[2.0, 3.0]),
                &periods(&[1.0, 2.0]),
                &[1, 2, 3],
                "l1",
                "Newsletter",
                &["foo@bar.com".to_string()],
            )
            .await
            .unwrap();

        let drawn = renderer.drawn.lock().unwrap();
        let size_chart = drawn
            .iter()
            .find(|c| c.output_name == "l1_size")
            .expect("size chart");
        assert_eq!(size_chart.diff_labels, vec!["+100.0%", "+50.0%"]);
        // The histogram is single-period by nature and never annotated.
        let histogram = drawn
            .iter()
            .find(|c| c.output_name == "l1_open_rate_histogram")
            .expect("histogram");
        assert!(histogram.diff_labels.is_empty());
    }

    #[tokio::test]
    async fn stacked_chart_pairs_every_category_with_its_average() {
        let (renderer, _mailer, composer) = composer();
        composer
            .send_report(
                &periods(&[0.5]),
                &periods(&[0.4]),
                &[1, 2, 3],
                "l1",
                "Newsletter",
                &["foo@bar.com".to_string()],
            )
            .await
            .unwrap();

        let drawn = renderer.drawn.lock().unwrap();
        let breakdown = drawn
            .iter()
            .find(|c| c.output_name == "l1_breakdown")
            .expect("breakdown chart");
        let series_labels: Vec<_> = breakdown.series.iter().map(|(l, _)| l.clone()).collect();
        let comparison_labels: Vec<_> =
            breakdown.comparison.iter().map(|(l, _)| l.clone()).collect();
        assert_eq!(comparison_labels, series_labels);
        for (label, values) in &breakdown.comparison {
            assert_eq!(values, &vec![0.4], "comparison for {}", label);
        }

        let size_chart = drawn
            .iter()
            .find(|c| c.output_name == "l1_size")
            .expect("size chart");
        assert_eq!(size_chart.comparison.len(), 1);
        assert_eq!(size_chart.comparison[0].0, "Database Average");
    }

    #[tokio::test]
    async fn report_email_carries_title_and_chart_artifacts() {
        let (_renderer, mailer, composer) = composer();
        composer
            .send_report(
                &periods(&[0.5]),
                &periods(&[0.4]),
                &[0; 10],
                "l1",
                "Newsletter",
                &["a@b.com".to_string(), "c@d.com".to_string()],
            )
            .await
            .unwrap();

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let email = &sent[0];
        assert_eq!(email.template, "report-email");
        assert_eq!(email.recipients.len(), 2);
        assert_eq!(
            email.context["title"],
            "We've analyzed the Newsletter list!"
        );
        assert_eq!(email.context["charts"].as_array().unwrap().len(), 6);
    }
}
